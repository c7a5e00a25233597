//! Video decoder wrapper: one driver group turning a compressed stream
//! into raw frames on up to several output channels.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use axon_core::driver::{
    ChannelId, Codec, DeviceContext, GroupId, GroupSpec, ModuleKind, StreamAddr, StreamPacket,
};
use axon_core::error::{AxonError, Result};
use axon_core::sink::{FrameSink, SinkRegistry};

use crate::dispatch::SelectDispatch;
use crate::group::{
    ChannelGuard, GroupGuard, OutputChannelAttr, reset_group_with_retry, validate_outputs,
};
use crate::link::LinkRegistry;

/// Static decoder configuration, fixed at [`VideoDecoder::init`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecoderAttr {
    pub codec: Codec,
    /// Coded stream geometry.
    pub width: u32,
    pub height: u32,
    /// Pool blocks backing this group's outputs.
    #[serde(default = "default_block_count")]
    pub block_count: u32,
    /// Enabled output channels, indexed by channel id.  Each may carry its
    /// own scaled geometry.
    pub outputs: Vec<OutputChannelAttr>,
}

fn default_block_count() -> u32 {
    8
}

impl DecoderAttr {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AxonError::IllegalParam(format!(
                "vdec: zero stream geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.block_count == 0 {
            return Err(AxonError::IllegalParam(
                "vdec: block count must be > 0".into(),
            ));
        }
        validate_outputs(ModuleKind::Decoder, &self.outputs)
    }
}

/// State machine: `UNINITIALIZED → INITIALIZED → STARTED → (STOPPED =
/// INITIALIZED) → UNINITIALIZED`.  The group handle is valid exactly
/// between `init` and `deinit`; the dispatch worker lives strictly inside
/// the `start`/`stop` window.
pub struct VideoDecoder {
    ctx: Arc<DeviceContext>,
    attr: Option<DecoderAttr>,
    group: Option<GroupId>,
    sinks: Vec<Arc<SinkRegistry>>,
    dispatch: Option<SelectDispatch>,
    started: bool,
}

impl VideoDecoder {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            attr: None,
            group: None,
            sinks: Vec::new(),
            dispatch: None,
            started: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.group.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Create the group and enable every configured output channel, in
    /// order.  Any failure rolls back what was already enabled and
    /// destroys the group; on error the wrapper is back to UNINITIALIZED
    /// with nothing for the caller to clean up.
    pub fn init(&mut self, attr: DecoderAttr) -> Result<()> {
        if self.group.is_some() {
            return Err(AxonError::IllegalParam(
                "vdec: already initialized".into(),
            ));
        }
        attr.validate()?;

        let driver = self.ctx.driver().clone();
        let group = driver.create_group(
            ModuleKind::Decoder,
            &GroupSpec {
                codec: Some(attr.codec),
                width: attr.width,
                height: attr.height,
                block_count: attr.block_count,
                gop_length: 0,
            },
        )?;
        let mut group_guard = GroupGuard::new(driver.as_ref(), ModuleKind::Decoder, group);
        let mut channel_guards = Vec::with_capacity(attr.outputs.len());
        for (idx, out) in attr.outputs.iter().enumerate() {
            let addr = StreamAddr::new(ModuleKind::Decoder, group, ChannelId(idx as u32));
            driver.enable_channel(addr, &out.to_channel_spec())?;
            channel_guards.push(ChannelGuard::new(driver.as_ref(), addr));
        }
        for guard in &mut channel_guards {
            guard.disarm();
        }
        group_guard.disarm();

        self.sinks = (0..attr.outputs.len())
            .map(|idx| {
                SinkRegistry::new(StreamAddr::new(
                    ModuleKind::Decoder,
                    group,
                    ChannelId(idx as u32),
                ))
            })
            .collect();
        info!(group = %group, codec = ?attr.codec, outputs = attr.outputs.len(),
            "decoder initialized");
        self.attr = Some(attr);
        self.group = Some(group);
        Ok(())
    }

    /// Disable channels, destroy the group, invalidate the handle.
    /// Best-effort: every step is attempted, the first error is returned.
    /// A no-op success on an uninitialized wrapper.
    pub fn deinit(&mut self) -> Result<()> {
        if self.started {
            warn!("vdec: deinit while started; stopping first");
            if let Err(err) = self.stop() {
                warn!(%err, "vdec: implicit stop failed");
            }
        }
        let Some(group) = self.group.take() else {
            return Ok(());
        };
        let driver = self.ctx.driver();
        let mut first_err = None;
        for idx in 0..self.sinks.len() {
            let addr = StreamAddr::new(ModuleKind::Decoder, group, ChannelId(idx as u32));
            if let Err(err) = driver.disable_channel(addr) {
                warn!(%addr, %err, "vdec: channel disable failed");
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = driver.destroy_group(ModuleKind::Decoder, group) {
            warn!(group = %group, %err, "vdec: group destroy failed");
            first_err.get_or_insert(err);
        }
        self.sinks.clear();
        self.attr = None;
        info!(group = %group, "decoder deinitialized");
        first_err.map_or(Ok(()), Err)
    }

    /// Start receiving and spawn the select dispatch worker over the
    /// output channels that are not hardware-linked.  Sinks registered
    /// before `start` are picked up by the worker as it comes up.
    pub fn start(&mut self, links: &LinkRegistry) -> Result<()> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Decoder,
        })?;
        if self.started {
            warn!(group = %group, "vdec: start on a started decoder ignored");
            return Ok(());
        }
        let driver = self.ctx.driver();
        driver.start_receive(ModuleKind::Decoder, group)?;

        let unlinked: Vec<(StreamAddr, Arc<SinkRegistry>)> = self
            .sinks
            .iter()
            .enumerate()
            .map(|(idx, sinks)| {
                (
                    StreamAddr::new(ModuleKind::Decoder, group, ChannelId(idx as u32)),
                    sinks.clone(),
                )
            })
            .filter(|(addr, _)| !links.is_linked_src(*addr))
            .collect();
        if !unlinked.is_empty() {
            match SelectDispatch::spawn(self.ctx.clone(), ModuleKind::Decoder, group, unlinked) {
                Ok(dispatch) => self.dispatch = Some(dispatch),
                Err(err) => {
                    if let Err(stop_err) = driver.stop_receive(ModuleKind::Decoder, group) {
                        warn!(group = %group, %stop_err, "vdec: stop after failed start");
                    }
                    return Err(err);
                }
            }
        }
        self.started = true;
        info!(group = %group, "decoder started");
        Ok(())
    }

    /// Reverse of [`start`]: stop and join the dispatch worker first, then
    /// stop receiving and reset the group (bounded retry on busy).
    /// In-flight frames already delivered to sinks stay valid; no new
    /// frames are produced.
    ///
    /// [`start`]: VideoDecoder::start
    pub fn stop(&mut self) -> Result<()> {
        let Some(group) = self.group else {
            return Ok(());
        };
        if !self.started {
            return Ok(());
        }
        let mut first_err = None;
        if let Some(mut dispatch) = self.dispatch.take()
            && let Err(err) = dispatch.stop()
        {
            warn!(group = %group, %err, "vdec: dispatch stop failed");
            first_err.get_or_insert(err);
        }
        let driver = self.ctx.driver();
        if let Err(err) = driver.stop_receive(ModuleKind::Decoder, group) {
            warn!(group = %group, %err, "vdec: stop receive failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = reset_group_with_retry(driver.as_ref(), ModuleKind::Decoder, group) {
            warn!(group = %group, %err, "vdec: group reset failed");
            first_err.get_or_insert(err);
        }
        self.started = false;
        info!(group = %group, "decoder stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Queue one compressed packet.  An empty payload signals
    /// end-of-stream.
    pub fn send_stream(&self, data: &[u8], pts: i64, timeout: Duration) -> Result<()> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Decoder,
        })?;
        if !self.started {
            return Err(AxonError::NotStarted("decoder"));
        }
        self.ctx
            .driver()
            .send_stream(group, &StreamPacket { data, pts }, timeout)
    }

    pub fn register_sink(&self, channel: ChannelId, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.registry(channel)?.register(sink);
        Ok(())
    }

    pub fn unregister_sink(&self, channel: ChannelId, sink: &Arc<dyn FrameSink>) -> Result<()> {
        self.registry(channel)?.unregister(sink);
        Ok(())
    }

    /// Address of an enabled output channel, for link construction.
    pub fn output_addr(&self, channel: ChannelId) -> Result<StreamAddr> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Decoder,
        })?;
        if channel.0 as usize >= self.sinks.len() {
            return Err(AxonError::IllegalParam(format!(
                "vdec: output channel {channel} is not enabled"
            )));
        }
        Ok(StreamAddr::new(ModuleKind::Decoder, group, channel))
    }

    fn registry(&self, channel: ChannelId) -> Result<&Arc<SinkRegistry>> {
        self.sinks
            .get(channel.0 as usize)
            .ok_or_else(|| AxonError::IllegalParam(format!(
                "vdec: output channel {channel} is not enabled"
            )))
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        if self.group.is_some()
            && let Err(err) = self.deinit()
        {
            warn!(%err, "vdec: deinit on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use axon_sim::{SimCard, SimOp};

    use axon_core::driver::Compression;

    use super::*;

    fn attr() -> DecoderAttr {
        DecoderAttr {
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            block_count: 8,
            outputs: vec![OutputChannelAttr {
                width: 1920,
                height: 1080,
                fifo_depth: 4,
                compression: Compression::None,
            }],
        }
    }

    fn fixture() -> (Arc<SimCard>, VideoDecoder) {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card.clone(), 0);
        (card, VideoDecoder::new(ctx))
    }

    #[test]
    fn init_then_deinit_returns_to_uninitialized() {
        let (card, mut vdec) = fixture();
        vdec.init(attr()).unwrap();
        assert!(vdec.is_initialized());
        assert_eq!(card.group_count(), 1);

        vdec.deinit().unwrap();
        assert!(!vdec.is_initialized());
        assert_eq!(card.group_count(), 0);
        // Idempotent.
        vdec.deinit().unwrap();
    }

    #[test]
    fn zero_fifo_depth_fails_before_any_driver_call() {
        let (card, mut vdec) = fixture();
        let mut bad = attr();
        bad.outputs[0].fifo_depth = 0;
        let err = vdec.init(bad).expect_err("zero depth is fatal");
        assert!(matches!(err, AxonError::IllegalParam(_)));
        assert!(!vdec.is_initialized());
        assert_eq!(card.group_count(), 0, "no partial group to destroy");
    }

    #[test]
    fn failed_channel_enable_rolls_back_the_group() {
        let (card, mut vdec) = fixture();
        card.fail_once(SimOp::EnableChannel);
        vdec.init(attr()).expect_err("injected enable fault");
        assert!(!vdec.is_initialized());
        assert_eq!(card.group_count(), 0, "group destroyed on rollback");
    }

    #[test]
    fn send_before_start_is_not_started() {
        let (_card, mut vdec) = fixture();
        vdec.init(attr()).unwrap();
        let err = vdec
            .send_stream(&[0, 0, 0, 1], 0, Duration::from_millis(10))
            .expect_err("send before start");
        assert!(matches!(err, AxonError::NotStarted(_)));
    }

    #[test]
    fn reset_busy_is_retried_until_it_clears() {
        let (card, mut vdec) = fixture();
        let ctx_links = LinkRegistry::new(DeviceContext::new(card.clone(), 0));
        vdec.init(attr()).unwrap();
        vdec.start(&ctx_links).unwrap();

        // Two transient busy responses, then success.
        card.queue_failure(SimOp::ResetGroup, AxonError::Busy("group reset"));
        card.queue_failure(SimOp::ResetGroup, AxonError::Busy("group reset"));
        vdec.stop().expect("retry must absorb transient busy");
        vdec.deinit().unwrap();
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let (_card, mut vdec) = fixture();
        vdec.init(attr()).unwrap();
        vdec.stop().unwrap();
        vdec.deinit().unwrap();
    }
}
