//! Video encoder wrapper: one driver group turning raw frames into an
//! encoded stream on its single output channel.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use axon_core::driver::{
    ChannelId, Codec, Compression, DeviceContext, GroupId, GroupSpec, ModuleKind, StreamAddr,
};
use axon_core::error::{AxonError, Result};
use axon_core::frame::VideoFrameDesc;
use axon_core::sink::{FrameSink, SinkRegistry};

use crate::dispatch::ChannelDispatch;
use crate::group::{ChannelGuard, GroupGuard, reset_group_with_retry};
use crate::link::LinkRegistry;

/// Static encoder configuration, fixed at [`VideoEncoder::init`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncoderAttr {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Keyframe interval in frames (0 = driver default).
    #[serde(default)]
    pub gop_length: u32,
    #[serde(default = "default_block_count")]
    pub block_count: u32,
    /// Stream fifo depth between hardware completion and pickup.  Must be
    /// > 0 — with no queue, encoded chunks would have nowhere to sit.
    #[serde(default = "default_fifo_depth")]
    pub fifo_depth: u32,
}

// Sized above the stream fifo so a full fifo plus frames held by consumers
// cannot exhaust the pool.
fn default_block_count() -> u32 {
    12
}

fn default_fifo_depth() -> u32 {
    8
}

impl EncoderAttr {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AxonError::IllegalParam(format!(
                "venc: zero geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.block_count == 0 {
            return Err(AxonError::IllegalParam(
                "venc: block count must be > 0".into(),
            ));
        }
        if self.fifo_depth == 0 {
            return Err(AxonError::IllegalParam(
                "venc: fifo depth must be > 0 on an enabled channel".into(),
            ));
        }
        Ok(())
    }
}

/// Same state machine as the other wrappers, with exactly one output
/// channel (channel 0) carrying the encoded stream.
pub struct VideoEncoder {
    ctx: Arc<DeviceContext>,
    attr: Option<EncoderAttr>,
    group: Option<GroupId>,
    sinks: Option<Arc<SinkRegistry>>,
    dispatch: Option<ChannelDispatch>,
    started: bool,
}

impl VideoEncoder {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            attr: None,
            group: None,
            sinks: None,
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

    pub fn init(&mut self, attr: EncoderAttr) -> Result<()> {
        if self.group.is_some() {
            return Err(AxonError::IllegalParam(
                "venc: already initialized".into(),
            ));
        }
        attr.validate()?;

        let driver = self.ctx.driver().clone();
        let group = driver.create_group(
            ModuleKind::Encoder,
            &GroupSpec {
                codec: Some(attr.codec),
                width: attr.width,
                height: attr.height,
                block_count: attr.block_count,
                gop_length: attr.gop_length,
            },
        )?;
        let mut group_guard = GroupGuard::new(driver.as_ref(), ModuleKind::Encoder, group);
        let addr = StreamAddr::new(ModuleKind::Encoder, group, ChannelId(0));
        driver.enable_channel(
            addr,
            &axon_core::driver::ChannelSpec {
                width: attr.width,
                height: attr.height,
                fifo_depth: attr.fifo_depth,
                compression: Compression::None,
            },
        )?;
        let mut channel_guard = ChannelGuard::new(driver.as_ref(), addr);
        channel_guard.disarm();
        group_guard.disarm();

        self.sinks = Some(SinkRegistry::new(addr));
        info!(group = %group, codec = ?attr.codec, "encoder initialized");
        self.attr = Some(attr);
        self.group = Some(group);
        Ok(())
    }

    pub fn deinit(&mut self) -> Result<()> {
        if self.started {
            warn!("venc: deinit while started; stopping first");
            if let Err(err) = self.stop() {
                warn!(%err, "venc: implicit stop failed");
            }
        }
        let Some(group) = self.group.take() else {
            return Ok(());
        };
        let driver = self.ctx.driver();
        let mut first_err = None;
        let addr = StreamAddr::new(ModuleKind::Encoder, group, ChannelId(0));
        if let Err(err) = driver.disable_channel(addr) {
            warn!(%addr, %err, "venc: channel disable failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = driver.destroy_group(ModuleKind::Encoder, group) {
            warn!(group = %group, %err, "venc: group destroy failed");
            first_err.get_or_insert(err);
        }
        self.sinks = None;
        self.attr = None;
        info!(group = %group, "encoder deinitialized");
        first_err.map_or(Ok(()), Err)
    }

    pub fn start(&mut self, links: &LinkRegistry) -> Result<()> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Encoder,
        })?;
        if self.started {
            warn!(group = %group, "venc: start on a started encoder ignored");
            return Ok(());
        }
        let driver = self.ctx.driver();
        driver.start_receive(ModuleKind::Encoder, group)?;

        let addr = StreamAddr::new(ModuleKind::Encoder, group, ChannelId(0));
        if !links.is_linked_src(addr) {
            let sinks = self
                .sinks
                .clone()
                .ok_or(AxonError::InvalidHandle {
                    module: ModuleKind::Encoder,
                })?;
            match ChannelDispatch::spawn(self.ctx.clone(), addr, sinks) {
                Ok(dispatch) => self.dispatch = Some(dispatch),
                Err(err) => {
                    if let Err(stop_err) = driver.stop_receive(ModuleKind::Encoder, group) {
                        warn!(group = %group, %stop_err, "venc: stop after failed start");
                    }
                    return Err(err);
                }
            }
        }
        self.started = true;
        info!(group = %group, "encoder started");
        Ok(())
    }

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
            warn!(group = %group, %err, "venc: dispatch stop failed");
            first_err.get_or_insert(err);
        }
        let driver = self.ctx.driver();
        if let Err(err) = driver.stop_receive(ModuleKind::Encoder, group) {
            warn!(group = %group, %err, "venc: stop receive failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = reset_group_with_retry(driver.as_ref(), ModuleKind::Encoder, group) {
            warn!(group = %group, %err, "venc: group reset failed");
            first_err.get_or_insert(err);
        }
        self.started = false;
        info!(group = %group, "encoder stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Feed one raw frame through software (used when the input is not
    /// hardware-linked).
    pub fn send_frame(&self, frame: &VideoFrameDesc, timeout: Duration) -> Result<()> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Encoder,
        })?;
        if !self.started {
            return Err(AxonError::NotStarted("encoder"));
        }
        self.ctx
            .driver()
            .send_frame(ModuleKind::Encoder, group, frame, timeout)
    }

    pub fn register_sink(&self, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.registry()?.register(sink);
        Ok(())
    }

    pub fn unregister_sink(&self, sink: &Arc<dyn FrameSink>) -> Result<()> {
        self.registry()?.unregister(sink);
        Ok(())
    }

    /// Input-side address, for links terminating at this group.
    pub fn input_addr(&self) -> Result<StreamAddr> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Encoder,
        })?;
        Ok(StreamAddr::new(ModuleKind::Encoder, group, ChannelId(0)))
    }

    /// Encoded-stream output address.
    pub fn output_addr(&self) -> Result<StreamAddr> {
        self.input_addr()
    }

    fn registry(&self) -> Result<&Arc<SinkRegistry>> {
        self.sinks.as_ref().ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Encoder,
        })
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        if self.group.is_some()
            && let Err(err) = self.deinit()
        {
            warn!(%err, "venc: deinit on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    use axon_sim::SimCard;

    use axon_core::driver::PixelFormat;
    use axon_core::frame::Frame;

    use super::*;

    struct Collector {
        frames: Mutex<Vec<Frame>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl FrameSink for Collector {
        fn on_frame(&self, frame: Frame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn attr() -> EncoderAttr {
        EncoderAttr {
            codec: Codec::Hevc,
            width: 1280,
            height: 720,
            gop_length: 30,
            block_count: 8,
            fifo_depth: 8,
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn frame(pts: i64) -> VideoFrameDesc {
        VideoFrameDesc {
            width: 1280,
            height: 720,
            format: PixelFormat::Nv12,
            pts,
            seq: 0,
        }
    }

    #[test]
    fn duplicate_sink_registration_delivers_once_per_chunk() {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card.clone(), 0);
        let links = LinkRegistry::new(ctx.clone());
        let mut venc = VideoEncoder::new(ctx);
        venc.init(attr()).unwrap();

        let sink = Collector::new();
        venc.register_sink(sink.clone()).unwrap();
        venc.register_sink(sink.clone()).unwrap();
        venc.start(&links).unwrap();

        venc.send_frame(&frame(500), Duration::from_millis(100))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || sink.count() >= 1));
        // Give a duplicate delivery time to show up if the registry were
        // broken, then confirm there is exactly one.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.count(), 1, "idempotent registration");

        venc.stop().unwrap();
        venc.deinit().unwrap();
    }

    #[test]
    fn in_flight_chunks_survive_stop() {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card.clone(), 0);
        let links = LinkRegistry::new(ctx.clone());
        let mut venc = VideoEncoder::new(ctx);
        venc.init(attr()).unwrap();
        let sink = Collector::new();
        venc.register_sink(sink.clone()).unwrap();
        venc.start(&links).unwrap();

        venc.send_frame(&frame(1), Duration::from_millis(100))
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || sink.count() == 1));

        venc.stop().unwrap();
        // The delivered frame's pool blocks are still pinned by the sink's
        // clone; the payload stays readable after stop.
        let frames = sink.frames.lock().unwrap();
        let chunk = frames[0].stream().expect("encoded chunk");
        assert!(!chunk.data.is_empty());
        assert_eq!(chunk.pts, 1);
        drop(frames);

        venc.deinit().unwrap();
        sink.frames.lock().unwrap().clear();
        assert_eq!(card.outstanding_blocks(), 0, "refs balanced after release");
    }

    #[test]
    fn zero_fifo_depth_is_rejected_before_driver_calls() {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card.clone(), 0);
        let mut venc = VideoEncoder::new(ctx);
        let mut bad = attr();
        bad.fifo_depth = 0;
        let err = venc.init(bad).expect_err("zero depth");
        assert!(matches!(err, AxonError::IllegalParam(_)));
        assert_eq!(card.group_count(), 0);
    }
}
