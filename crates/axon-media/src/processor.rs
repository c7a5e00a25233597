//! Image processor wrapper: one driver group scaling/converting raw
//! frames onto its output channels, usually fed through a hardware link.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use axon_core::driver::{
    ChannelId, DeviceContext, GroupId, GroupSpec, ModuleKind, StreamAddr,
};
use axon_core::error::{AxonError, Result};
use axon_core::frame::VideoFrameDesc;
use axon_core::sink::{FrameSink, SinkRegistry};

use crate::dispatch::ChannelDispatch;
use crate::group::{
    ChannelGuard, GroupGuard, OutputChannelAttr, reset_group_with_retry, validate_outputs,
};
use crate::link::LinkRegistry;

/// Which hardware engine runs the group.  `Auto` lets the driver place the
/// job; the others pin it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorEngine {
    #[default]
    Auto,
    Vpp,
    Gdc,
}

/// Static processor configuration, fixed at [`ImageProcessor::init`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessorAttr {
    /// Input geometry (what the upstream producer delivers).
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub engine: ProcessorEngine,
    #[serde(default = "default_block_count")]
    pub block_count: u32,
    pub outputs: Vec<OutputChannelAttr>,
}

fn default_block_count() -> u32 {
    6
}

impl ProcessorAttr {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AxonError::IllegalParam(format!(
                "ivps: zero input geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.block_count == 0 {
            return Err(AxonError::IllegalParam(
                "ivps: block count must be > 0".into(),
            ));
        }
        validate_outputs(ModuleKind::Processor, &self.outputs)
    }
}

/// Same state machine as the decoder wrapper; output channels get one
/// [`ChannelDispatch`] worker each while unlinked.
pub struct ImageProcessor {
    ctx: Arc<DeviceContext>,
    attr: Option<ProcessorAttr>,
    group: Option<GroupId>,
    sinks: Vec<Arc<SinkRegistry>>,
    dispatch: Vec<ChannelDispatch>,
    started: bool,
}

impl ImageProcessor {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            attr: None,
            group: None,
            sinks: Vec::new(),
            dispatch: Vec::new(),
            started: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.group.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn init(&mut self, attr: ProcessorAttr) -> Result<()> {
        if self.group.is_some() {
            return Err(AxonError::IllegalParam(
                "ivps: already initialized".into(),
            ));
        }
        attr.validate()?;

        let driver = self.ctx.driver().clone();
        let group = driver.create_group(
            ModuleKind::Processor,
            &GroupSpec {
                codec: None,
                width: attr.width,
                height: attr.height,
                block_count: attr.block_count,
                gop_length: 0,
            },
        )?;
        let mut group_guard = GroupGuard::new(driver.as_ref(), ModuleKind::Processor, group);
        let mut channel_guards = Vec::with_capacity(attr.outputs.len());
        for (idx, out) in attr.outputs.iter().enumerate() {
            let addr = StreamAddr::new(ModuleKind::Processor, group, ChannelId(idx as u32));
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
                    ModuleKind::Processor,
                    group,
                    ChannelId(idx as u32),
                ))
            })
            .collect();
        info!(group = %group, engine = ?attr.engine, outputs = attr.outputs.len(),
            "processor initialized");
        self.attr = Some(attr);
        self.group = Some(group);
        Ok(())
    }

    pub fn deinit(&mut self) -> Result<()> {
        if self.started {
            warn!("ivps: deinit while started; stopping first");
            if let Err(err) = self.stop() {
                warn!(%err, "ivps: implicit stop failed");
            }
        }
        let Some(group) = self.group.take() else {
            return Ok(());
        };
        let driver = self.ctx.driver();
        let mut first_err = None;
        for idx in 0..self.sinks.len() {
            let addr = StreamAddr::new(ModuleKind::Processor, group, ChannelId(idx as u32));
            if let Err(err) = driver.disable_channel(addr) {
                warn!(%addr, %err, "ivps: channel disable failed");
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = driver.destroy_group(ModuleKind::Processor, group) {
            warn!(group = %group, %err, "ivps: group destroy failed");
            first_err.get_or_insert(err);
        }
        self.sinks.clear();
        self.attr = None;
        info!(group = %group, "processor deinitialized");
        first_err.map_or(Ok(()), Err)
    }

    /// Start receiving, then one dispatch worker per enabled output
    /// channel without a hardware link.  A failure partway stops whatever
    /// already started and returns the first error.
    pub fn start(&mut self, links: &LinkRegistry) -> Result<()> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Processor,
        })?;
        if self.started {
            warn!(group = %group, "ivps: start on a started processor ignored");
            return Ok(());
        }
        let driver = self.ctx.driver();
        driver.start_receive(ModuleKind::Processor, group)?;

        for (idx, sinks) in self.sinks.iter().enumerate() {
            let addr = StreamAddr::new(ModuleKind::Processor, group, ChannelId(idx as u32));
            if links.is_linked_src(addr) {
                continue;
            }
            match ChannelDispatch::spawn(self.ctx.clone(), addr, sinks.clone()) {
                Ok(dispatch) => self.dispatch.push(dispatch),
                Err(err) => {
                    for mut started in self.dispatch.drain(..) {
                        if let Err(stop_err) = started.stop() {
                            warn!(%stop_err, "ivps: stop after failed start");
                        }
                    }
                    if let Err(stop_err) = driver.stop_receive(ModuleKind::Processor, group) {
                        warn!(group = %group, %stop_err, "ivps: stop after failed start");
                    }
                    return Err(err);
                }
            }
        }
        self.started = true;
        info!(group = %group, "processor started");
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
        for mut dispatch in self.dispatch.drain(..) {
            if let Err(err) = dispatch.stop() {
                warn!(group = %group, %err, "ivps: dispatch stop failed");
                first_err.get_or_insert(err);
            }
        }
        let driver = self.ctx.driver();
        if let Err(err) = driver.stop_receive(ModuleKind::Processor, group) {
            warn!(group = %group, %err, "ivps: stop receive failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = reset_group_with_retry(driver.as_ref(), ModuleKind::Processor, group) {
            warn!(group = %group, %err, "ivps: group reset failed");
            first_err.get_or_insert(err);
        }
        self.started = false;
        info!(group = %group, "processor stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Feed one raw frame through software (used when the input is not
    /// hardware-linked).
    pub fn send_frame(&self, frame: &VideoFrameDesc, timeout: Duration) -> Result<()> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Processor,
        })?;
        if !self.started {
            return Err(AxonError::NotStarted("processor"));
        }
        self.ctx
            .driver()
            .send_frame(ModuleKind::Processor, group, frame, timeout)
    }

    pub fn register_sink(&self, channel: ChannelId, sink: Arc<dyn FrameSink>) -> Result<()> {
        self.registry(channel)?.register(sink);
        Ok(())
    }

    pub fn unregister_sink(&self, channel: ChannelId, sink: &Arc<dyn FrameSink>) -> Result<()> {
        self.registry(channel)?.unregister(sink);
        Ok(())
    }

    /// Input-side address, for links terminating at this group.
    pub fn input_addr(&self) -> Result<StreamAddr> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Processor,
        })?;
        Ok(StreamAddr::new(ModuleKind::Processor, group, ChannelId(0)))
    }

    pub fn output_addr(&self, channel: ChannelId) -> Result<StreamAddr> {
        let group = self.group.ok_or(AxonError::InvalidHandle {
            module: ModuleKind::Processor,
        })?;
        if channel.0 as usize >= self.sinks.len() {
            return Err(AxonError::IllegalParam(format!(
                "ivps: output channel {channel} is not enabled"
            )));
        }
        Ok(StreamAddr::new(ModuleKind::Processor, group, channel))
    }

    fn registry(&self, channel: ChannelId) -> Result<&Arc<SinkRegistry>> {
        self.sinks
            .get(channel.0 as usize)
            .ok_or_else(|| AxonError::IllegalParam(format!(
                "ivps: output channel {channel} is not enabled"
            )))
    }
}

impl Drop for ImageProcessor {
    fn drop(&mut self) {
        if self.group.is_some()
            && let Err(err) = self.deinit()
        {
            warn!(%err, "ivps: deinit on drop failed");
        }
    }
}
