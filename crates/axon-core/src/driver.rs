//! The card-driver boundary.
//!
//! The vendor runtime behind the PCIe transport is an opaque call contract:
//! group/channel lifecycle, blocking frame polls, link edges, pool-block
//! reference counts.  [`Driver`] expresses that contract as a trait so the
//! layers above it (module wrappers, dispatch workers, the link registry)
//! never name a vendor symbol.  The default implementation is the software
//! card in `axon-sim`; a hardware binding would implement the same trait.
//!
//! [`DeviceContext`] replaces the ambient singletons a C SDK would keep: it
//! owns the driver handle plus the device ordinal and is threaded explicitly
//! through every constructor.  Worker threads attach to the device through
//! [`DeviceContext::attach_current_thread`], which yields a guard releasing
//! the per-thread transport context on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frame::FramePayload;

// ─── Typed ids ───────────────────────────────────────────────────────────

/// Which hardware unit a group belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleKind {
    /// Video decoder (compressed stream in, raw frames out).
    Decoder,
    /// Image processor (raw frames in, scaled/converted frames out).
    Processor,
    /// Video encoder (raw frames in, compressed stream out).
    Encoder,
}

impl ModuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decoder => "vdec",
            Self::Processor => "ivps",
            Self::Encoder => "venc",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance of a codec/processor engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One output stream of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle into the driver's reference-counted buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The `(module, group, channel)` triple naming one stream endpoint.
///
/// Link edges run between two of these; dispatch workers poll one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamAddr {
    pub module: ModuleKind,
    pub group: GroupId,
    pub channel: ChannelId,
}

impl StreamAddr {
    pub fn new(module: ModuleKind, group: GroupId, channel: ChannelId) -> Self {
        Self {
            module,
            group,
            channel,
        }
    }
}

impl fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.module, self.group, self.channel)
    }
}

// ─── Driver-level configuration ──────────────────────────────────────────

/// Compressed-stream codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    Hevc,
}

/// Raw-frame pixel layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Nv12,
}

/// Frame-buffer compression applied between hardware units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Fbc,
}

/// Group creation parameters handed to the driver.
#[derive(Clone, Copy, Debug)]
pub struct GroupSpec {
    /// Codec for decoder/encoder groups; `None` for the image processor.
    pub codec: Option<Codec>,
    pub width: u32,
    pub height: u32,
    /// Pool blocks backing this group's outputs.
    pub block_count: u32,
    /// Keyframe interval for encoder groups (0 = driver default).
    pub gop_length: u32,
}

/// Per-output-channel parameters handed to the driver.
#[derive(Clone, Copy, Debug)]
pub struct ChannelSpec {
    pub width: u32,
    pub height: u32,
    /// Driver-side queue depth between hardware completion and pickup.
    pub fifo_depth: u32,
    pub compression: Compression,
}

/// One compressed input packet for [`Driver::send_stream`].
#[derive(Clone, Copy, Debug)]
pub struct StreamPacket<'a> {
    /// Annex-B payload.  Empty marks end-of-stream.
    pub data: &'a [u8],
    /// Presentation timestamp in microseconds.
    pub pts: i64,
}

// ─── Poll results ────────────────────────────────────────────────────────

/// A completed hardware buffer as the driver hands it out.
///
/// The driver keeps its own hold on the backing blocks until
/// [`Driver::release_frame`] is called with `handle`; consumers that need
/// the payload past that point take their own references first.
#[derive(Debug)]
pub struct RawOutput {
    /// Opaque token for the matching `release_frame` call.
    pub handle: u64,
    pub payload: FramePayload,
    /// Pool blocks backing the payload.
    pub blocks: Vec<BlockId>,
}

/// Outcome of a bounded [`Driver::get_frame`] poll.
#[derive(Debug)]
pub enum PollEvent {
    Frame(RawOutput),
    Timeout,
    EndOfStream,
    /// Woken by [`Driver::wake`] — distinct from a timeout so cancellation
    /// is observed promptly.
    Woken,
}

/// Outcome of a multi-channel [`Driver::select`] poll.
#[derive(Debug)]
pub enum SelectOutcome {
    /// Channels with at least one completed buffer or a pending EOS.
    Ready(Vec<StreamAddr>),
    Timeout,
    Woken,
}

// ─── The driver contract ─────────────────────────────────────────────────

/// Call contract consumed from the opaque card runtime.
///
/// All methods are synchronous; `get_frame`/`select`/`send_stream` block up
/// to their timeout.  Implementations are shared across threads.
pub trait Driver: Send + Sync {
    fn create_group(&self, module: ModuleKind, spec: &GroupSpec) -> Result<GroupId>;
    fn destroy_group(&self, module: ModuleKind, group: GroupId) -> Result<()>;

    fn enable_channel(&self, addr: StreamAddr, spec: &ChannelSpec) -> Result<()>;
    fn disable_channel(&self, addr: StreamAddr) -> Result<()>;

    fn start_receive(&self, module: ModuleKind, group: GroupId) -> Result<()>;
    fn stop_receive(&self, module: ModuleKind, group: GroupId) -> Result<()>;
    /// May fail with [`AxonError::Busy`](crate::error::AxonError::Busy)
    /// transiently while hardware drains.
    fn reset_group(&self, module: ModuleKind, group: GroupId) -> Result<()>;

    /// Blocking poll for one completed buffer on `addr`.
    fn get_frame(&self, addr: StreamAddr, timeout: Duration) -> Result<PollEvent>;
    /// Return the driver's hold on a buffer previously handed out by
    /// `get_frame`.
    fn release_frame(&self, addr: StreamAddr, handle: u64) -> Result<()>;

    /// Blocking readiness poll across many channels of one module — the
    /// decoder's native multiplexing primitive.
    fn select(
        &self,
        module: ModuleKind,
        candidates: &[StreamAddr],
        timeout: Duration,
    ) -> Result<SelectOutcome>;
    /// Wake every poll blocked on `group` with [`PollEvent::Woken`] /
    /// [`SelectOutcome::Woken`].
    fn wake(&self, module: ModuleKind, group: GroupId) -> Result<()>;

    /// Establish a zero-copy hardware forwarding path from `src` to `dst`.
    fn link(&self, src: StreamAddr, dst: StreamAddr) -> Result<()>;
    fn unlink(&self, src: StreamAddr, dst: StreamAddr) -> Result<()>;

    fn block_add_ref(&self, block: BlockId) -> Result<()>;
    fn block_release(&self, block: BlockId) -> Result<()>;

    /// Feed one compressed packet to a decoder group.
    fn send_stream(&self, group: GroupId, packet: &StreamPacket<'_>, timeout: Duration)
    -> Result<()>;
    /// Feed one raw frame to a processor/encoder group's input.
    fn send_frame(
        &self,
        module: ModuleKind,
        group: GroupId,
        frame: &crate::frame::VideoFrameDesc,
        timeout: Duration,
    ) -> Result<()>;

    /// Bind the calling thread to the device transport.  Required before
    /// the first driver call on a worker thread.
    fn thread_attach(&self) -> Result<()>;
    fn thread_detach(&self);
}

// ─── Device context ──────────────────────────────────────────────────────

/// Explicit per-card context threaded through every constructor.
pub struct DeviceContext {
    driver: Arc<dyn Driver>,
    device: u32,
}

impl DeviceContext {
    pub fn new(driver: Arc<dyn Driver>, device: u32) -> Arc<Self> {
        Arc::new(Self { driver, device })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    /// Bind the calling thread to the device; the guard releases the
    /// binding on every exit path.
    pub fn attach_current_thread(&self) -> Result<DeviceThreadGuard> {
        self.driver.thread_attach()?;
        Ok(DeviceThreadGuard {
            driver: self.driver.clone(),
        })
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Scoped per-thread device binding (see
/// [`DeviceContext::attach_current_thread`]).
pub struct DeviceThreadGuard {
    driver: Arc<dyn Driver>,
}

impl Drop for DeviceThreadGuard {
    fn drop(&mut self) {
        self.driver.thread_detach();
    }
}
