//! Hardware-buffer value types and the pool-reference guard.
//!
//! A [`Frame`] describes one completed hardware buffer — a raw video frame
//! or an encoded stream chunk, never both — plus its provenance triple and
//! the pool blocks backing the payload.  Frames are cheap to clone; all
//! clones share one set of [`BlockRef`] guards, so the pool reference count
//! is incremented exactly once when the dispatch worker adopts the buffer
//! and decremented exactly once when the last clone drops.  A reference can
//! therefore never leak past the scope holding the frame.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::driver::{BlockId, Driver, PixelFormat, RawOutput, StreamAddr};
use crate::error::Result;

// ─── Payload descriptors ─────────────────────────────────────────────────

/// One decoded/processed raw frame.
#[derive(Clone, Debug)]
pub struct VideoFrameDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    /// Per-group monotonic sequence number.
    pub seq: u64,
}

/// One encoded stream chunk.
#[derive(Clone, Debug)]
pub struct StreamChunkDesc {
    pub data: Vec<u8>,
    /// Presentation timestamp in microseconds.
    pub pts: i64,
    pub seq: u64,
    pub keyframe: bool,
}

/// Tagged payload union — a frame carries one or the other.
#[derive(Clone, Debug)]
pub enum FramePayload {
    Video(VideoFrameDesc),
    Stream(StreamChunkDesc),
}

impl FramePayload {
    pub fn pts(&self) -> i64 {
        match self {
            Self::Video(v) => v.pts,
            Self::Stream(s) => s.pts,
        }
    }
}

// ─── Pool-reference guard ────────────────────────────────────────────────

/// Owned reference into the driver's buffer pool.
///
/// Construction increments the block's reference count; `Drop` always
/// balances it, on every exit path.
pub struct BlockRef {
    driver: Arc<dyn Driver>,
    block: BlockId,
}

impl BlockRef {
    pub fn acquire(driver: Arc<dyn Driver>, block: BlockId) -> Result<Self> {
        driver.block_add_ref(block)?;
        Ok(Self { driver, block })
    }

    pub fn block(&self) -> BlockId {
        self.block
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        if let Err(err) = self.driver.block_release(self.block) {
            warn!(block = %self.block, %err, "pool block release failed");
        }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlockRef").field(&self.block).finish()
    }
}

// ─── Frame ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FrameShared {
    addr: StreamAddr,
    payload: FramePayload,
    refs: Vec<BlockRef>,
}

/// One hardware-produced buffer with provenance and pool references.
///
/// Cloning is an `Arc` bump; the underlying pool references are released
/// when the last clone drops.
#[derive(Clone, Debug)]
pub struct Frame(Arc<FrameShared>);

impl Frame {
    /// Take ownership of a buffer handed out by the driver: acquire one
    /// pool reference per backing block, then wrap the payload.
    ///
    /// On failure every reference acquired so far is released before the
    /// error returns; the caller still owes the driver its
    /// `release_frame`.
    pub fn adopt(driver: &Arc<dyn Driver>, addr: StreamAddr, raw: RawOutput) -> Result<Self> {
        let mut refs = Vec::with_capacity(raw.blocks.len());
        for block in &raw.blocks {
            refs.push(BlockRef::acquire(driver.clone(), *block)?);
        }
        Ok(Self(Arc::new(FrameShared {
            addr,
            payload: raw.payload,
            refs,
        })))
    }

    /// Producing endpoint (module, group, channel).
    pub fn addr(&self) -> StreamAddr {
        self.0.addr
    }

    pub fn payload(&self) -> &FramePayload {
        &self.0.payload
    }

    pub fn pts(&self) -> i64 {
        self.0.payload.pts()
    }

    pub fn video(&self) -> Option<&VideoFrameDesc> {
        match &self.0.payload {
            FramePayload::Video(v) => Some(v),
            FramePayload::Stream(_) => None,
        }
    }

    pub fn stream(&self) -> Option<&StreamChunkDesc> {
        match &self.0.payload {
            FramePayload::Stream(s) => Some(s),
            FramePayload::Video(_) => None,
        }
    }

    pub fn block_count(&self) -> usize {
        self.0.refs.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::driver::{
        ChannelId, ChannelSpec, GroupId, GroupSpec, ModuleKind, PollEvent, SelectOutcome,
        StreamPacket,
    };
    use crate::error::AxonError;

    /// Driver double that only counts pool references.
    #[derive(Default)]
    struct RefCountDriver {
        refs: AtomicI64,
        fail_add: Mutex<Vec<BlockId>>,
    }

    impl Driver for RefCountDriver {
        fn create_group(&self, _: ModuleKind, _: &GroupSpec) -> Result<GroupId> {
            unimplemented!()
        }
        fn destroy_group(&self, _: ModuleKind, _: GroupId) -> Result<()> {
            unimplemented!()
        }
        fn enable_channel(&self, _: StreamAddr, _: &ChannelSpec) -> Result<()> {
            unimplemented!()
        }
        fn disable_channel(&self, _: StreamAddr) -> Result<()> {
            unimplemented!()
        }
        fn start_receive(&self, _: ModuleKind, _: GroupId) -> Result<()> {
            unimplemented!()
        }
        fn stop_receive(&self, _: ModuleKind, _: GroupId) -> Result<()> {
            unimplemented!()
        }
        fn reset_group(&self, _: ModuleKind, _: GroupId) -> Result<()> {
            unimplemented!()
        }
        fn get_frame(&self, _: StreamAddr, _: Duration) -> Result<PollEvent> {
            unimplemented!()
        }
        fn release_frame(&self, _: StreamAddr, _: u64) -> Result<()> {
            unimplemented!()
        }
        fn select(
            &self,
            _: ModuleKind,
            _: &[StreamAddr],
            _: Duration,
        ) -> Result<SelectOutcome> {
            unimplemented!()
        }
        fn wake(&self, _: ModuleKind, _: GroupId) -> Result<()> {
            unimplemented!()
        }
        fn link(&self, _: StreamAddr, _: StreamAddr) -> Result<()> {
            unimplemented!()
        }
        fn unlink(&self, _: StreamAddr, _: StreamAddr) -> Result<()> {
            unimplemented!()
        }
        fn block_add_ref(&self, block: BlockId) -> Result<()> {
            if self.fail_add.lock().unwrap().contains(&block) {
                return Err(AxonError::Driver {
                    op: "block_add_ref",
                    detail: format!("unknown block {block}"),
                });
            }
            self.refs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn block_release(&self, _: BlockId) -> Result<()> {
            self.refs.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
        fn send_stream(&self, _: GroupId, _: &StreamPacket<'_>, _: Duration) -> Result<()> {
            unimplemented!()
        }
        fn send_frame(
            &self,
            _: ModuleKind,
            _: GroupId,
            _: &VideoFrameDesc,
            _: Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        fn thread_attach(&self) -> Result<()> {
            Ok(())
        }
        fn thread_detach(&self) {}
    }

    fn raw(blocks: Vec<BlockId>) -> RawOutput {
        RawOutput {
            handle: 1,
            payload: FramePayload::Video(VideoFrameDesc {
                width: 64,
                height: 64,
                format: PixelFormat::Nv12,
                pts: 0,
                seq: 0,
            }),
            blocks,
        }
    }

    fn addr() -> StreamAddr {
        StreamAddr::new(ModuleKind::Decoder, GroupId(0), ChannelId(0))
    }

    #[test]
    fn last_clone_drop_releases_references_once() {
        let concrete = Arc::new(RefCountDriver::default());
        let driver: Arc<dyn Driver> = concrete.clone();

        let frame = Frame::adopt(&driver, addr(), raw(vec![BlockId(7), BlockId(8)])).unwrap();
        let copy = frame.clone();
        assert_eq!(concrete.refs.load(Ordering::SeqCst), 2, "one ref per block");

        drop(frame);
        assert_eq!(concrete.refs.load(Ordering::SeqCst), 2, "copy keeps refs alive");
        drop(copy);
        assert_eq!(concrete.refs.load(Ordering::SeqCst), 0, "all refs released");
    }

    #[test]
    fn failed_adoption_releases_partial_references() {
        let concrete = Arc::new(RefCountDriver::default());
        concrete.fail_add.lock().unwrap().push(BlockId(8));
        let driver: Arc<dyn Driver> = concrete.clone();

        let err = Frame::adopt(&driver, addr(), raw(vec![BlockId(7), BlockId(8)]))
            .expect_err("second block must fail");
        assert_eq!(err.error_code(), 402);
        assert_eq!(concrete.refs.load(Ordering::SeqCst), 0, "first ref rolled back");
    }
}
