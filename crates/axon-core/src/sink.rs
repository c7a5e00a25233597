//! Frame consumers and the per-channel sink registry.
//!
//! A [`FrameSink`] is a capability: "accepts a [`Frame`]".  It is
//! independent of any one producer — the same sink can be registered on
//! several channels.  Registration is by `Arc`; the registry only ever
//! forgets the pointer, never the sink itself, so sink lifetime stays with
//! the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::driver::StreamAddr;
use crate::error::Result;
use crate::frame::Frame;

/// Consumer capability registered with a dispatch worker.
pub trait FrameSink: Send + Sync {
    /// Accept one frame.  The frame clone is the sink's to keep; holding it
    /// keeps the underlying pool blocks alive.
    ///
    /// Called from the dispatch worker's thread with the sink-list lock
    /// held — a slow sink stalls its channel (accepted backpressure), and
    /// re-entering the registry from inside the callback deadlocks.
    fn on_frame(&self, frame: Frame) -> Result<()>;
}

/// Per-channel list of registered sinks.
///
/// Shared between the owning module wrapper (which registers/unregisters)
/// and the channel's dispatch worker (which parks on it while empty and
/// delivers through it).
pub struct SinkRegistry {
    addr: StreamAddr,
    sinks: Mutex<Vec<Arc<dyn FrameSink>>>,
    gate: Condvar,
}

impl SinkRegistry {
    pub fn new(addr: StreamAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            sinks: Mutex::new(Vec::new()),
            gate: Condvar::new(),
        })
    }

    pub fn addr(&self) -> StreamAddr {
        self.addr
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn FrameSink>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a sink.  Registering the same `Arc` twice is a warned
    /// no-op, never an error; returns whether the sink was added.
    pub fn register(&self, sink: Arc<dyn FrameSink>) -> bool {
        let mut sinks = self.lock();
        if sinks.iter().any(|s| Arc::ptr_eq(s, &sink)) {
            warn!(addr = %self.addr, "duplicate sink registration ignored");
            return false;
        }
        sinks.push(sink);
        debug!(addr = %self.addr, count = sinks.len(), "sink registered");
        self.gate.notify_all();
        true
    }

    /// Forget a sink pointer.  Unregistering a sink that was never
    /// registered is reported but does not corrupt state.
    pub fn unregister(&self, sink: &Arc<dyn FrameSink>) -> bool {
        let mut sinks = self.lock();
        let before = sinks.len();
        sinks.retain(|s| !Arc::ptr_eq(s, sink));
        if sinks.len() == before {
            warn!(addr = %self.addr, "unregister of unknown sink ignored");
            return false;
        }
        debug!(addr = %self.addr, count = sinks.len(), "sink unregistered");
        true
    }

    /// Drop every registration (end-of-stream). Returns how many were
    /// forgotten.
    pub fn clear(&self) -> usize {
        let mut sinks = self.lock();
        let dropped = sinks.len();
        sinks.clear();
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver one frame clone to every registered sink.
    ///
    /// Runs as a single critical section: sink callbacks execute with the
    /// sink-list lock held.  Returns the number of sinks that saw the
    /// frame.
    pub fn deliver(&self, frame: &Frame) -> usize {
        let sinks = self.lock();
        for sink in sinks.iter() {
            if let Err(err) = sink.on_frame(frame.clone()) {
                warn!(addr = %self.addr, %err, "sink rejected frame");
            }
        }
        sinks.len()
    }

    /// Park the calling dispatch worker until a sink is registered or
    /// `running` clears.  Waits in bounded slices so a missed notification
    /// cannot stall cancellation.
    pub fn wait_for_consumers(&self, running: &AtomicBool, slice: Duration) {
        let mut sinks = self.lock();
        while sinks.is_empty() && running.load(Ordering::Acquire) {
            let (guard, timed_out) = match self.gate.wait_timeout(sinks, slice) {
                Ok((guard, result)) => (guard, result.timed_out()),
                Err(poisoned) => {
                    let (guard, result) = poisoned.into_inner();
                    (guard, result.timed_out())
                }
            };
            sinks = guard;
            if timed_out {
                // Re-check under the caller's loop; keeps stop() prompt
                // even if a wake was missed.
                break;
            }
        }
    }

    /// Wake any worker parked in [`wait_for_consumers`].
    ///
    /// [`wait_for_consumers`]: SinkRegistry::wait_for_consumers
    pub fn wake_waiters(&self) {
        self.gate.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::driver::{BlockId, ChannelId, Driver, GroupId, ModuleKind, RawOutput};
    use crate::frame::{FramePayload, StreamChunkDesc};

    struct CountingSink {
        seen: StdMutex<Vec<i64>>,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
            })
        }
    }

    impl FrameSink for CountingSink {
        fn on_frame(&self, frame: Frame) -> Result<()> {
            self.seen.lock().unwrap().push(frame.pts());
            Ok(())
        }
    }

    /// Pool-less driver double; frames adopted through it carry no blocks.
    struct NullDriver;

    impl Driver for NullDriver {
        fn create_group(
            &self,
            _: ModuleKind,
            _: &crate::driver::GroupSpec,
        ) -> Result<GroupId> {
            unimplemented!()
        }
        fn destroy_group(&self, _: ModuleKind, _: GroupId) -> Result<()> {
            unimplemented!()
        }
        fn enable_channel(&self, _: StreamAddr, _: &crate::driver::ChannelSpec) -> Result<()> {
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
        fn get_frame(
            &self,
            _: StreamAddr,
            _: Duration,
        ) -> Result<crate::driver::PollEvent> {
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
        ) -> Result<crate::driver::SelectOutcome> {
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
        fn block_add_ref(&self, _: BlockId) -> Result<()> {
            Ok(())
        }
        fn block_release(&self, _: BlockId) -> Result<()> {
            Ok(())
        }
        fn send_stream(
            &self,
            _: GroupId,
            _: &crate::driver::StreamPacket<'_>,
            _: Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        fn send_frame(
            &self,
            _: ModuleKind,
            _: GroupId,
            _: &crate::frame::VideoFrameDesc,
            _: Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        fn thread_attach(&self) -> Result<()> {
            Ok(())
        }
        fn thread_detach(&self) {}
    }

    fn test_addr() -> StreamAddr {
        StreamAddr::new(ModuleKind::Encoder, GroupId(0), ChannelId(0))
    }

    fn test_frame(pts: i64) -> Frame {
        let driver: Arc<dyn Driver> = Arc::new(NullDriver);
        Frame::adopt(
            &driver,
            test_addr(),
            RawOutput {
                handle: 0,
                payload: FramePayload::Stream(StreamChunkDesc {
                    data: vec![0, 0, 0, 1],
                    pts,
                    seq: 0,
                    keyframe: true,
                }),
                blocks: Vec::new(),
            },
        )
        .unwrap()
    }

    #[test]
    fn duplicate_registration_delivers_once() {
        let registry = SinkRegistry::new(test_addr());
        let sink = CountingSink::new();

        assert!(registry.register(sink.clone()));
        assert!(!registry.register(sink.clone()), "duplicate must be a no-op");

        let delivered = registry.deliver(&test_frame(42));
        assert_eq!(delivered, 1);
        assert_eq!(sink.seen.lock().unwrap().as_slice(), &[42]);
    }

    #[test]
    fn unregister_unknown_sink_reports_without_corrupting() {
        let registry = SinkRegistry::new(test_addr());
        let registered = CountingSink::new();
        let stranger = CountingSink::new();

        registry.register(registered.clone());
        let stranger_dyn: Arc<dyn FrameSink> = stranger;
        assert!(!registry.unregister(&stranger_dyn));

        registry.deliver(&test_frame(1));
        assert_eq!(registered.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn clear_forgets_all_registrations() {
        let registry = SinkRegistry::new(test_addr());
        registry.register(CountingSink::new());
        registry.register(CountingSink::new());
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn wait_returns_when_sink_arrives() {
        let registry = SinkRegistry::new(test_addr());
        let running = AtomicBool::new(true);
        registry.register(CountingSink::new());
        // Must not block: a consumer is present.
        registry.wait_for_consumers(&running, Duration::from_secs(5));
    }

    #[test]
    fn wait_returns_when_stopped() {
        let registry = SinkRegistry::new(test_addr());
        let running = AtomicBool::new(false);
        registry.wait_for_consumers(&running, Duration::from_secs(5));
    }
}
