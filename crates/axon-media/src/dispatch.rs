//! Dispatch workers: the threads that move completed hardware buffers to
//! registered sinks.
//!
//! Two flavors exist, matching the two poll primitives the driver offers:
//!
//! - [`ChannelDispatch`] — one OS thread per output channel.  Parks on the
//!   sink registry's condvar while nobody is listening, then polls
//!   `get_frame` with a bounded timeout.
//! - [`SelectDispatch`] — one OS thread per decoder group.  The decoder's
//!   `select` call multiplexes readiness across all of the group's output
//!   channels natively, so there is no per-channel parking.
//!
//! Both adopt each buffer into a [`Frame`] (taking the pool references),
//! deliver clones to every registered sink, and then return the driver's
//! own hold with `release_frame` — after dispatch the worker owns nothing.
//! Cancellation is cooperative: an atomic flag, a condvar nudge, and a
//! driver `wake` so a blocking poll returns promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use axon_core::driver::{
    DeviceContext, Driver, GroupId, ModuleKind, PollEvent, SelectOutcome, StreamAddr,
};
use axon_core::error::{AxonError, Result};
use axon_core::frame::Frame;
use axon_core::sink::SinkRegistry;

/// Bounded poll so the stop flag is observed promptly without spinning.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Parking slice while a channel has no consumers.
const PARK_SLICE: Duration = Duration::from_millis(100);
/// Pause after a poll error so a wedged driver call cannot busy-loop.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Adopt, fan out, and release one completed buffer.
fn pump_frame(
    driver: &Arc<dyn Driver>,
    addr: StreamAddr,
    sinks: &SinkRegistry,
    raw: axon_core::driver::RawOutput,
) {
    let handle = raw.handle;
    match Frame::adopt(driver, addr, raw) {
        Ok(frame) => {
            let delivered = sinks.deliver(&frame);
            debug!(%addr, delivered, pts = frame.pts(), "frame dispatched");
        }
        Err(err) => warn!(%addr, %err, "frame adoption failed; buffer dropped"),
    }
    // The driver's own hold is returned regardless; sinks that kept the
    // frame keep it alive through their pool references.
    if let Err(err) = driver.release_frame(addr, handle) {
        warn!(%addr, handle, %err, "frame release failed");
    }
}

// ─── Per-channel worker ──────────────────────────────────────────────────

/// Worker thread for one output channel (processor and encoder outputs).
pub struct ChannelDispatch {
    addr: StreamAddr,
    running: Arc<AtomicBool>,
    sinks: Arc<SinkRegistry>,
    ctx: Arc<DeviceContext>,
    thread: Option<JoinHandle<()>>,
}

impl ChannelDispatch {
    /// Spawn the worker.  Sinks registered with `sinks` before this call
    /// are picked up as soon as the thread runs.
    pub fn spawn(
        ctx: Arc<DeviceContext>,
        addr: StreamAddr,
        sinks: Arc<SinkRegistry>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let ctx = ctx.clone();
            let sinks = sinks.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("dispatch-{addr}"))
                .spawn(move || run_channel(ctx, addr, sinks, running))
                .map_err(|err| AxonError::StartDispatchFailed(format!("{addr}: {err}")))?
        };
        Ok(Self {
            addr,
            running,
            sinks,
            ctx,
            thread: Some(thread),
        })
    }

    /// Cooperative stop: flip the flag, wake the parked/polling thread,
    /// join.
    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        self.sinks.wake_waiters();
        if let Err(err) = self
            .ctx
            .driver()
            .wake(self.addr.module, self.addr.group)
        {
            warn!(addr = %self.addr, %err, "dispatch wake failed; relying on poll timeout");
        }
        thread
            .join()
            .map_err(|_| AxonError::StopDispatchFailed(format!("{} worker panicked", self.addr)))
    }
}

impl Drop for ChannelDispatch {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(addr = %self.addr, %err, "dispatch stop on drop failed");
        }
    }
}

fn run_channel(
    ctx: Arc<DeviceContext>,
    addr: StreamAddr,
    sinks: Arc<SinkRegistry>,
    running: Arc<AtomicBool>,
) {
    // Per-thread transport binding; the guard releases it on every exit
    // path, early returns included.
    let _device = match ctx.attach_current_thread() {
        Ok(guard) => guard,
        Err(err) => {
            warn!(%addr, %err, "device attach failed; dispatch worker exiting");
            return;
        }
    };
    debug!(%addr, "dispatch worker up");
    let driver = ctx.driver();
    while running.load(Ordering::Acquire) {
        sinks.wait_for_consumers(&running, PARK_SLICE);
        if !running.load(Ordering::Acquire) {
            break;
        }
        if sinks.is_empty() {
            continue;
        }
        match driver.get_frame(addr, POLL_TIMEOUT) {
            Ok(PollEvent::Frame(raw)) => pump_frame(driver, addr, &sinks, raw),
            Ok(PollEvent::Timeout) | Ok(PollEvent::Woken) => {}
            Ok(PollEvent::EndOfStream) => {
                let dropped = sinks.clear();
                info!(%addr, dropped, "end of stream; consumers deregistered");
            }
            Err(err) => {
                warn!(%addr, %err, "frame poll failed");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    debug!(%addr, "dispatch worker down");
}

// ─── Decoder select worker ───────────────────────────────────────────────

/// Worker thread for one decoder group, draining every output channel
/// through the driver's multi-channel select.
pub struct SelectDispatch {
    module: ModuleKind,
    group: GroupId,
    running: Arc<AtomicBool>,
    ctx: Arc<DeviceContext>,
    thread: Option<JoinHandle<()>>,
}

impl SelectDispatch {
    pub fn spawn(
        ctx: Arc<DeviceContext>,
        module: ModuleKind,
        group: GroupId,
        channels: Vec<(StreamAddr, Arc<SinkRegistry>)>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let ctx = ctx.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("dispatch-{module}[{group}]"))
                .spawn(move || run_select(ctx, module, channels, running))
                .map_err(|err| {
                    AxonError::StartDispatchFailed(format!("{module}[{group}]: {err}"))
                })?
        };
        Ok(Self {
            module,
            group,
            running,
            ctx,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        if let Err(err) = self.ctx.driver().wake(self.module, self.group) {
            warn!(module = %self.module, group = %self.group, %err,
                "dispatch wake failed; relying on poll timeout");
        }
        thread.join().map_err(|_| {
            AxonError::StopDispatchFailed(format!(
                "{}[{}] worker panicked",
                self.module, self.group
            ))
        })
    }
}

impl Drop for SelectDispatch {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(module = %self.module, group = %self.group, %err,
                "dispatch stop on drop failed");
        }
    }
}

fn run_select(
    ctx: Arc<DeviceContext>,
    module: ModuleKind,
    channels: Vec<(StreamAddr, Arc<SinkRegistry>)>,
    running: Arc<AtomicBool>,
) {
    let _device = match ctx.attach_current_thread() {
        Ok(guard) => guard,
        Err(err) => {
            warn!(%module, %err, "device attach failed; dispatch worker exiting");
            return;
        }
    };
    let candidates: Vec<StreamAddr> = channels.iter().map(|(addr, _)| *addr).collect();
    debug!(%module, channels = candidates.len(), "select dispatch worker up");
    let driver = ctx.driver();
    while running.load(Ordering::Acquire) {
        match driver.select(module, &candidates, POLL_TIMEOUT) {
            Ok(SelectOutcome::Ready(ready)) => {
                for addr in ready {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    let Some((_, sinks)) = channels.iter().find(|(a, _)| *a == addr) else {
                        continue;
                    };
                    match driver.get_frame(addr, Duration::from_millis(10)) {
                        Ok(PollEvent::Frame(raw)) => pump_frame(driver, addr, sinks, raw),
                        Ok(PollEvent::EndOfStream) => {
                            let dropped = sinks.clear();
                            info!(%addr, dropped, "end of stream; consumers deregistered");
                        }
                        Ok(PollEvent::Timeout) | Ok(PollEvent::Woken) => {}
                        Err(err) => warn!(%addr, %err, "frame fetch after select failed"),
                    }
                }
            }
            Ok(SelectOutcome::Timeout) | Ok(SelectOutcome::Woken) => {}
            Err(err) => {
                warn!(%module, %err, "select poll failed");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    debug!(%module, "select dispatch worker down");
}
