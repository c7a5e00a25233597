//! The simulated card: state tables, pools, and the emulated media path.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use axon_core::driver::{
    BlockId, ChannelId, ChannelSpec, Codec, Driver, GroupId, GroupSpec, ModuleKind, PixelFormat,
    PollEvent, RawOutput, SelectOutcome, StreamAddr, StreamPacket,
};
use axon_core::error::{AxonError, Result};
use axon_core::frame::{FramePayload, StreamChunkDesc, VideoFrameDesc};

/// Keyframe cadence applied when a group's `gop_length` is 0.
const DEFAULT_GOP: u32 = 30;

/// Driver entry points that accept injected failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateGroup,
    DestroyGroup,
    EnableChannel,
    DisableChannel,
    StartReceive,
    StopReceive,
    ResetGroup,
    Link,
    Unlink,
    SendStream,
    SendFrame,
}

impl SimOp {
    fn name(self) -> &'static str {
        match self {
            Self::CreateGroup => "create_group",
            Self::DestroyGroup => "destroy_group",
            Self::EnableChannel => "enable_channel",
            Self::DisableChannel => "disable_channel",
            Self::StartReceive => "start_receive",
            Self::StopReceive => "stop_receive",
            Self::ResetGroup => "reset_group",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::SendStream => "send_stream",
            Self::SendFrame => "send_frame",
        }
    }
}

struct BlockState {
    refs: u32,
    owner: (ModuleKind, GroupId),
}

struct SimChannel {
    spec: ChannelSpec,
    fifo: VecDeque<RawOutput>,
    /// Buffers handed out by `get_frame`, held until `release_frame`.
    inflight: HashMap<u64, Vec<BlockId>>,
    eos_pending: bool,
}

struct SimGroup {
    spec: GroupSpec,
    receiving: bool,
    wake_tokens: u32,
    seq: u64,
    pool_used: u32,
    channels: BTreeMap<ChannelId, SimChannel>,
}

#[derive(Default)]
struct CardState {
    next_group: u32,
    next_block: u64,
    next_handle: u64,
    groups: BTreeMap<(ModuleKind, GroupId), SimGroup>,
    links: BTreeMap<StreamAddr, BTreeSet<StreamAddr>>,
    blocks: HashMap<BlockId, BlockState>,
}

/// In-process software card.  See the crate docs.
pub struct SimCard {
    state: Mutex<CardState>,
    cond: Condvar,
    failures: Mutex<HashMap<SimOp, VecDeque<AxonError>>>,
    attached: AtomicUsize,
}

impl Default for SimCard {
    fn default() -> Self {
        Self {
            state: Mutex::new(CardState::default()),
            cond: Condvar::new(),
            failures: Mutex::new(HashMap::new()),
            attached: AtomicUsize::new(0),
        }
    }
}

impl SimCard {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Failure injection (test hook) ─────────────────────────────────

    /// Queue `err` as the result of the next `op` call.
    pub fn queue_failure(&self, op: SimOp, err: AxonError) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Queue a generic driver fault for the next `op` call.
    pub fn fail_once(&self, op: SimOp) {
        self.queue_failure(
            op,
            AxonError::Driver {
                op: op.name(),
                detail: "injected fault".into(),
            },
        );
    }

    fn take_failure(&self, op: SimOp) -> Result<()> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = failures.get_mut(&op)
            && let Some(err) = queue.pop_front()
        {
            return Err(err);
        }
        Ok(())
    }

    // ── Inspectors (test hooks) ───────────────────────────────────────

    /// Live groups across all modules.
    pub fn group_count(&self) -> usize {
        self.lock().groups.len()
    }

    /// Total link edges in the driver's table.
    pub fn link_count(&self) -> usize {
        self.lock().links.values().map(BTreeSet::len).sum()
    }

    /// Pool blocks with a nonzero reference count.
    pub fn outstanding_blocks(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Threads currently bound to the device transport.
    pub fn attached_threads(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Completed buffers queued on `addr`, not yet fetched.
    pub fn queued(&self, addr: StreamAddr) -> usize {
        let state = self.lock();
        state
            .groups
            .get(&(addr.module, addr.group))
            .and_then(|g| g.channels.get(&addr.channel))
            .map_or(0, |c| c.fifo.len())
    }
}

// ─── Internal state helpers ──────────────────────────────────────────────

fn group<'a>(
    state: &'a CardState,
    module: ModuleKind,
    group: GroupId,
) -> Result<&'a SimGroup> {
    state
        .groups
        .get(&(module, group))
        .ok_or(AxonError::InvalidHandle { module })
}

fn group_mut<'a>(
    state: &'a mut CardState,
    module: ModuleKind,
    group: GroupId,
) -> Result<&'a mut SimGroup> {
    state
        .groups
        .get_mut(&(module, group))
        .ok_or(AxonError::InvalidHandle { module })
}

fn alloc_block(state: &mut CardState, owner: (ModuleKind, GroupId)) -> Result<BlockId> {
    let group = state
        .groups
        .get_mut(&owner)
        .ok_or(AxonError::InvalidHandle { module: owner.0 })?;
    if group.pool_used >= group.spec.block_count {
        return Err(AxonError::NoMemory(format!(
            "{}[{}] pool exhausted ({} blocks)",
            owner.0, owner.1, group.spec.block_count
        )));
    }
    group.pool_used += 1;
    let block = BlockId(state.next_block);
    state.next_block += 1;
    state.blocks.insert(block, BlockState { refs: 1, owner });
    Ok(block)
}

fn release_block(state: &mut CardState, block: BlockId) -> Result<()> {
    let entry = state
        .blocks
        .get_mut(&block)
        .ok_or_else(|| AxonError::Driver {
            op: "block_release",
            detail: format!("unknown block {block}"),
        })?;
    entry.refs -= 1;
    if entry.refs == 0 {
        let owner = entry.owner;
        state.blocks.remove(&block);
        // The owning group may already be gone when a sink outlives it.
        if let Some(group) = state.groups.get_mut(&owner) {
            group.pool_used = group.pool_used.saturating_sub(1);
        }
    }
    Ok(())
}

/// Queue a completed buffer on `addr`'s output fifo.
fn enqueue(state: &mut CardState, addr: StreamAddr, payload: FramePayload) -> Result<()> {
    let owner = (addr.module, addr.group);
    let Some(group) = state.groups.get(&owner) else {
        warn!(%addr, "output for missing group dropped");
        return Ok(());
    };
    let Some(channel) = group.channels.get(&addr.channel) else {
        warn!(%addr, "output for disabled channel dropped");
        return Ok(());
    };
    if channel.fifo.len() >= channel.spec.fifo_depth as usize {
        warn!(%addr, depth = channel.spec.fifo_depth, "output fifo full; frame dropped");
        return Ok(());
    }
    let block = alloc_block(state, owner)?;
    let handle = state.next_handle;
    state.next_handle += 1;
    let channel = state
        .groups
        .get_mut(&owner)
        .and_then(|g| g.channels.get_mut(&addr.channel))
        .expect("channel checked above");
    channel.fifo.push_back(RawOutput {
        handle,
        payload,
        blocks: vec![block],
    });
    Ok(())
}

/// Hand a completed buffer to `src`'s consumers: through the hardware link
/// table when linked, onto the software fifo otherwise.
fn deliver(state: &mut CardState, src: StreamAddr, payload: FramePayload) -> Result<()> {
    if let Some(dsts) = state.links.get(&src) {
        let dsts: Vec<StreamAddr> = dsts.iter().copied().collect();
        let mut first_err = None;
        for dst in dsts {
            if let Err(err) = feed_module(state, dst, payload.clone()) {
                warn!(%src, %dst, %err, "linked delivery failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    } else {
        enqueue(state, src, payload)
    }
}

/// Run one raw frame through a downstream module's emulated processing.
fn feed_module(state: &mut CardState, dst: StreamAddr, payload: FramePayload) -> Result<()> {
    let FramePayload::Video(frame) = payload else {
        warn!(%dst, "non-video payload into module input dropped");
        return Ok(());
    };
    match dst.module {
        ModuleKind::Processor => {
            let grp = group(state, ModuleKind::Processor, dst.group)?;
            if !grp.receiving {
                warn!(%dst, "processor not receiving; frame dropped");
                return Ok(());
            }
            let outputs: Vec<(ChannelId, u32, u32)> = grp
                .channels
                .iter()
                .map(|(id, c)| (*id, c.spec.width, c.spec.height))
                .collect();
            let seq = grp.seq;
            group_mut(state, ModuleKind::Processor, dst.group)?.seq += 1;
            let mut first_err = None;
            for (chn, width, height) in outputs {
                let scaled = VideoFrameDesc {
                    width,
                    height,
                    format: PixelFormat::Nv12,
                    pts: frame.pts,
                    seq,
                };
                let out = StreamAddr::new(ModuleKind::Processor, dst.group, chn);
                if let Err(err) = deliver(state, out, FramePayload::Video(scaled)) {
                    first_err.get_or_insert(err);
                }
            }
            first_err.map_or(Ok(()), Err)
        }
        ModuleKind::Encoder => {
            let grp = group(state, ModuleKind::Encoder, dst.group)?;
            if !grp.receiving {
                warn!(%dst, "encoder not receiving; frame dropped");
                return Ok(());
            }
            let codec = grp.spec.codec.unwrap_or(Codec::H264);
            let gop = if grp.spec.gop_length == 0 {
                DEFAULT_GOP
            } else {
                grp.spec.gop_length
            };
            let seq = grp.seq;
            group_mut(state, ModuleKind::Encoder, dst.group)?.seq += 1;
            let keyframe = seq % u64::from(gop) == 0;
            let chunk = StreamChunkDesc {
                data: synth_stream_bytes(codec, seq, frame.pts, keyframe),
                pts: frame.pts,
                seq,
                keyframe,
            };
            let out = StreamAddr::new(ModuleKind::Encoder, dst.group, ChannelId(0));
            deliver(state, out, FramePayload::Stream(chunk))
        }
        ModuleKind::Decoder => {
            warn!(%dst, "link into a decoder ignored");
            Ok(())
        }
    }
}

fn deliver_eos(state: &mut CardState, src: StreamAddr) {
    if let Some(dsts) = state.links.get(&src) {
        let dsts: Vec<StreamAddr> = dsts.iter().copied().collect();
        for dst in dsts {
            feed_eos(state, dst);
        }
    } else if let Some(channel) = state
        .groups
        .get_mut(&(src.module, src.group))
        .and_then(|g| g.channels.get_mut(&src.channel))
    {
        channel.eos_pending = true;
    }
}

fn feed_eos(state: &mut CardState, dst: StreamAddr) {
    match dst.module {
        ModuleKind::Processor => {
            let outputs: Vec<ChannelId> = state
                .groups
                .get(&(ModuleKind::Processor, dst.group))
                .map(|g| g.channels.keys().copied().collect())
                .unwrap_or_default();
            for chn in outputs {
                deliver_eos(state, StreamAddr::new(ModuleKind::Processor, dst.group, chn));
            }
        }
        ModuleKind::Encoder => {
            deliver_eos(
                state,
                StreamAddr::new(ModuleKind::Encoder, dst.group, ChannelId(0)),
            );
        }
        ModuleKind::Decoder => {}
    }
}

/// Deterministic Annex-B-shaped bytes for an emulated encoded chunk.
fn synth_stream_bytes(codec: Codec, seq: u64, pts: i64, keyframe: bool) -> Vec<u8> {
    let mut data = vec![0, 0, 0, 1];
    data.push(match (codec, keyframe) {
        (Codec::H264, true) => 0x65,
        (Codec::H264, false) => 0x41,
        (Codec::Hevc, true) => 0x26,
        (Codec::Hevc, false) => 0x02,
    });
    data.extend_from_slice(&seq.to_be_bytes());
    data.extend_from_slice(&pts.to_be_bytes());
    data.resize(data.len() + 43, 0xAB);
    data
}

fn drain_channel(state: &mut CardState, addr: StreamAddr) {
    let (fifo, inflight) = {
        let Some(channel) = state
            .groups
            .get_mut(&(addr.module, addr.group))
            .and_then(|g| g.channels.get_mut(&addr.channel))
        else {
            return;
        };
        let fifo: Vec<RawOutput> = channel.fifo.drain(..).collect();
        let inflight: Vec<Vec<BlockId>> = channel.inflight.drain().map(|(_, v)| v).collect();
        channel.eos_pending = false;
        (fifo, inflight)
    };
    if !inflight.is_empty() {
        warn!(%addr, held = inflight.len(), "draining channel with unreleased frames");
    }
    for raw in fifo {
        for block in raw.blocks {
            let _ = release_block(state, block);
        }
    }
    for blocks in inflight {
        for block in blocks {
            let _ = release_block(state, block);
        }
    }
}

// ─── The driver contract ─────────────────────────────────────────────────

impl Driver for SimCard {
    fn create_group(&self, module: ModuleKind, spec: &GroupSpec) -> Result<GroupId> {
        self.take_failure(SimOp::CreateGroup)?;
        if spec.width == 0 || spec.height == 0 {
            return Err(AxonError::IllegalParam(format!(
                "{module}: zero group geometry {}x{}",
                spec.width, spec.height
            )));
        }
        let mut state = self.lock();
        let id = GroupId(state.next_group);
        state.next_group += 1;
        state.groups.insert(
            (module, id),
            SimGroup {
                spec: *spec,
                receiving: false,
                wake_tokens: 0,
                seq: 0,
                pool_used: 0,
                channels: BTreeMap::new(),
            },
        );
        debug!(%module, group = %id, "group created");
        Ok(id)
    }

    fn destroy_group(&self, module: ModuleKind, id: GroupId) -> Result<()> {
        self.take_failure(SimOp::DestroyGroup)?;
        let mut state = self.lock();
        let grp = group(&state, module, id)?;
        if !grp.channels.is_empty() {
            return Err(AxonError::Driver {
                op: "destroy_group",
                detail: format!("{module}[{id}]: channels still enabled"),
            });
        }
        state.groups.remove(&(module, id));
        debug!(%module, group = %id, "group destroyed");
        Ok(())
    }

    fn enable_channel(&self, addr: StreamAddr, spec: &ChannelSpec) -> Result<()> {
        self.take_failure(SimOp::EnableChannel)?;
        let mut state = self.lock();
        let grp = group_mut(&mut state, addr.module, addr.group)?;
        if grp.channels.contains_key(&addr.channel) {
            return Err(AxonError::Driver {
                op: "enable_channel",
                detail: format!("{addr}: already enabled"),
            });
        }
        grp.channels.insert(
            addr.channel,
            SimChannel {
                spec: *spec,
                fifo: VecDeque::new(),
                inflight: HashMap::new(),
                eos_pending: false,
            },
        );
        Ok(())
    }

    fn disable_channel(&self, addr: StreamAddr) -> Result<()> {
        self.take_failure(SimOp::DisableChannel)?;
        let mut state = self.lock();
        group(&state, addr.module, addr.group)?;
        drain_channel(&mut state, addr);
        let grp = group_mut(&mut state, addr.module, addr.group)?;
        if grp.channels.remove(&addr.channel).is_none() {
            return Err(AxonError::Driver {
                op: "disable_channel",
                detail: format!("{addr}: not enabled"),
            });
        }
        Ok(())
    }

    fn start_receive(&self, module: ModuleKind, id: GroupId) -> Result<()> {
        self.take_failure(SimOp::StartReceive)?;
        let mut state = self.lock();
        group_mut(&mut state, module, id)?.receiving = true;
        Ok(())
    }

    fn stop_receive(&self, module: ModuleKind, id: GroupId) -> Result<()> {
        self.take_failure(SimOp::StopReceive)?;
        let mut state = self.lock();
        group_mut(&mut state, module, id)?.receiving = false;
        Ok(())
    }

    fn reset_group(&self, module: ModuleKind, id: GroupId) -> Result<()> {
        self.take_failure(SimOp::ResetGroup)?;
        let mut state = self.lock();
        let channels: Vec<ChannelId> = group(&state, module, id)?
            .channels
            .keys()
            .copied()
            .collect();
        for chn in channels {
            drain_channel(&mut state, StreamAddr::new(module, id, chn));
        }
        let grp = group_mut(&mut state, module, id)?;
        grp.seq = 0;
        grp.wake_tokens = 0;
        grp.receiving = false;
        Ok(())
    }

    fn get_frame(&self, addr: StreamAddr, timeout: Duration) -> Result<PollEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let grp = group_mut(&mut state, addr.module, addr.group)?;
            if grp.wake_tokens > 0 {
                grp.wake_tokens -= 1;
                return Ok(PollEvent::Woken);
            }
            let channel = grp
                .channels
                .get_mut(&addr.channel)
                .ok_or_else(|| AxonError::Driver {
                    op: "get_frame",
                    detail: format!("{addr}: channel not enabled"),
                })?;
            if let Some(raw) = channel.fifo.pop_front() {
                channel.inflight.insert(raw.handle, raw.blocks.clone());
                return Ok(PollEvent::Frame(raw));
            }
            if channel.eos_pending {
                channel.eos_pending = false;
                return Ok(PollEvent::EndOfStream);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(PollEvent::Timeout);
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn release_frame(&self, addr: StreamAddr, handle: u64) -> Result<()> {
        let mut state = self.lock();
        let channel = state
            .groups
            .get_mut(&(addr.module, addr.group))
            .and_then(|g| g.channels.get_mut(&addr.channel))
            .ok_or_else(|| AxonError::Driver {
                op: "release_frame",
                detail: format!("{addr}: channel not enabled"),
            })?;
        let blocks = channel
            .inflight
            .remove(&handle)
            .ok_or_else(|| AxonError::Driver {
                op: "release_frame",
                detail: format!("{addr}: unknown frame handle {handle}"),
            })?;
        for block in blocks {
            release_block(&mut state, block)?;
        }
        Ok(())
    }

    fn select(
        &self,
        module: ModuleKind,
        candidates: &[StreamAddr],
        timeout: Duration,
    ) -> Result<SelectOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            for addr in candidates {
                if let Some(grp) = state.groups.get_mut(&(module, addr.group))
                    && grp.wake_tokens > 0
                {
                    grp.wake_tokens -= 1;
                    return Ok(SelectOutcome::Woken);
                }
            }
            let ready: Vec<StreamAddr> = candidates
                .iter()
                .filter(|addr| {
                    state
                        .groups
                        .get(&(module, addr.group))
                        .and_then(|g| g.channels.get(&addr.channel))
                        .is_some_and(|c| !c.fifo.is_empty() || c.eos_pending)
                })
                .copied()
                .collect();
            if !ready.is_empty() {
                return Ok(SelectOutcome::Ready(ready));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(SelectOutcome::Timeout);
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn wake(&self, module: ModuleKind, id: GroupId) -> Result<()> {
        let mut state = self.lock();
        group_mut(&mut state, module, id)?.wake_tokens += 1;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn link(&self, src: StreamAddr, dst: StreamAddr) -> Result<()> {
        self.take_failure(SimOp::Link)?;
        let mut state = self.lock();
        let grp = group(&state, src.module, src.group)?;
        if !grp.channels.contains_key(&src.channel) {
            return Err(AxonError::Driver {
                op: "link",
                detail: format!("{src}: source channel not enabled"),
            });
        }
        group(&state, dst.module, dst.group)?;
        state.links.entry(src).or_default().insert(dst);
        Ok(())
    }

    fn unlink(&self, src: StreamAddr, dst: StreamAddr) -> Result<()> {
        self.take_failure(SimOp::Unlink)?;
        let mut state = self.lock();
        let removed = state
            .links
            .get_mut(&src)
            .is_some_and(|dsts| dsts.remove(&dst));
        if !removed {
            return Err(AxonError::Driver {
                op: "unlink",
                detail: format!("{src} -> {dst}: not linked"),
            });
        }
        if state.links.get(&src).is_some_and(BTreeSet::is_empty) {
            state.links.remove(&src);
        }
        Ok(())
    }

    fn block_add_ref(&self, block: BlockId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .blocks
            .get_mut(&block)
            .ok_or_else(|| AxonError::Driver {
                op: "block_add_ref",
                detail: format!("unknown block {block}"),
            })?;
        entry.refs += 1;
        Ok(())
    }

    fn block_release(&self, block: BlockId) -> Result<()> {
        let mut state = self.lock();
        release_block(&mut state, block)
    }

    fn send_stream(
        &self,
        id: GroupId,
        packet: &StreamPacket<'_>,
        _timeout: Duration,
    ) -> Result<()> {
        self.take_failure(SimOp::SendStream)?;
        let mut state = self.lock();
        let grp = group(&state, ModuleKind::Decoder, id)?;
        if !grp.receiving {
            return Err(AxonError::NotStarted("decoder group"));
        }
        let outputs: Vec<(ChannelId, u32, u32)> = grp
            .channels
            .iter()
            .map(|(chn, c)| (*chn, c.spec.width, c.spec.height))
            .collect();
        let seq = grp.seq;
        if packet.data.is_empty() {
            for (chn, _, _) in outputs {
                deliver_eos(&mut state, StreamAddr::new(ModuleKind::Decoder, id, chn));
            }
            drop(state);
            self.cond.notify_all();
            return Ok(());
        }
        group_mut(&mut state, ModuleKind::Decoder, id)?.seq += 1;
        let mut first_err = None;
        for (chn, width, height) in outputs {
            let decoded = VideoFrameDesc {
                width,
                height,
                format: PixelFormat::Nv12,
                pts: packet.pts,
                seq,
            };
            let out = StreamAddr::new(ModuleKind::Decoder, id, chn);
            if let Err(err) = deliver(&mut state, out, FramePayload::Video(decoded)) {
                first_err.get_or_insert(err);
            }
        }
        drop(state);
        self.cond.notify_all();
        first_err.map_or(Ok(()), Err)
    }

    fn send_frame(
        &self,
        module: ModuleKind,
        id: GroupId,
        frame: &VideoFrameDesc,
        _timeout: Duration,
    ) -> Result<()> {
        self.take_failure(SimOp::SendFrame)?;
        let mut state = self.lock();
        let input = StreamAddr::new(module, id, ChannelId(0));
        let result = feed_module(&mut state, input, FramePayload::Video(frame.clone()));
        drop(state);
        self.cond.notify_all();
        result
    }

    fn thread_attach(&self) -> Result<()> {
        self.attached.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn thread_detach(&self) {
        self.attached.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const POLL: Duration = Duration::from_millis(200);

    fn spec(width: u32, height: u32, codec: Option<Codec>, blocks: u32) -> GroupSpec {
        GroupSpec {
            codec,
            width,
            height,
            block_count: blocks,
            gop_length: 0,
        }
    }

    fn chan(width: u32, height: u32, depth: u32) -> ChannelSpec {
        ChannelSpec {
            width,
            height,
            fifo_depth: depth,
            compression: Default::default(),
        }
    }

    fn decoder_group(card: &SimCard, width: u32, height: u32) -> GroupId {
        let id = card
            .create_group(ModuleKind::Decoder, &spec(width, height, Some(Codec::H264), 8))
            .unwrap();
        card.enable_channel(
            StreamAddr::new(ModuleKind::Decoder, id, ChannelId(0)),
            &chan(width, height, 4),
        )
        .unwrap();
        card.start_receive(ModuleKind::Decoder, id).unwrap();
        id
    }

    fn encoder_group(card: &SimCard, width: u32, height: u32, blocks: u32) -> GroupId {
        let id = card
            .create_group(ModuleKind::Encoder, &spec(width, height, Some(Codec::Hevc), blocks))
            .unwrap();
        card.enable_channel(
            StreamAddr::new(ModuleKind::Encoder, id, ChannelId(0)),
            &chan(width, height, 8),
        )
        .unwrap();
        card.start_receive(ModuleKind::Encoder, id).unwrap();
        id
    }

    #[test]
    fn linked_chain_encodes_one_chunk_per_packet() {
        let card = Arc::new(SimCard::default());
        let vdec = decoder_group(&card, 1920, 1080);
        let ivps = card
            .create_group(ModuleKind::Processor, &spec(1920, 1080, None, 6))
            .unwrap();
        card.enable_channel(
            StreamAddr::new(ModuleKind::Processor, ivps, ChannelId(0)),
            &chan(1280, 720, 4),
        )
        .unwrap();
        card.start_receive(ModuleKind::Processor, ivps).unwrap();
        let venc = encoder_group(&card, 1280, 720, 8);

        card.link(
            StreamAddr::new(ModuleKind::Decoder, vdec, ChannelId(0)),
            StreamAddr::new(ModuleKind::Processor, ivps, ChannelId(0)),
        )
        .unwrap();
        card.link(
            StreamAddr::new(ModuleKind::Processor, ivps, ChannelId(0)),
            StreamAddr::new(ModuleKind::Encoder, venc, ChannelId(0)),
        )
        .unwrap();

        let nalu = [0u8, 0, 0, 1, 0x65, 0xAA];
        card.send_stream(vdec, &StreamPacket { data: &nalu, pts: 1000 }, POLL)
            .unwrap();

        let out = StreamAddr::new(ModuleKind::Encoder, venc, ChannelId(0));
        let PollEvent::Frame(raw) = card.get_frame(out, POLL).unwrap() else {
            panic!("expected an encoded chunk");
        };
        let FramePayload::Stream(chunk) = &raw.payload else {
            panic!("encoder output must be a stream chunk");
        };
        assert_eq!(chunk.pts, 1000);
        assert!(chunk.keyframe, "first chunk in a gop is a keyframe");
        card.release_frame(out, raw.handle).unwrap();
        assert_eq!(card.outstanding_blocks(), 0);
    }

    #[test]
    fn pool_exhaustion_surfaces_no_memory() {
        let card = SimCard::default();
        let venc = encoder_group(&card, 640, 480, 1);
        let frame = VideoFrameDesc {
            width: 640,
            height: 480,
            format: PixelFormat::Nv12,
            pts: 0,
            seq: 0,
        };
        card.send_frame(ModuleKind::Encoder, venc, &frame, POLL)
            .unwrap();
        let err = card
            .send_frame(ModuleKind::Encoder, venc, &frame, POLL)
            .expect_err("single-block pool must exhaust");
        assert!(matches!(err, AxonError::NoMemory(_)));
    }

    #[test]
    fn empty_packet_propagates_end_of_stream() {
        let card = SimCard::default();
        let vdec = decoder_group(&card, 640, 480);
        let out = StreamAddr::new(ModuleKind::Decoder, vdec, ChannelId(0));
        card.send_stream(vdec, &StreamPacket { data: &[], pts: 0 }, POLL)
            .unwrap();
        assert!(matches!(
            card.get_frame(out, POLL).unwrap(),
            PollEvent::EndOfStream
        ));
        // EOS is delivered once; afterwards the channel is just empty.
        assert!(matches!(
            card.get_frame(out, Duration::from_millis(10)).unwrap(),
            PollEvent::Timeout
        ));
    }

    #[test]
    fn wake_interrupts_a_blocking_poll() {
        let card = SimCard::default();
        let vdec = decoder_group(&card, 640, 480);
        card.wake(ModuleKind::Decoder, vdec).unwrap();
        let out = StreamAddr::new(ModuleKind::Decoder, vdec, ChannelId(0));
        assert!(matches!(
            card.get_frame(out, Duration::from_secs(5)).unwrap(),
            PollEvent::Woken
        ));
    }

    #[test]
    fn select_reports_ready_channels() {
        let card = SimCard::default();
        let vdec = decoder_group(&card, 640, 480);
        let out = StreamAddr::new(ModuleKind::Decoder, vdec, ChannelId(0));
        let nalu = [0u8, 0, 0, 1, 0x65];
        card.send_stream(vdec, &StreamPacket { data: &nalu, pts: 7 }, POLL)
            .unwrap();
        let SelectOutcome::Ready(ready) = card.select(ModuleKind::Decoder, &[out], POLL).unwrap()
        else {
            panic!("expected readiness");
        };
        assert_eq!(ready, vec![out]);
    }

    #[test]
    fn destroy_rejects_enabled_channels() {
        let card = SimCard::default();
        let vdec = decoder_group(&card, 640, 480);
        let err = card
            .destroy_group(ModuleKind::Decoder, vdec)
            .expect_err("channels still enabled");
        assert!(err.to_string().contains("channels still enabled"));
        card.disable_channel(StreamAddr::new(ModuleKind::Decoder, vdec, ChannelId(0)))
            .unwrap();
        card.destroy_group(ModuleKind::Decoder, vdec).unwrap();
        assert_eq!(card.group_count(), 0);
    }

    #[test]
    fn injected_failure_fires_once() {
        let card = SimCard::default();
        card.fail_once(SimOp::CreateGroup);
        let spec = spec(640, 480, None, 4);
        assert!(card.create_group(ModuleKind::Processor, &spec).is_err());
        assert!(card.create_group(ModuleKind::Processor, &spec).is_ok());
    }
}
