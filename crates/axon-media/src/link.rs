//! In-process mirror of the driver's link table.
//!
//! Every mutation is paired 1:1 with a driver call and applied to the map
//! only when the driver call succeeds, so the mirror never disagrees with
//! the card: a duplicate `link` is detected locally without a round trip,
//! and teardown can unlink everything exactly once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use axon_core::driver::{DeviceContext, StreamAddr};
use axon_core::error::{AxonError, Result};

type EdgeMap = BTreeMap<StreamAddr, BTreeSet<StreamAddr>>;

/// Registry of directed `(module, group, channel) → (module, group,
/// channel)` forwarding edges.  Owned by the pipeline that created the
/// links; one mutex guards the whole map.
pub struct LinkRegistry {
    ctx: Arc<DeviceContext>,
    edges: Mutex<EdgeMap>,
}

impl LinkRegistry {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            edges: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EdgeMap> {
        self.edges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Establish `src → dst`.  Linking an edge that already exists is a
    /// no-op success; a driver failure leaves the map untouched.
    pub fn link(&self, src: StreamAddr, dst: StreamAddr) -> Result<()> {
        let mut edges = self.lock();
        if edges.get(&src).is_some_and(|dsts| dsts.contains(&dst)) {
            debug!(%src, %dst, "already linked");
            return Ok(());
        }
        self.ctx.driver().link(src, dst)?;
        edges.entry(src).or_default().insert(dst);
        info!(%src, %dst, "linked");
        Ok(())
    }

    /// Remove `src → dst`.  The edge stays in the map when the driver call
    /// fails, so the unlink can be retried.
    pub fn unlink(&self, src: StreamAddr, dst: StreamAddr) -> Result<()> {
        let mut edges = self.lock();
        if !edges.get(&src).is_some_and(|dsts| dsts.contains(&dst)) {
            return Err(AxonError::NotLinked { src, dst });
        }
        self.ctx.driver().unlink(src, dst)?;
        if let Some(dsts) = edges.get_mut(&src) {
            dsts.remove(&dst);
            if dsts.is_empty() {
                edges.remove(&src);
            }
        }
        info!(%src, %dst, "unlinked");
        Ok(())
    }

    /// Best-effort removal of every edge from `src`.  Attempts each edge
    /// even after a failure; successes leave the map, failures stay for a
    /// retry, and the first error is returned.
    pub fn unlink_from(&self, src: StreamAddr) -> Result<()> {
        let mut edges = self.lock();
        let dsts: Vec<StreamAddr> = edges
            .get(&src)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        self.sweep(&mut edges, dsts.into_iter().map(|dst| (src, dst)).collect())
    }

    /// Best-effort removal of every registered edge (pipeline teardown).
    pub fn unlink_all(&self) -> Result<()> {
        let mut edges = self.lock();
        let pairs: Vec<(StreamAddr, StreamAddr)> = edges
            .iter()
            .flat_map(|(src, dsts)| dsts.iter().map(|dst| (*src, *dst)))
            .collect();
        self.sweep(&mut edges, pairs)
    }

    fn sweep(
        &self,
        edges: &mut EdgeMap,
        pairs: Vec<(StreamAddr, StreamAddr)>,
    ) -> Result<()> {
        let mut first_err = None;
        for (src, dst) in pairs {
            match self.ctx.driver().unlink(src, dst) {
                Ok(()) => {
                    if let Some(dsts) = edges.get_mut(&src) {
                        dsts.remove(&dst);
                        if dsts.is_empty() {
                            edges.remove(&src);
                        }
                    }
                }
                Err(err) => {
                    warn!(%src, %dst, %err, "unlink failed; edge kept for retry");
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Whether any edge originates at `src` (linked channels need no
    /// software dispatch).
    pub fn is_linked_src(&self, src: StreamAddr) -> bool {
        self.lock().contains_key(&src)
    }

    pub fn destinations(&self, src: StreamAddr) -> Vec<StreamAddr> {
        self.lock()
            .get(&src)
            .map(|dsts| dsts.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total registered edges.
    pub fn edge_count(&self) -> usize {
        self.lock().values().map(BTreeSet::len).sum()
    }
}
