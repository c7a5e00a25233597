//! Shared pieces of the module wrappers: output-channel attributes,
//! rollback guards for partial init, and the bounded group-reset retry.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use axon_core::driver::{Compression, Driver, GroupId, ModuleKind, StreamAddr};
use axon_core::error::{AxonError, Result};

/// Group reset may report busy while hardware drains; retried this many
/// times, then escalated to the caller as fatal.
pub(crate) const RESET_ATTEMPTS: u32 = 5;
pub(crate) const RESET_BACKOFF: Duration = Duration::from_millis(20);

/// Static configuration of one enabled output channel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OutputChannelAttr {
    pub width: u32,
    pub height: u32,
    /// Driver-side queue depth between hardware completion and pickup.
    /// Must be > 0 on an enabled channel — with no queue, completed frames
    /// would have nowhere to sit before being fetched.
    pub fifo_depth: u32,
    #[serde(default)]
    pub compression: Compression,
}

impl OutputChannelAttr {
    pub(crate) fn to_channel_spec(self) -> axon_core::driver::ChannelSpec {
        axon_core::driver::ChannelSpec {
            width: self.width,
            height: self.height,
            fifo_depth: self.fifo_depth,
            compression: self.compression,
        }
    }
}

/// Reject attribute sets no group can be created from.  Runs before the
/// first driver call, so a failed validation never needs a rollback.
pub(crate) fn validate_outputs(module: ModuleKind, outputs: &[OutputChannelAttr]) -> Result<()> {
    if outputs.is_empty() {
        return Err(AxonError::IllegalParam(format!(
            "{module}: at least one output channel must be enabled"
        )));
    }
    for (idx, out) in outputs.iter().enumerate() {
        if out.fifo_depth == 0 {
            return Err(AxonError::IllegalParam(format!(
                "{module} output {idx}: fifo depth must be > 0 on an enabled channel"
            )));
        }
        if out.width == 0 || out.height == 0 {
            return Err(AxonError::IllegalParam(format!(
                "{module} output {idx}: zero geometry {}x{}",
                out.width, out.height
            )));
        }
    }
    Ok(())
}

/// Destroys the group on drop unless disarmed.  Declared before any
/// [`ChannelGuard`] so unwinding disables channels first, then destroys.
pub(crate) struct GroupGuard<'a> {
    driver: &'a dyn Driver,
    module: ModuleKind,
    group: GroupId,
    armed: bool,
}

impl<'a> GroupGuard<'a> {
    pub(crate) fn new(driver: &'a dyn Driver, module: ModuleKind, group: GroupId) -> Self {
        Self {
            driver,
            module,
            group,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.driver.destroy_group(self.module, self.group) {
            warn!(module = %self.module, group = %self.group, %err,
                "rollback group destroy failed");
        }
    }
}

/// Disables the channel on drop unless disarmed.
pub(crate) struct ChannelGuard<'a> {
    driver: &'a dyn Driver,
    addr: StreamAddr,
    armed: bool,
}

impl<'a> ChannelGuard<'a> {
    pub(crate) fn new(driver: &'a dyn Driver, addr: StreamAddr) -> Self {
        Self {
            driver,
            addr,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.driver.disable_channel(self.addr) {
            warn!(addr = %self.addr, %err, "rollback channel disable failed");
        }
    }
}

/// Reset a group, absorbing transient busy responses.
pub(crate) fn reset_group_with_retry(
    driver: &dyn Driver,
    module: ModuleKind,
    group: GroupId,
) -> Result<()> {
    for attempt in 1..=RESET_ATTEMPTS {
        match driver.reset_group(module, group) {
            Ok(()) => return Ok(()),
            Err(AxonError::Busy(what)) if attempt < RESET_ATTEMPTS => {
                warn!(module = %module, group = %group, attempt, what, "group reset busy; retrying");
                thread::sleep(RESET_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop returns on the final attempt")
}
