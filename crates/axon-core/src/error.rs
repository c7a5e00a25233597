//! Typed error hierarchy for the SDK.
//!
//! Uses `thiserror` for library-grade errors.  Application code should wrap
//! these in `anyhow::Result` at call sites.
//!
//! Each variant maps to a stable integer code via [`AxonError::error_code`]
//! for structured telemetry without string parsing.

use crate::driver::{ModuleKind, StreamAddr};

/// All errors originating from the SDK.
#[derive(Debug, thiserror::Error)]
pub enum AxonError {
    // ── Attributes / handles ──────────────────────────────────────────
    #[error("illegal parameter: {0}")]
    IllegalParam(String),

    #[error("out of pool memory: {0}")]
    NoMemory(String),

    #[error("{module} handle is not initialized")]
    InvalidHandle { module: ModuleKind },

    #[error("{0} is not started")]
    NotStarted(&'static str),

    // ── Link registry ─────────────────────────────────────────────────
    #[error("no link registered from {src} to {dst}")]
    NotLinked { src: StreamAddr, dst: StreamAddr },

    // ── Dispatch workers ──────────────────────────────────────────────
    #[error("failed to start dispatch worker: {0}")]
    StartDispatchFailed(String),

    #[error("failed to stop dispatch worker: {0}")]
    StopDispatchFailed(String),

    // ── Driver boundary ───────────────────────────────────────────────
    #[error("driver busy: {0}")]
    Busy(&'static str),

    #[error("driver timeout: {0}")]
    Timeout(&'static str),

    #[error("driver error in {op}: {detail}")]
    Driver { op: &'static str, detail: String },
}

impl AxonError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: attribute/handle validation
    /// - 2xx: link registry
    /// - 3xx: dispatch workers
    /// - 4xx: driver boundary
    pub fn error_code(&self) -> u32 {
        match self {
            Self::IllegalParam(_) => 100,
            Self::NoMemory(_) => 101,
            Self::InvalidHandle { .. } => 102,
            Self::NotStarted(_) => 103,
            Self::NotLinked { .. } => 200,
            Self::StartDispatchFailed(_) => 300,
            Self::StopDispatchFailed(_) => 301,
            Self::Busy(_) => 400,
            Self::Timeout(_) => 401,
            Self::Driver { .. } => 402,
        }
    }

    /// Whether the failed call may be retried as-is.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Timeout(_))
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, AxonError>;
