//! Shared seams for the axon accelerator-card SDK.
//!
//! This crate is the neutral home breaking the dependency cycle between the
//! driver implementations, the module wrappers, and the pipeline
//! orchestrator: error taxonomy, typed ids, the [`Driver`] call contract,
//! the [`Frame`] buffer type with its pool-reference guard, and the
//! [`FrameSink`] consumer capability.
//!
//! [`Driver`]: driver::Driver
//! [`Frame`]: frame::Frame
//! [`FrameSink`]: sink::FrameSink

pub mod driver;
pub mod error;
pub mod frame;
pub mod sink;

pub use driver::{
    BlockId, ChannelId, ChannelSpec, Codec, Compression, DeviceContext, DeviceThreadGuard,
    Driver, GroupId, GroupSpec, ModuleKind, PixelFormat, PollEvent, RawOutput, SelectOutcome,
    StreamAddr, StreamPacket,
};
pub use error::{AxonError, Result};
pub use frame::{BlockRef, Frame, FramePayload, StreamChunkDesc, VideoFrameDesc};
pub use sink::{FrameSink, SinkRegistry};
