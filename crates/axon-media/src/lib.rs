//! Hardware module wrappers and the plumbing between them.
//!
//! Each wrapper ([`VideoDecoder`], [`ImageProcessor`], [`VideoEncoder`])
//! owns one driver group: its attribute validation, the
//! `init → start → stop → deinit` state machine with rollback on partial
//! failure, and the dispatch workers that pull completed buffers off its
//! unlinked output channels.  [`LinkRegistry`] mirrors the driver's
//! zero-copy link table so edges can be deduplicated and torn down without
//! round-tripping to the card.
//!
//! [`VideoDecoder`]: decoder::VideoDecoder
//! [`ImageProcessor`]: processor::ImageProcessor
//! [`VideoEncoder`]: encoder::VideoEncoder
//! [`LinkRegistry`]: link::LinkRegistry

pub mod decoder;
pub mod dispatch;
pub mod encoder;
mod group;
pub mod link;
pub mod processor;

pub use decoder::{DecoderAttr, VideoDecoder};
pub use dispatch::{ChannelDispatch, SelectDispatch};
pub use encoder::{EncoderAttr, VideoEncoder};
pub use group::OutputChannelAttr;
pub use link::LinkRegistry;
pub use processor::{ImageProcessor, ProcessorAttr, ProcessorEngine};
