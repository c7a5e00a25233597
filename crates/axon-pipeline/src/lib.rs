//! Named pipelines composed from the module wrappers.
//!
//! A pipeline owns its modules, the link edges between them, and the sink
//! adapter that turns hardware output into the application's callback.
//! The only flavor here is [`TranscodePipeline`] (decode → optional
//! scale → encode); its construction/teardown ordering rules live in
//! [`transcode`].

pub mod attrs;
pub mod config;
pub mod metrics;
pub mod transcode;

pub use attrs::{
    ATTR_IVPS_BLOCK_COUNT, ATTR_IVPS_ENGINE, ATTR_IVPS_OUT_FIFO_DEPTH, ATTR_VDEC_BLOCK_COUNT,
    ATTR_VDEC_OUT_FIFO_DEPTH, ATTR_VENC_BLOCK_COUNT, ATTR_VENC_OUT_FIFO_DEPTH, PipelineAttrs,
};
pub use config::{CONFIG_SCHEMA_VERSION, Resolution, StreamFormat, TranscodeConfig};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use transcode::{StreamObserver, TranscodePipeline, processor_stage_required};
