//! The transcode pipeline: VDEC → [IVPS] → VENC.
//!
//! One external input (compressed stream packets in) and one external
//! output (encoded-stream observer callback).  The image-processor stage
//! exists only when the encode geometry differs from the decode geometry
//! (see [`processor_stage_required`]); otherwise the decoder's output
//! channel feeds the encoder directly over a hardware link.
//!
//! Ordering discipline:
//! - module construction runs consumer before producer (encoder,
//!   processor, decoder) so a producer is never destroyed before its
//!   consumer;
//! - `start` runs downstream first (encoder, processor, decoder) so
//!   nothing is dropped because a downstream stage was not ready, and
//!   `stop` runs the exact reverse;
//! - teardown is best-effort: every step is attempted, the first error is
//!   returned, the rest are logged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use axon_core::driver::{ChannelId, DeviceContext};
use axon_core::error::{AxonError, Result};
use axon_core::frame::{Frame, StreamChunkDesc};
use axon_core::sink::FrameSink;
use axon_media::{
    DecoderAttr, EncoderAttr, ImageProcessor, LinkRegistry, OutputChannelAttr, ProcessorAttr,
    VideoDecoder, VideoEncoder,
};

use crate::attrs::PipelineAttrs;
use crate::config::{Resolution, TranscodeConfig};
use crate::metrics::PipelineMetrics;

/// Whether a transcode needs the image-processor stage.
///
/// The stage is inserted exactly when the encode resolution differs from
/// the decode resolution; an equal-geometry transcode links the decoder
/// output straight into the encoder.  This is the transcode policy, not a
/// general rule — a pipeline that only crops, for example, owes its own
/// decision.
pub fn processor_stage_required(decode: Resolution, encode: Resolution) -> bool {
    decode != encode
}

/// Receives the encoded stream as it leaves the pipeline.
///
/// Called from the encoder's dispatch thread; a slow observer stalls the
/// encoded-stream channel (accepted backpressure).
pub trait StreamObserver: Send + Sync {
    fn on_stream(&self, chunk: &StreamChunkDesc);
}

impl<F> StreamObserver for F
where
    F: Fn(&StreamChunkDesc) + Send + Sync,
{
    fn on_stream(&self, chunk: &StreamChunkDesc) {
        self(chunk)
    }
}

/// Sink adapter turning encoded-stream frames into observer callbacks.
struct EncoderTap {
    observer: Arc<dyn StreamObserver>,
    metrics: Arc<PipelineMetrics>,
}

impl FrameSink for EncoderTap {
    fn on_frame(&self, frame: Frame) -> Result<()> {
        let Some(chunk) = frame.stream() else {
            warn!(addr = %frame.addr(), "non-stream frame at the encoder tap dropped");
            return Ok(());
        };
        self.metrics.note_chunk(chunk.pts, chunk.data.len());
        self.observer.on_stream(chunk);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelineState {
    /// Constructed; attributes still mutable, no hardware touched.
    Created,
    /// Modules initialized and linked.
    Initialized,
    Started,
}

/// One transcode pipeline instance.
pub struct TranscodePipeline {
    ctx: Arc<DeviceContext>,
    cfg: TranscodeConfig,
    links: LinkRegistry,
    vdec: VideoDecoder,
    ivps: Option<ImageProcessor>,
    venc: VideoEncoder,
    tap: Arc<dyn FrameSink>,
    metrics: Arc<PipelineMetrics>,
    state: PipelineState,
}

impl TranscodePipeline {
    /// Construct the pipeline.  No hardware is touched until [`start`];
    /// attributes stay mutable until then.
    ///
    /// [`start`]: TranscodePipeline::start
    pub fn create(
        ctx: Arc<DeviceContext>,
        cfg: TranscodeConfig,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Self> {
        cfg.validate()?;
        let metrics = PipelineMetrics::new();
        let tap: Arc<dyn FrameSink> = Arc::new(EncoderTap {
            observer,
            metrics: metrics.clone(),
        });
        Ok(Self {
            links: LinkRegistry::new(ctx.clone()),
            vdec: VideoDecoder::new(ctx.clone()),
            ivps: None,
            venc: VideoEncoder::new(ctx.clone()),
            ctx,
            cfg,
            tap,
            metrics,
            state: PipelineState::Created,
        })
    }

    pub fn is_started(&self) -> bool {
        self.state == PipelineState::Started
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Initialize modules (consumer before producer), register the encoder
    /// tap, and create the link edges.  Any failure unwinds everything
    /// already created.
    fn init_modules(&mut self) -> Result<()> {
        let attrs = self.cfg.attrs;
        let decode = self.cfg.input.resolution;
        let encode = self.cfg.output.resolution;

        self.venc.init(EncoderAttr {
            codec: self.cfg.output.codec,
            width: encode.width,
            height: encode.height,
            gop_length: 0,
            block_count: attrs.venc_block_count,
            fifo_depth: attrs.venc_out_fifo_depth,
        })?;

        if processor_stage_required(decode, encode) {
            let mut ivps = ImageProcessor::new(self.ctx.clone());
            ivps.init(ProcessorAttr {
                width: decode.width,
                height: decode.height,
                engine: attrs.ivps_engine,
                block_count: attrs.ivps_block_count,
                outputs: vec![OutputChannelAttr {
                    width: encode.width,
                    height: encode.height,
                    fifo_depth: attrs.ivps_out_fifo_depth,
                    compression: Default::default(),
                }],
            })?;
            self.ivps = Some(ivps);
        }

        self.vdec.init(DecoderAttr {
            codec: self.cfg.input.codec,
            width: decode.width,
            height: decode.height,
            block_count: attrs.vdec_block_count,
            outputs: vec![OutputChannelAttr {
                width: decode.width,
                height: decode.height,
                fifo_depth: attrs.vdec_out_fifo_depth,
                compression: Default::default(),
            }],
        })?;

        self.venc.register_sink(self.tap.clone())?;

        let vdec_out = self.vdec.output_addr(ChannelId(0))?;
        let venc_in = self.venc.input_addr()?;
        if let Some(ivps) = &self.ivps {
            self.links.link(vdec_out, ivps.input_addr()?)?;
            self.links.link(ivps.output_addr(ChannelId(0))?, venc_in)?;
        } else {
            self.links.link(vdec_out, venc_in)?;
        }
        info!(
            input = %decode,
            output = %encode,
            scaled = self.ivps.is_some(),
            "transcode pipeline initialized"
        );
        Ok(())
    }

    /// Initialize on first use, then start downstream-first: encoder,
    /// processor, decoder.  A failure partway stops whatever already
    /// started and returns the first error.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Started => {
                warn!("pipeline start ignored; already started");
                return Ok(());
            }
            PipelineState::Created => {
                if let Err(err) = self.init_modules() {
                    error!(%err, "pipeline init failed; unwinding");
                    if let Err(teardown) = self.deinit() {
                        warn!(%teardown, "unwind after failed init reported an error");
                    }
                    return Err(err);
                }
                self.state = PipelineState::Initialized;
            }
            PipelineState::Initialized => {}
        }

        self.venc.start(&self.links)?;
        if let Some(ivps) = self.ivps.as_mut()
            && let Err(err) = ivps.start(&self.links)
        {
            if let Err(stop_err) = self.venc.stop() {
                warn!(%stop_err, "encoder stop after failed start");
            }
            return Err(err);
        }
        if let Err(err) = self.vdec.start(&self.links) {
            if let Some(ivps) = self.ivps.as_mut()
                && let Err(stop_err) = ivps.stop()
            {
                warn!(%stop_err, "processor stop after failed start");
            }
            if let Err(stop_err) = self.venc.stop() {
                warn!(%stop_err, "encoder stop after failed start");
            }
            return Err(err);
        }
        self.state = PipelineState::Started;
        info!("transcode pipeline started");
        Ok(())
    }

    /// Stop in the reverse of start order: decoder, processor, encoder.
    /// Frames already delivered to the observer stay valid; no new frames
    /// are produced.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != PipelineState::Started {
            return Ok(());
        }
        let mut first_err = None;
        if let Err(err) = self.vdec.stop() {
            warn!(%err, "decoder stop failed");
            first_err.get_or_insert(err);
        }
        if let Some(ivps) = self.ivps.as_mut()
            && let Err(err) = ivps.stop()
        {
            warn!(%err, "processor stop failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.venc.stop() {
            warn!(%err, "encoder stop failed");
            first_err.get_or_insert(err);
        }
        self.state = PipelineState::Initialized;
        self.metrics.report();
        info!("transcode pipeline stopped");
        first_err.map_or(Ok(()), Err)
    }

    /// Reverse of init: unregister the tap, unlink the edges, deinit
    /// encoder → processor → decoder.  Best-effort.
    pub fn deinit(&mut self) -> Result<()> {
        if self.state == PipelineState::Started {
            warn!("pipeline deinit while started; stopping first");
            if let Err(err) = self.stop() {
                warn!(%err, "implicit stop failed");
            }
        }
        let mut first_err = None;
        if self.venc.is_initialized()
            && let Err(err) = self.venc.unregister_sink(&self.tap)
        {
            warn!(%err, "encoder tap unregister failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.links.unlink_all() {
            warn!(%err, "unlink failed during teardown");
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.venc.deinit() {
            warn!(%err, "encoder deinit failed");
            first_err.get_or_insert(err);
        }
        if let Some(mut ivps) = self.ivps.take()
            && let Err(err) = ivps.deinit()
        {
            warn!(%err, "processor deinit failed");
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.vdec.deinit() {
            warn!(%err, "decoder deinit failed");
            first_err.get_or_insert(err);
        }
        self.state = PipelineState::Created;
        first_err.map_or(Ok(()), Err)
    }

    /// Queue one compressed packet into the decoder.  An empty payload
    /// signals end-of-stream.
    pub fn send_stream(&self, data: &[u8], pts: i64, timeout: Duration) -> Result<()> {
        if self.state != PipelineState::Started {
            return Err(AxonError::NotStarted("pipeline"));
        }
        if !data.is_empty() {
            self.metrics.note_packet();
        }
        self.vdec.send_stream(data, pts, timeout)
    }

    /// Read a pipeline attribute.  Always allowed.
    pub fn get_attr(&self, key: &str) -> Result<serde_json::Value> {
        self.cfg.attrs.get(key)
    }

    /// Write a pipeline attribute.  Allowed only before the pipeline is
    /// initialized — the values feed module attributes at init.
    pub fn set_attr(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        if self.state != PipelineState::Created {
            return Err(AxonError::IllegalParam(format!(
                "{key}: pipeline attributes are frozen once started"
            )));
        }
        self.cfg.attrs.set(key, value)
    }

    pub fn attrs(&self) -> &PipelineAttrs {
        &self.cfg.attrs
    }

    /// Tear the pipeline down and consume it, reporting the first error
    /// encountered.
    pub fn destroy(mut self) -> Result<()> {
        let mut first_err = None;
        if let Err(err) = self.stop() {
            first_err.get_or_insert(err);
        }
        if let Err(err) = self.deinit() {
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for TranscodePipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(%err, "pipeline stop on drop failed");
        }
        if let Err(err) = self.deinit() {
            warn!(%err, "pipeline deinit on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use axon_core::driver::Codec;
    use axon_sim::SimCard;

    use crate::attrs::ATTR_VENC_OUT_FIFO_DEPTH;
    use crate::config::StreamFormat;

    use super::*;

    #[test]
    fn processor_policy_follows_geometry() {
        let full = Resolution::new(1920, 1080);
        let scaled = Resolution::new(1280, 720);
        assert!(processor_stage_required(full, scaled));
        assert!(!processor_stage_required(full, full));
    }

    fn config(output: Resolution) -> TranscodeConfig {
        TranscodeConfig::new(
            StreamFormat {
                codec: Codec::H264,
                resolution: Resolution::new(1920, 1080),
            },
            StreamFormat {
                codec: Codec::Hevc,
                resolution: output,
            },
        )
    }

    fn null_observer() -> Arc<dyn StreamObserver> {
        Arc::new(|_: &StreamChunkDesc| {})
    }

    #[test]
    fn send_before_start_is_not_started() {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card, 0);
        let pipeline =
            TranscodePipeline::create(ctx, config(Resolution::new(1280, 720)), null_observer())
                .unwrap();
        let err = pipeline
            .send_stream(&[0, 0, 0, 1], 0, Duration::from_millis(10))
            .expect_err("send before start");
        assert!(matches!(err, AxonError::NotStarted("pipeline")));
    }

    #[test]
    fn attributes_freeze_at_start() {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card, 0);
        let mut pipeline =
            TranscodePipeline::create(ctx, config(Resolution::new(1280, 720)), null_observer())
                .unwrap();
        pipeline
            .set_attr(ATTR_VENC_OUT_FIFO_DEPTH, &json!(16))
            .expect("mutable before start");
        pipeline.start().unwrap();
        let err = pipeline
            .set_attr(ATTR_VENC_OUT_FIFO_DEPTH, &json!(4))
            .expect_err("frozen after start");
        assert!(matches!(err, AxonError::IllegalParam(_)));
        // Reads stay allowed.
        assert_eq!(pipeline.get_attr(ATTR_VENC_OUT_FIFO_DEPTH).unwrap(), json!(16));
        pipeline.destroy().unwrap();
    }

    #[test]
    fn init_failure_unwinds_everything() {
        let card = SimCard::new();
        let ctx = DeviceContext::new(card.clone(), 0);
        let mut pipeline =
            TranscodePipeline::create(ctx, config(Resolution::new(1280, 720)), null_observer())
                .unwrap();
        // All three modules initialize, then the first link call fails;
        // the unwind must deinit every group and remove every edge.
        card.fail_once(axon_sim::SimOp::Link);
        pipeline.start().expect_err("injected link fault");
        assert_eq!(card.group_count(), 0, "nothing leaked");
        assert_eq!(card.link_count(), 0);
    }
}
