//! String-keyed pipeline property bag.
//!
//! The application surface configures a pipeline through `get_attr` /
//! `set_attr` with stable string keys rather than a struct per pipeline
//! flavor.  Writes are accepted only before the pipeline initializes its
//! modules (the values feed module attributes); reads are always allowed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use axon_core::error::{AxonError, Result};
use axon_media::ProcessorEngine;

pub const ATTR_VDEC_OUT_FIFO_DEPTH: &str = "vdec.out_fifo_depth";
pub const ATTR_VDEC_BLOCK_COUNT: &str = "vdec.block_count";
pub const ATTR_IVPS_OUT_FIFO_DEPTH: &str = "ivps.out_fifo_depth";
pub const ATTR_IVPS_BLOCK_COUNT: &str = "ivps.block_count";
pub const ATTR_IVPS_ENGINE: &str = "ivps.engine";
pub const ATTR_VENC_OUT_FIFO_DEPTH: &str = "venc.out_fifo_depth";
pub const ATTR_VENC_BLOCK_COUNT: &str = "venc.block_count";

/// Tunables behind the string keys, with workable defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineAttrs {
    #[serde(default = "default_fifo_depth")]
    pub vdec_out_fifo_depth: u32,
    #[serde(default = "default_vdec_blocks")]
    pub vdec_block_count: u32,
    #[serde(default = "default_fifo_depth")]
    pub ivps_out_fifo_depth: u32,
    #[serde(default = "default_ivps_blocks")]
    pub ivps_block_count: u32,
    #[serde(default)]
    pub ivps_engine: ProcessorEngine,
    #[serde(default = "default_venc_fifo_depth")]
    pub venc_out_fifo_depth: u32,
    #[serde(default = "default_venc_blocks")]
    pub venc_block_count: u32,
}

fn default_fifo_depth() -> u32 {
    4
}

fn default_vdec_blocks() -> u32 {
    8
}

fn default_ivps_blocks() -> u32 {
    6
}

fn default_venc_fifo_depth() -> u32 {
    8
}

// Sized above the stream fifo so a full fifo plus frames held by consumers
// cannot exhaust the pool.
fn default_venc_blocks() -> u32 {
    12
}

impl Default for PipelineAttrs {
    fn default() -> Self {
        Self {
            vdec_out_fifo_depth: default_fifo_depth(),
            vdec_block_count: default_vdec_blocks(),
            ivps_out_fifo_depth: default_fifo_depth(),
            ivps_block_count: default_ivps_blocks(),
            ivps_engine: ProcessorEngine::Auto,
            venc_out_fifo_depth: default_venc_fifo_depth(),
            venc_block_count: default_venc_blocks(),
        }
    }
}

impl PipelineAttrs {
    pub fn get(&self, key: &str) -> Result<Value> {
        match key {
            ATTR_VDEC_OUT_FIFO_DEPTH => Ok(self.vdec_out_fifo_depth.into()),
            ATTR_VDEC_BLOCK_COUNT => Ok(self.vdec_block_count.into()),
            ATTR_IVPS_OUT_FIFO_DEPTH => Ok(self.ivps_out_fifo_depth.into()),
            ATTR_IVPS_BLOCK_COUNT => Ok(self.ivps_block_count.into()),
            ATTR_IVPS_ENGINE => serde_json::to_value(self.ivps_engine)
                .map_err(|err| AxonError::IllegalParam(format!("{key}: {err}"))),
            ATTR_VENC_OUT_FIFO_DEPTH => Ok(self.venc_out_fifo_depth.into()),
            ATTR_VENC_BLOCK_COUNT => Ok(self.venc_block_count.into()),
            _ => Err(unknown_key(key)),
        }
    }

    pub fn set(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            ATTR_VDEC_OUT_FIFO_DEPTH => self.vdec_out_fifo_depth = positive_u32(key, value)?,
            ATTR_VDEC_BLOCK_COUNT => self.vdec_block_count = positive_u32(key, value)?,
            ATTR_IVPS_OUT_FIFO_DEPTH => self.ivps_out_fifo_depth = positive_u32(key, value)?,
            ATTR_IVPS_BLOCK_COUNT => self.ivps_block_count = positive_u32(key, value)?,
            ATTR_IVPS_ENGINE => {
                self.ivps_engine = serde_json::from_value(value.clone())
                    .map_err(|err| AxonError::IllegalParam(format!("{key}: {err}")))?;
            }
            ATTR_VENC_OUT_FIFO_DEPTH => self.venc_out_fifo_depth = positive_u32(key, value)?,
            ATTR_VENC_BLOCK_COUNT => self.venc_block_count = positive_u32(key, value)?,
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }
}

fn positive_u32(key: &str, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            AxonError::IllegalParam(format!("{key}: expected a positive integer, got {value}"))
        })
}

fn unknown_key(key: &str) -> AxonError {
    AxonError::IllegalParam(format!("unknown pipeline attribute '{key}'"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trips_numeric_attributes() {
        let mut attrs = PipelineAttrs::default();
        attrs.set(ATTR_VDEC_OUT_FIFO_DEPTH, &json!(12)).unwrap();
        assert_eq!(attrs.get(ATTR_VDEC_OUT_FIFO_DEPTH).unwrap(), json!(12));
    }

    #[test]
    fn engine_parses_from_snake_case() {
        let mut attrs = PipelineAttrs::default();
        attrs.set(ATTR_IVPS_ENGINE, &json!("gdc")).unwrap();
        assert_eq!(attrs.ivps_engine, ProcessorEngine::Gdc);
        assert_eq!(attrs.get(ATTR_IVPS_ENGINE).unwrap(), json!("gdc"));
    }

    #[test]
    fn unknown_key_is_illegal_param() {
        let mut attrs = PipelineAttrs::default();
        let err = attrs
            .set("venc.bitrate_mode", &json!(1))
            .expect_err("unknown key");
        assert!(err.to_string().contains("unknown pipeline attribute"));
        assert!(attrs.get("nope").is_err());
    }

    #[test]
    fn zero_and_non_numeric_values_are_rejected() {
        let mut attrs = PipelineAttrs::default();
        assert!(attrs.set(ATTR_VENC_BLOCK_COUNT, &json!(0)).is_err());
        assert!(attrs.set(ATTR_VENC_BLOCK_COUNT, &json!("eight")).is_err());
        assert_eq!(attrs.venc_block_count, default_venc_blocks(), "value unchanged");
    }
}
