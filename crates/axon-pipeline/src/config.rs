//! Serde-loadable transcode configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use axon_core::driver::Codec;
use axon_core::error::{AxonError, Result};

use crate::attrs::PipelineAttrs;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Codec plus geometry for one side of the transcode.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StreamFormat {
    pub codec: Codec,
    pub resolution: Resolution,
}

/// Full description of one transcode pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    #[serde(default = "schema_version")]
    pub config_schema_version: u32,
    pub input: StreamFormat,
    pub output: StreamFormat,
    #[serde(default)]
    pub attrs: PipelineAttrs,
}

fn schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

impl TranscodeConfig {
    pub fn new(input: StreamFormat, output: StreamFormat) -> Self {
        Self {
            config_schema_version: CONFIG_SCHEMA_VERSION,
            input,
            output,
            attrs: PipelineAttrs::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_schema_version != CONFIG_SCHEMA_VERSION {
            return Err(AxonError::IllegalParam(format!(
                "config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {}",
                self.config_schema_version
            )));
        }
        for (side, format) in [("input", &self.input), ("output", &self.output)] {
            let res = format.resolution;
            if res.width == 0 || res.height == 0 {
                return Err(AxonError::IllegalParam(format!(
                    "{side}: zero geometry {res}"
                )));
            }
        }
        Ok(())
    }

    /// Parse a JSON config, rejecting missing or mismatched schema
    /// versions before deserializing the rest.
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| AxonError::IllegalParam(format!("invalid transcode config: {err}")))?;

        let version = value
            .get("config_schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                AxonError::IllegalParam(format!(
                    "config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got missing"
                ))
            })?;
        if version != u64::from(CONFIG_SCHEMA_VERSION) {
            return Err(AxonError::IllegalParam(format!(
                "config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {version}"
            )));
        }

        let config: Self = serde_json::from_value(value)
            .map_err(|err| AxonError::IllegalParam(format!("invalid transcode config: {err}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_with_defaults() {
        let raw = r#"{
            "config_schema_version": 1,
            "input": {"codec": "h264", "resolution": {"width": 1920, "height": 1080}},
            "output": {"codec": "hevc", "resolution": {"width": 1280, "height": 720}}
        }"#;
        let config = TranscodeConfig::from_json_str(raw).expect("valid config");
        assert_eq!(config.input.codec, Codec::H264);
        assert_eq!(config.output.resolution, Resolution::new(1280, 720));
        assert_eq!(config.attrs, PipelineAttrs::default());
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let raw = r#"{"input": {"codec": "h264", "resolution": {"width": 16, "height": 16}},
                      "output": {"codec": "h264", "resolution": {"width": 16, "height": 16}}}"#;
        let err = TranscodeConfig::from_json_str(raw).expect_err("missing version");
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let mut config = TranscodeConfig::new(
            StreamFormat {
                codec: Codec::H264,
                resolution: Resolution::new(1920, 1080),
            },
            StreamFormat {
                codec: Codec::Hevc,
                resolution: Resolution::new(0, 720),
            },
        );
        assert!(config.validate().is_err());
        config.output.resolution = Resolution::new(1280, 720);
        config.validate().expect("fixed config validates");
    }
}
