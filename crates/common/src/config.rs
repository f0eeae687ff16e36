//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::format::{FourCc, Resolution, VideoCodec};

/// Fixed per-buffer capacity for coded bitstream data (1 MiB).
pub const STREAM_BUFFER_SIZE: usize = 1 << 20;

/// Advisory number of OUTPUT (bitstream) buffers requested at open.
pub const STREAM_BUFFER_COUNT: u32 = 3;

/// Number of converter CAPTURE buffers requested when chaining.
pub const CONVERTER_BUFFER_COUNT: u32 = 3;

/// Configuration for one decode session.
///
/// Defaults mirror the Exynos MFC/FIMC pipeline this engine was built
/// around; all knobs are overridable for other driver families.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Compressed codec fed to the decoder OUTPUT queue.
    pub codec: VideoCodec,
    /// Picture size the caller wants out of the pipeline.
    pub target: Resolution,
    /// Linear pixel layout the caller can consume.
    pub target_fourcc: FourCc,
    /// Advisory OUTPUT pool size; the driver's answer wins.
    pub output_buffer_count: u32,
    /// Converter CAPTURE pool size when conversion is chained.
    pub converter_buffer_count: u32,
    /// Per-buffer byte capacity for coded bitstream data.
    pub stream_buffer_size: usize,
    /// Headroom multiplier applied to the driver's minimum CAPTURE count.
    pub capture_headroom: f64,
    /// Budget for every bounded queue poll, in milliseconds.
    pub poll_timeout_ms: u32,
    /// Substring the decoder's driver name must contain.
    pub decoder_driver: String,
    /// Substrings the converter's driver name must all contain.
    pub converter_driver: Vec<String>,
}

impl SessionConfig {
    pub fn new(codec: VideoCodec, target: Resolution) -> Self {
        Self {
            codec,
            target,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            target: Resolution::HD,
            target_fourcc: FourCc::YUV420M,
            output_buffer_count: STREAM_BUFFER_COUNT,
            converter_buffer_count: CONVERTER_BUFFER_COUNT,
            stream_buffer_size: STREAM_BUFFER_SIZE,
            capture_headroom: 1.5,
            poll_timeout_ms: 1000,
            decoder_driver: "s5p-mfc-dec".to_string(),
            converter_driver: vec!["fimc".to_string(), "m2m".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.codec, VideoCodec::H264);
        assert_eq!(config.output_buffer_count, 3);
        assert_eq!(config.stream_buffer_size, 1 << 20);
        assert_eq!(config.poll_timeout_ms, 1000);
        assert!((config.capture_headroom - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn new_overrides_codec_and_target() {
        let config = SessionConfig::new(VideoCodec::Mpeg2, Resolution::new(720, 576));
        assert_eq!(config.codec, VideoCodec::Mpeg2);
        assert_eq!(config.target, Resolution::new(720, 576));
        assert_eq!(config.target_fourcc, FourCc::YUV420M);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.decoder_driver, config.decoder_driver);
        assert_eq!(back.target, config.target);
    }
}
