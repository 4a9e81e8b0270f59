pub mod capture;
pub mod control;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::camera::{Camera, ExposureId, ExposureRequest, Gphoto2Camera};
pub use capture::frame::{Frame, PixelFormat};
pub use control::controller::CaptureController;
pub use control::mode::OperatingMode;
pub use error::{Error, Result};
pub use pipeline::stream::FrameStream;

/// Prefix for environment overrides, e.g. `ASTROCAM_STREAM__CHUNK_SIZE=8192`
pub const ENV_PREFIX: &str = "ASTROCAM";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera CLI executable
    pub program: String,
    /// Upper bound for the post-stream release command
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frames buffered for `get_frame` before the oldest is dropped
    pub queue_capacity: usize,
    /// Bytes requested per pipe read
    pub chunk_size: usize,
    /// Encoded frames below this size are discarded as corrupt
    pub min_frame_bytes: usize,
    /// Look-ahead limit while searching for a frame boundary
    pub max_buffer_bytes: usize,
    /// Grace period between SIGTERM and SIGKILL
    pub graceful_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub bulb_seconds: u64,
    /// Download every N seconds during a schedule; `None` never downloads
    pub download_interval_secs: Option<u64>,
    pub keep_on_camera: bool,
    /// Download single captures to the host
    pub download_to_host: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            program: "gphoto2".into(),
            reset_timeout_ms: 5_000,
        }
    }
}

impl CameraConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2,
            chunk_size: 4096,
            min_frame_bytes: capture::decoder::DEFAULT_MIN_FRAME_BYTES,
            max_buffer_bytes: 16 * 1024 * 1024,
            graceful_timeout_ms: 2_000,
        }
    }
}

impl StreamConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            bulb_seconds: 30,
            download_interval_secs: None,
            keep_on_camera: true,
            download_to_host: true,
        }
    }
}

impl ScheduleConfig {
    pub fn bulb_duration(&self) -> Duration {
        Duration::from_secs(self.bulb_seconds)
    }

    pub fn download_interval(&self) -> Option<Duration> {
        self.download_interval_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `ASTROCAM_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Toml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[stream]\nchunk_size = 8192\n\n[schedule]\nbulb_seconds = 120\ndownload_interval_secs = 600\n"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.stream.chunk_size, 8192);
        assert_eq!(config.stream.queue_capacity, 2);
        assert_eq!(config.schedule.bulb_duration(), Duration::from_secs(120));
        assert_eq!(
            config.schedule.download_interval(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.camera.program, "gphoto2");
    }

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.stream.min_frame_bytes, 100);
        assert_eq!(config.stream.graceful_timeout(), Duration::from_secs(2));
        assert!(config.schedule.download_interval().is_none());
    }
}
