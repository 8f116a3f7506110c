//! Daemon and camera configuration
//!
//! Loaded once at startup from a YAML file and validated into immutable
//! values. Every optional knob resolves to an effective default here so the
//! rest of the daemon never reasons about "absent" settings.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("no stream source configured")]
    MissingSource,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for the HTTP facade used by the negotiation layer
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Transcoder binary (resolved via PATH if not absolute)
    #[serde(default = "default_transcoder_bin")]
    pub transcoder_bin: String,
    /// Cameras served by this daemon
    pub cameras: Vec<CameraConfig>,
}

/// Configuration for a single camera
///
/// Read-only after construction. `validated()` must be called before the
/// camera is registered; it rejects cameras without a source and reconciles
/// the bitrate floor with the ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Unique name for the camera (used in log prefixes and API paths)
    pub name: String,
    /// Transcoder input descriptor (e.g. `-rtsp_transport tcp -i rtsp://…`)
    #[serde(default)]
    pub source: String,
    /// Input descriptor override for still capture (falls back to `source`)
    #[serde(default)]
    pub still_source: Option<String>,
    /// Video codec; `copy` passes the camera stream through unfiltered
    #[serde(default = "default_vcodec")]
    pub vcodec: String,
    /// RTP packet size; when unset the requested transport MTU is used
    #[serde(default)]
    pub packet_size: Option<u32>,
    /// Maximum emitted width (0 = unlimited)
    #[serde(default)]
    pub max_width: u32,
    /// Maximum emitted height (0 = unlimited)
    #[serde(default)]
    pub max_height: u32,
    /// Maximum emitted frame rate (0 = unlimited)
    #[serde(default)]
    pub max_fps: u32,
    /// Maximum video bitrate in kbit/s (0 = unlimited)
    #[serde(default)]
    pub max_bitrate: u32,
    /// Minimum video bitrate in kbit/s; clamped down to `max_bitrate`
    #[serde(default)]
    pub min_bitrate: u32,
    /// Extra encoder arguments appended verbatim
    #[serde(default)]
    pub encoder_options: Option<String>,
    /// Filter chain override; replaces the scale filter, never the flips
    #[serde(default)]
    pub video_filter: Option<String>,
    #[serde(default)]
    pub flip_horizontal: bool,
    #[serde(default)]
    pub flip_vertical: bool,
    /// Video stream mapping selector
    #[serde(default = "default_map_video")]
    pub map_video: String,
    /// Audio stream mapping selector
    #[serde(default = "default_map_audio")]
    pub map_audio: String,
    /// Enable camera-to-controller audio
    #[serde(default)]
    pub audio: bool,
    /// Surface full transcoder diagnostics in the log
    #[serde(default)]
    pub debug: bool,
    /// Network interface whose address is handed to controllers
    #[serde(default)]
    pub interface: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0:9180".to_string()
}

fn default_transcoder_bin() -> String {
    "ffmpeg".to_string()
}

fn default_vcodec() -> String {
    "libx264".to_string()
}

fn default_map_video() -> String {
    "0:0".to_string()
}

fn default_map_audio() -> String {
    "0:1".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl CameraConfig {
    /// Validate the camera configuration, resolving conflicting limits.
    ///
    /// A camera without a source cannot stream or snapshot and must not
    /// register. A bitrate floor above the ceiling is clamped down to it.
    pub fn validated(mut self) -> Result<Self> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::MissingSource);
        }
        if self.max_bitrate > 0 && self.min_bitrate > self.max_bitrate {
            log::warn!(
                "camera '{}': min_bitrate {} exceeds max_bitrate {}, clamping",
                self.name,
                self.min_bitrate,
                self.max_bitrate
            );
            self.min_bitrate = self.max_bitrate;
        }
        Ok(self)
    }

    /// Effective still-capture input descriptor
    pub fn still_input(&self) -> &str {
        self.still_source.as_deref().unwrap_or(&self.source)
    }
}
