//! Service configuration.
//!
//! [`ServiceConfig`] carries the process-level settings read once at
//! startup. [`ConfigStore`] holds the mutable stream destination that
//! callers change at runtime.

mod store;

pub use store::{ConfigStore, ConfigUpdate, StreamConfig};

use std::path::PathBuf;
use std::time::Duration;

/// Default input the relay server publishes on.
pub const DEFAULT_INPUT_URL: &str = "rtmp://localhost:1935/live/stream";

/// Default hard deadline for the input probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period between SIGTERM and a forced kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Path or name of the ffmpeg binary.
    pub ffmpeg_path: String,
    /// Initial input source address.
    pub input_url: String,
    /// Hard wall-clock limit for a single input probe.
    pub probe_timeout: Duration,
    /// How long a stopping encoder may take before it is killed.
    pub stop_grace: Duration,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            ffmpeg_path: "ffmpeg".to_string(),
            input_url: DEFAULT_INPUT_URL.to_string(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl ServiceConfig {
    /// Load settings from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `API_BIND_ADDRESS` (e.g. "0.0.0.0")
    /// - `API_PORT` or `PORT` (e.g. "3000")
    /// - `RESTREAM_FFMPEG_PATH`
    /// - `RESTREAM_INPUT_URL`
    /// - `RESTREAM_PROBE_TIMEOUT_SECS`
    /// - `RESTREAM_STOP_GRACE_SECS`
    /// - `RESTREAM_LOG_DIR`
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind_address) = non_empty("API_BIND_ADDRESS") {
            config.bind_address = bind_address;
        }

        if let Some(port) = non_empty("API_PORT")
            .or_else(|| non_empty("PORT"))
            .and_then(|p| p.trim().parse::<u16>().ok())
        {
            config.port = port;
        }

        if let Some(path) = non_empty("RESTREAM_FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }

        if let Some(url) = non_empty("RESTREAM_INPUT_URL") {
            config.input_url = url;
        }

        if let Some(secs) = non_empty("RESTREAM_PROBE_TIMEOUT_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            config.probe_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) =
            non_empty("RESTREAM_STOP_GRACE_SECS").and_then(|s| s.trim().parse::<u64>().ok())
        {
            config.stop_grace = Duration::from_secs(secs);
        }

        if let Some(dir) = non_empty("RESTREAM_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        config
    }
}
