//! Input liveness probing.
//!
//! Before the encoder is committed to a start, the input address is opened
//! with a throwaway ffmpeg run that decodes about a second of media into the
//! null muxer. The run is bounded by a hard wall-clock deadline; on expiry the
//! probe process is killed and the input is reported as timed out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Why an input could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "kebab-case")]
pub enum ProbeFailure {
    /// Nothing is listening on the input address.
    ConnectionRefused,
    /// The host, application or stream name does not resolve.
    NotFound,
    /// The probe did not finish before its deadline.
    Timeout,
    /// Anything else, with the last diagnostic line.
    Other(String),
}

impl ProbeFailure {
    /// Stable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection-refused",
            Self::NotFound => "not-found",
            Self::Timeout => "timeout",
            Self::Other(_) => "other",
        }
    }

    /// Operator-facing hint for fixing the failure.
    pub fn remediation(&self) -> String {
        match self {
            Self::ConnectionRefused => {
                "connection refused, check that the RTMP relay server is running and accepting connections".to_string()
            }
            Self::NotFound => {
                "input not found, check the input address and that a publisher is streaming to it".to_string()
            }
            Self::Timeout => {
                "input did not respond in time, check the firewall and that the relay is reachable".to_string()
            }
            Self::Other(detail) => format!("input could not be read: {detail}"),
        }
    }

    /// Classify ffmpeg diagnostics.
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_ascii_lowercase();

        if lower.contains("connection refused") {
            return Self::ConnectionRefused;
        }

        const NOT_FOUND_MARKERS: [&str; 6] = [
            "no such file or directory",
            "not found",
            "server returned 404",
            "no route to host",
            "name or service not known",
            "failure in name resolution",
        ];
        if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::NotFound;
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return Self::Timeout;
        }

        let detail = stderr
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .unwrap_or("unknown error")
            .to_string();
        Self::Other(detail)
    }
}

/// Read-only liveness check against an input address.
#[async_trait]
pub trait InputProbe: Send + Sync {
    /// Returns `Ok(())` when the input delivered media before `timeout`.
    ///
    /// Failures are [`Error::InputUnavailable`], or [`Error::EncoderMissing`]
    /// when the probe tool itself cannot be launched.
    async fn probe(&self, input_address: &str, timeout: Duration) -> Result<()>;
}

/// Probe backed by a short ffmpeg decode.
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    binary_path: String,
}

impl FfmpegProbe {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    fn build_args(input_address: &str) -> Vec<String> {
        [
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "error",
            "-i",
            input_address,
            "-t",
            "1",
            "-f",
            "null",
            "-",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }
}

#[async_trait]
impl InputProbe for FfmpegProbe {
    async fn probe(&self, input_address: &str, timeout: Duration) -> Result<()> {
        debug!(input = %input_address, ?timeout, "Probing input");

        let child = process_utils::tokio_command(&self.binary_path)
            .args(Self::build_args(input_address))
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::EncoderMissing(self.binary_path.clone()),
                _ => Error::Io(e),
            })?;

        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(input = %input_address, ?timeout, "Input probe timed out");
                return Err(Error::InputUnavailable(ProbeFailure::Timeout));
            }
        };

        if output.status.success() {
            debug!(input = %input_address, "Input is available");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let failure = ProbeFailure::classify(&stderr);
        warn!(
            input = %input_address,
            status = %output.status,
            reason = failure.code(),
            "Input probe failed"
        );
        Err(Error::InputUnavailable(failure))
    }
}
