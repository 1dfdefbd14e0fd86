//! Encoder subprocess management.
//!
//! The encoder is an ffmpeg process that reads the live input at native pace,
//! re-encodes it with a fixed 720p/AAC profile and publishes FLV over RTMP.

mod controller;
mod policy;

pub use controller::{EncoderEvent, EncoderHandle, EncoderId, LifecycleEvent, ProcessController};
pub use policy::{EncodingPolicy, build_args};

/// Detect the encoder version by running `<binary> -version`.
///
/// Returns the first line of output, or `None` when the binary cannot be run.
pub async fn detect_version(binary_path: &str) -> Option<String> {
    let output = process_utils::tokio_command(binary_path)
        .arg("-version")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8(output.stdout)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.to_string()))
}
