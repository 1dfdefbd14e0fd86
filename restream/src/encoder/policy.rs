//! Fixed encoding profile.

use crate::config::StreamConfig;

/// Encoding parameters passed to every encoder invocation.
///
/// These are policy, not user settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingPolicy {
    pub width: u32,
    pub height: u32,
    pub video_codec: &'static str,
    pub preset: &'static str,
    pub max_video_kbps: u32,
    pub buffer_kbits: u32,
    pub gop_size: u32,
    pub frame_rate: u32,
    pub audio_codec: &'static str,
    pub audio_kbps: u32,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
    pub container: &'static str,
}

impl EncodingPolicy {
    /// 720p25 H.264 with stereo AAC, muxed as FLV.
    pub const LIVE_720P: Self = Self {
        width: 1280,
        height: 720,
        video_codec: "libx264",
        preset: "veryfast",
        max_video_kbps: 2500,
        buffer_kbits: 5000,
        gop_size: 50,
        frame_rate: 25,
        audio_codec: "aac",
        audio_kbps: 128,
        audio_channels: 2,
        audio_sample_rate: 44100,
        container: "flv",
    };

    /// Input options. `-re` paces reading at the native frame rate.
    fn input_args(&self) -> Vec<String> {
        [
            "-re",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-strict",
            "experimental",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    fn output_args(&self) -> Vec<String> {
        vec![
            "-c:v".to_string(),
            self.video_codec.to_string(),
            "-preset".to_string(),
            self.preset.to_string(),
            "-maxrate".to_string(),
            format!("{}k", self.max_video_kbps),
            "-bufsize".to_string(),
            format!("{}k", self.buffer_kbits),
            "-vf".to_string(),
            format!("scale={}:{}", self.width, self.height),
            "-g".to_string(),
            self.gop_size.to_string(),
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-c:a".to_string(),
            self.audio_codec.to_string(),
            "-b:a".to_string(),
            format!("{}k", self.audio_kbps),
            "-ac".to_string(),
            self.audio_channels.to_string(),
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
            "-f".to_string(),
            self.container.to_string(),
        ]
    }
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self::LIVE_720P
    }
}

/// Build the full ffmpeg argument list for relaying `config`.
pub fn build_args(policy: &EncodingPolicy, config: &StreamConfig) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-nostats", "-loglevel", "warning"]
        .into_iter()
        .map(String::from)
        .collect();

    args.extend(policy.input_args());
    args.extend(["-i".to_string(), config.input_address.clone()]);
    args.extend(policy.output_args());
    args.push(config.publish_url());

    args
}
