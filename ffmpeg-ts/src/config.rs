use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_VIDEO_CODEC: &str = "h264";
pub const DEFAULT_AUDIO_CODEC: &str = "aac";
pub const DEFAULT_STREAM_PATH: &str = "/stream";

/// Bounds for the audio accumulator, expressed in encoder frames so the
/// bound tracks whatever frame size the audio encoder settles on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressurePolicy {
    /// Target amount of buffered audio, in seconds.
    pub audio_window_secs: f64,
    pub min_audio_frames: usize,
    pub max_audio_frames: usize,
    /// Share of the bound discarded (oldest first) when a push overflows it.
    pub eviction_fraction: f64,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            audio_window_secs: 0.5,
            min_audio_frames: 10,
            max_audio_frames: 200,
            eviction_fraction: 0.10,
        }
    }
}

impl BackpressurePolicy {
    /// Number of encoder frames the accumulator may hold at `sample_rate`.
    pub fn audio_buffer_frames(&self, sample_rate: u32, frame_size: usize) -> usize {
        let max = self.max_audio_frames.max(self.min_audio_frames);
        if frame_size == 0 {
            return self.min_audio_frames;
        }
        let frames = (sample_rate as f64 * self.audio_window_secs / frame_size as f64) as usize;
        frames.clamp(self.min_audio_frames, max)
    }

    /// Accumulator bound in interleaved samples.
    pub fn audio_buffer_samples(&self, sample_rate: u32, frame_size: usize, channels: u32) -> usize {
        self.audio_buffer_frames(sample_rate, frame_size) * frame_size * channels as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub port: u16,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_preset: String,
    /// Frames between forced keyframes. `None` means one second of video.
    pub keyframe_interval: Option<u32>,
    pub sample_rate: u32,
    pub channels: u32,
    pub stream_path: String,
    pub backpressure: BackpressurePolicy,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            width: 1920,
            height: 1080,
            fps: 60,
            video_bitrate: 2_000_000,
            audio_bitrate: 128_000,
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            video_preset: "veryfast".to_string(),
            keyframe_interval: None,
            sample_rate: 44100,
            channels: 2,
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

impl StreamerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("invalid stream size {}x{}", self.width, self.height);
        }
        // yuv420p needs even dimensions
        if self.width % 2 != 0 || self.height % 2 != 0 {
            anyhow::bail!("stream size {}x{} must be even", self.width, self.height);
        }
        if self.fps == 0 {
            anyhow::bail!("fps must be positive");
        }
        if self.sample_rate == 0 {
            anyhow::bail!("sample rate must be positive");
        }
        if self.channels == 0 || self.channels > 8 {
            anyhow::bail!("unsupported channel count {}", self.channels);
        }
        if !self.stream_path.starts_with('/') {
            anyhow::bail!("stream path must start with '/': {}", self.stream_path);
        }
        let policy = &self.backpressure;
        if !(policy.eviction_fraction > 0.0 && policy.eviction_fraction <= 1.0) {
            anyhow::bail!("eviction fraction must be in (0, 1]: {}", policy.eviction_fraction);
        }
        if policy.min_audio_frames == 0 {
            anyhow::bail!("audio buffer needs at least one frame");
        }
        Ok(())
    }

    pub fn keyframe_interval(&self) -> u32 {
        self.keyframe_interval.filter(|n| *n > 0).unwrap_or(self.fps).max(1)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn stream_url(&self, port: u16) -> String {
        format!("http://localhost:{}{}", port, self.stream_path)
    }
}
