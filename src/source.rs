use std::f32::consts::TAU;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::SharedManager;
use crate::config::AppConfig;

/// Audio is produced in chunks of this many frames per channel.
const AUDIO_CHUNK_FRAMES: usize = 1024;

/// Moving color bars with a sweeping white line.
pub struct TestPattern {
    width: u32,
    height: u32,
    frame: u64,
}

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }

    pub fn next_frame(&mut self, buf: &mut Vec<u8>) {
        let (width, height) = (self.width as usize, self.height as usize);
        buf.resize(width * height * 3, 0);
        let bar_width = (width / BARS.len()).max(1);
        let offset = self.frame as usize * 4;
        let line = self.frame as usize % height.max(1);
        for (y, row) in buf.chunks_exact_mut(width * 3).enumerate() {
            for (x, pixel) in row.chunks_exact_mut(3).enumerate() {
                let color = if y == line {
                    [255, 255, 255]
                } else {
                    BARS[((x + offset) / bar_width) % BARS.len()]
                };
                pixel.copy_from_slice(&color);
            }
        }
        self.frame += 1;
    }
}

/// Interleaved sine tone, identical on every channel.
pub struct Tone {
    phase: f32,
    step: f32,
    channels: usize,
}

impl Tone {
    pub fn new(frequency: f32, sample_rate: u32, channels: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
            channels: channels.max(1) as usize,
        }
    }

    pub fn fill(&mut self, frames: usize, buf: &mut Vec<i16>) {
        buf.clear();
        for _ in 0..frames {
            let sample = (self.phase.sin() * 0.25 * i16::MAX as f32) as i16;
            buf.extend(std::iter::repeat(sample).take(self.channels));
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}

/// Feeds the manager with a test pattern and tone at the configured cadence
/// until `cancel` fires. Stands in for a real capture device.
pub fn spawn(
    manager: SharedManager,
    config: &AppConfig,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let settings = &config.streamer;
    let (width, height, fps) = (settings.width, settings.height, settings.fps);
    let (sample_rate, channels) = (settings.sample_rate, settings.channels);
    let tone_hz = config.tone_hz;
    let handle = thread::Builder::new().name("capture".into()).spawn(move || {
        log::info!("synthetic capture started: {}x{}@{}", width, height, fps);
        let mut pattern = TestPattern::new(width, height);
        let mut tone = Tone::new(tone_hz, sample_rate, channels);
        let mut picture = Vec::new();
        let mut samples = Vec::new();
        let frame_period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        let started = Instant::now();
        let mut frames: u64 = 0;
        let mut audio_frames: u64 = 0;

        while !cancel.is_cancelled() {
            pattern.next_frame(&mut picture);
            let due_audio = (frames + 1) * sample_rate as u64 / fps.max(1) as u64;
            {
                let manager = manager.lock().unwrap_or_else(|p| p.into_inner());
                manager.push_video_frame(&picture, width, height);
                while audio_frames + AUDIO_CHUNK_FRAMES as u64 <= due_audio {
                    tone.fill(AUDIO_CHUNK_FRAMES, &mut samples);
                    manager.push_audio_samples(&samples);
                    audio_frames += AUDIO_CHUNK_FRAMES as u64;
                }
            }
            frames += 1;
            let next = frame_period.mul_f64(frames as f64);
            match next.checked_sub(started.elapsed()) {
                Some(wait) => thread::sleep(wait),
                // running late, keep the cadence anchored to real time
                None => thread::yield_now(),
            }
        }
        log::info!("synthetic capture stopped after {} frames", frames);
    })?;
    Ok(handle)
}
