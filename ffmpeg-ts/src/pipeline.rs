use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::StreamerConfig;
use crate::encoder::{AudioEncoder, VideoEncoder};
use crate::frame::{AudioChunk, VideoFrame};
use crate::ingest::{DROP_LOG_INTERVAL, Ingest};
use crate::output::{ByteSink, TsMuxer};
use crate::resampler::Resampler;
use crate::scaler::VideoConverter;
use crate::timestamp::StreamKind;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Counters shared between the encoding thread and whoever watches it.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub video_frames: AtomicU64,
    pub audio_frames: AtomicU64,
    pub video_packets: AtomicU64,
    pub audio_packets: AtomicU64,
    pub errors: AtomicU64,
}

impl PipelineStats {
    pub fn packets(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Video => self.video_packets.load(Ordering::Relaxed),
            StreamKind::Audio => self.audio_packets.load(Ordering::Relaxed),
        }
    }

    fn count_packet(&self, kind: StreamKind) {
        let counter = match kind {
            StreamKind::Video => &self.video_packets,
            StreamKind::Audio => &self.audio_packets,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything the encoding thread owns. Fields drop in declaration order, so
/// the muxer goes before the converters and encoders it was built from.
pub struct EncoderState {
    muxer: TsMuxer,
    resampler: Resampler,
    audio: AudioEncoder,
    converter: VideoConverter,
    video: VideoEncoder,
    stats: Arc<PipelineStats>,
}

impl EncoderState {
    pub fn open(
        config: &StreamerConfig,
        sink: Box<dyn ByteSink>,
        stats: Arc<PipelineStats>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let video = VideoEncoder::open(config)?;
        let converter = VideoConverter::new(video.format(), video.width(), video.height());
        let audio = AudioEncoder::open(config)?;
        let resampler = Resampler::new(
            config.channels,
            config.sample_rate,
            audio.format(),
            audio.channel_layout(),
        )?;

        let mut muxer = TsMuxer::new(sink)?;
        muxer.add_stream(
            StreamKind::Video,
            video.parameters(),
            video.time_base(),
            video.frame_duration(),
        )?;
        muxer.add_stream(
            StreamKind::Audio,
            audio.parameters(),
            audio.time_base(),
            audio.frame_duration(),
        )?;
        muxer.write_header()?;
        log::info!(
            "mpegts pipeline ready: {:?} video, {:?} audio, {} samples per audio frame",
            video.codec(),
            audio.codec(),
            audio.samples_per_frame()
        );

        Ok(Self {
            muxer,
            resampler,
            audio,
            converter,
            video,
            stats,
        })
    }

    pub fn samples_per_frame(&self) -> usize {
        self.audio.samples_per_frame()
    }

    pub fn audio_frame_size(&self) -> usize {
        self.audio.frame_size()
    }

    pub fn encode_video(&mut self, frame: &VideoFrame) -> anyhow::Result<usize> {
        let mut yuv = self.converter.convert(frame)?;
        self.video.send_frame(&mut yuv)?;
        self.stats.video_frames.fetch_add(1, Ordering::Relaxed);
        self.drain(StreamKind::Video)
    }

    pub fn encode_audio(&mut self, chunk: &AudioChunk) -> anyhow::Result<usize> {
        let mut converted = self.resampler.convert(chunk)?;
        self.audio.send_frame(&mut converted)?;
        self.stats.audio_frames.fetch_add(1, Ordering::Relaxed);
        self.drain(StreamKind::Audio)
    }

    /// Muxes every packet the encoder has ready. A packet the muxer rejects is
    /// logged and skipped.
    fn drain(&mut self, kind: StreamKind) -> anyhow::Result<usize> {
        let mut written = 0;
        loop {
            let packet = match kind {
                StreamKind::Video => self.video.receive_packet()?,
                StreamKind::Audio => self.audio.receive_packet()?,
            };
            let Some(packet) = packet else {
                break;
            };
            match self.muxer.write_packet(packet) {
                Ok(_) => {
                    written += 1;
                    self.stats.count_packet(kind);
                }
                Err(e) => {
                    let errors = self.stats.errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors == 1 || errors % DROP_LOG_INTERVAL == 0 {
                        log::warn!("mux {} packet: {:#} ({} errors)", kind, e, errors);
                    }
                }
            }
        }
        Ok(written)
    }

    /// Flushes both encoders and writes the trailer.
    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.video.send_eof()?;
        self.drain(StreamKind::Video)?;
        self.audio.send_eof()?;
        self.drain(StreamKind::Audio)?;
        self.muxer.finish()
    }

    pub fn bytes_written(&self) -> u64 {
        self.muxer.bytes_written()
    }
}

/// The encoding thread body: takes the latest video frame and every whole
/// audio frame, encodes them and muxes the result into the sink.
pub struct EncodingLoop {
    state: EncoderState,
    ingest: Arc<Ingest>,
    cancel: CancellationToken,
    pacing: Duration,
}

impl EncodingLoop {
    pub fn new(
        state: EncoderState,
        ingest: Arc<Ingest>,
        cancel: CancellationToken,
        frame_duration: Duration,
    ) -> Self {
        Self {
            state,
            ingest,
            cancel,
            pacing: frame_duration / 4,
        }
    }

    pub fn run(mut self) {
        log::info!("encoding loop started");
        let samples_per_frame = self.state.samples_per_frame();
        let stats = Arc::clone(&self.state.stats);
        while !self.cancel.is_cancelled() {
            let mut worked = false;
            if let Some(frame) = self.ingest.video.take() {
                worked = true;
                if let Err(e) = self.state.encode_video(&frame) {
                    Self::log_error(&stats, "encode video", &e);
                }
            }
            while let Some(chunk) = self.ingest.audio.take_frame(samples_per_frame) {
                worked = true;
                if let Err(e) = self.state.encode_audio(&chunk) {
                    Self::log_error(&stats, "encode audio", &e);
                }
                if self.cancel.is_cancelled() {
                    break;
                }
            }
            std::thread::sleep(if worked { self.pacing } else { IDLE_SLEEP });
        }

        if let Err(e) = self.state.finish() {
            log::warn!("flush encoders: {:#}", e);
        }
        log::info!(
            "encoding loop finished, video frames: {}, audio frames: {}, bytes: {}",
            stats.video_frames.load(Ordering::Relaxed),
            stats.audio_frames.load(Ordering::Relaxed),
            self.state.bytes_written()
        );
    }

    fn log_error(stats: &PipelineStats, what: &str, e: &anyhow::Error) {
        let errors = stats.errors.fetch_add(1, Ordering::Relaxed) + 1;
        if errors == 1 || errors % DROP_LOG_INTERVAL == 0 {
            log::warn!("{}: {:#} ({} errors)", what, e, errors);
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
