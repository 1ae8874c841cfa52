use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tokio_util::sync::CancellationToken;

use crate::config::StreamerConfig;
use crate::frame::VideoFrame;
use crate::ingest::Ingest;
use crate::output::ByteSink;
use crate::pipeline::{EncoderState, EncodingLoop, PipelineStats};
use crate::registry::{ClientRegistry, FanOut};
use crate::server::{ConnectionManager, ListenerHandle};

/// A live output the orchestrator can drive. Implementations are started and
/// stopped from a control thread and fed from capture threads.
pub trait Streamer: Send {
    /// Short name for logs, e.g. `"mpegts"`.
    fn kind(&self) -> &'static str;

    /// Records the stream geometry. Does not allocate encoders or sockets.
    fn initialize(&mut self, port: u16, width: u32, height: u32, fps: u32) -> bool;

    fn start(&mut self) -> bool;

    /// Idempotent. Returns once every worker has exited.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Never blocks on the encoder. Returns `false` if inactive or the buffer
    /// is not a valid RGB24 picture.
    fn push_video_frame(&self, data: &[u8], width: u32, height: u32) -> bool;

    /// Interleaved signed 16-bit samples at the configured rate and layout.
    /// Returns `false` if inactive or the length is not a whole number of
    /// sample frames.
    fn push_audio_samples(&self, samples: &[i16]) -> bool;

    fn stream_url(&self) -> String;

    fn client_count(&self) -> u32;

    /// Stops and forgets the configuration passed to `initialize`.
    fn cleanup(&mut self);

    fn encoder_controls(&mut self) -> Option<&mut dyn EncoderControls> {
        None
    }
}

/// Encoder settings that can be changed between runs. Changes apply on the
/// next `start`.
pub trait EncoderControls {
    /// Settings the next `start` will use.
    fn settings(&self) -> StreamerConfig;
    fn set_video_bitrate(&mut self, bps: u64);
    fn set_audio_bitrate(&mut self, bps: u64);
    fn set_audio_format(&mut self, sample_rate: u32, channels: u32);
    fn set_video_codec(&mut self, name: &str);
    fn set_audio_codec(&mut self, name: &str);
    fn set_video_preset(&mut self, preset: &str);
    fn set_keyframe_interval(&mut self, frames: u32);
}

struct Running {
    /// Stops the accept loop and the client handlers.
    cancel: CancellationToken,
    /// Stops the encoding loop, which then flushes into the still-open clients.
    finish: CancellationToken,
    listener: ListenerHandle,
    encoder: JoinHandle<()>,
}

/// Streams MPEG-TS over plain HTTP to any number of clients.
pub struct TsStreamer {
    config: StreamerConfig,
    initialized: bool,
    active: Arc<AtomicBool>,
    ingest: Arc<Ingest>,
    registry: Arc<ClientRegistry>,
    stats: Arc<PipelineStats>,
    running: Option<Running>,
}

impl Default for TsStreamer {
    fn default() -> Self {
        Self::new(StreamerConfig::default())
    }
}

impl TsStreamer {
    /// The configuration's geometry is replaced by `initialize`.
    pub fn new(config: StreamerConfig) -> Self {
        let ingest = Ingest::new(config.channels, config.backpressure.eviction_fraction);
        Self {
            config,
            initialized: false,
            active: Arc::new(AtomicBool::new(false)),
            ingest: Arc::new(ingest),
            registry: Arc::new(ClientRegistry::new()),
            stats: Arc::new(PipelineStats::default()),
            running: None,
        }
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Bound listener address while active.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.listener.local_addr())
    }

    fn launch(&mut self) -> anyhow::Result<Running> {
        self.config.validate()?;
        let cancel = CancellationToken::new();
        let finish = CancellationToken::new();
        let sink: Box<dyn ByteSink> = Box::new(FanOut::new(self.registry.clone()));
        let state = EncoderState::open(&self.config, sink, self.stats.clone())?;
        // a failed bind drops the encoders before any thread exists
        let manager = ConnectionManager::bind(
            self.config.port,
            &self.config.stream_path,
            self.registry.clone(),
            cancel.clone(),
        )?;

        let capacity = self.config.backpressure.audio_buffer_samples(
            self.config.sample_rate,
            state.audio_frame_size(),
            self.config.channels,
        );
        self.ingest.video.clear();
        self.ingest.audio.reconfigure(
            capacity,
            self.config.channels,
            self.config.backpressure.eviction_fraction,
        );

        let listener = manager.spawn()?;
        let encoding = EncodingLoop::new(
            state,
            self.ingest.clone(),
            finish.clone(),
            self.config.frame_duration(),
        );
        let encoder = match thread::Builder::new()
            .name("ts-encoder".into())
            .spawn(move || encoding.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                listener.shutdown();
                self.registry.close_all();
                listener.join();
                return Err(anyhow::anyhow!("spawn encoding thread: {}", e));
            }
        };

        Ok(Running {
            cancel,
            finish,
            listener,
            encoder,
        })
    }
}

impl Streamer for TsStreamer {
    fn kind(&self) -> &'static str {
        "mpegts"
    }

    fn initialize(&mut self, port: u16, width: u32, height: u32, fps: u32) -> bool {
        if self.is_active() {
            log::warn!("cannot initialize an active streamer");
            return false;
        }
        self.config.port = port;
        self.config.width = width;
        self.config.height = height;
        self.config.fps = fps;
        if let Err(e) = self.config.validate() {
            log::error!("invalid streamer settings: {:#}", e);
            return false;
        }
        self.initialized = true;
        true
    }

    fn start(&mut self) -> bool {
        if self.running.is_some() {
            return true;
        }
        if !self.initialized {
            log::error!("start called before initialize");
            return false;
        }
        match self.launch() {
            Ok(running) => {
                self.running = Some(running);
                self.active.store(true, Ordering::SeqCst);
                log::info!("streaming at {}", self.stream_url());
                true
            }
            Err(e) => {
                log::error!("failed to start mpegts streamer: {:#}", e);
                false
            }
        }
    }

    fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        self.active.store(false, Ordering::SeqCst);
        // drain and trailer go out before any client is closed
        running.finish.cancel();
        if running.encoder.join().is_err() {
            log::error!("encoding thread panicked");
        }
        running.cancel.cancel();
        running.listener.shutdown();
        self.registry.close_all();
        running.listener.join();
        self.ingest.clear();
        log::info!("mpegts streamer stopped");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn push_video_frame(&self, data: &[u8], width: u32, height: u32) -> bool {
        if !self.is_active() {
            return false;
        }
        match VideoFrame::new(data, width, height) {
            Ok(frame) => {
                self.ingest.video.offer(frame);
                true
            }
            Err(e) => {
                log::debug!("rejected video frame: {:#}", e);
                false
            }
        }
    }

    fn push_audio_samples(&self, samples: &[i16]) -> bool {
        if !self.is_active() || samples.is_empty() {
            return false;
        }
        if self.ingest.audio.push(samples).is_none() {
            log::debug!("rejected {} samples, not whole sample frames", samples.len());
            return false;
        }
        true
    }

    fn stream_url(&self) -> String {
        let port = self
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        self.config.stream_url(port)
    }

    fn client_count(&self) -> u32 {
        self.registry.count()
    }

    fn cleanup(&mut self) {
        self.stop();
        self.initialized = false;
    }

    fn encoder_controls(&mut self) -> Option<&mut dyn EncoderControls> {
        Some(self)
    }
}

impl EncoderControls for TsStreamer {
    fn settings(&self) -> StreamerConfig {
        self.config.clone()
    }

    fn set_video_bitrate(&mut self, bps: u64) {
        self.config.video_bitrate = bps;
    }

    fn set_audio_bitrate(&mut self, bps: u64) {
        self.config.audio_bitrate = bps;
    }

    fn set_audio_format(&mut self, sample_rate: u32, channels: u32) {
        self.config.sample_rate = sample_rate;
        self.config.channels = channels;
    }

    fn set_video_codec(&mut self, name: &str) {
        self.config.video_codec = name.to_string();
    }

    fn set_audio_codec(&mut self, name: &str) {
        self.config.audio_codec = name.to_string();
    }

    fn set_video_preset(&mut self, preset: &str) {
        self.config.video_preset = preset.to_string();
    }

    fn set_keyframe_interval(&mut self, frames: u32) {
        self.config.keyframe_interval = Some(frames);
    }
}

impl Drop for TsStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
#[path = "streamer_test.rs"]
mod streamer_test;
