use crate::config::StreamerConfig;
use crate::streamer::{EncoderControls, Streamer};

/// Owns every configured streamer and routes captured media to the active
/// ones. Higher layers only talk to this.
#[derive(Default)]
pub struct StreamManager {
    streamers: Vec<Box<dyn Streamer>>,
    initialized: bool,
    active: bool,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_streamer(&mut self, streamer: Box<dyn Streamer>) {
        log::info!("streamer added: {}", streamer.kind());
        self.streamers.push(streamer);
    }

    pub fn streamer_count(&self) -> usize {
        self.streamers.len()
    }

    /// Succeeds only if every streamer accepted the settings.
    pub fn initialize(&mut self, port: u16, width: u32, height: u32, fps: u32) -> bool {
        if self.initialized {
            log::warn!("stream manager already initialized");
            return true;
        }
        let mut all = true;
        for streamer in self.streamers.iter_mut() {
            if !streamer.initialize(port, width, height, fps) {
                log::error!("failed to initialize streamer: {}", streamer.kind());
                all = false;
            }
        }
        self.initialized = all;
        all
    }

    pub fn start(&mut self) -> bool {
        if !self.initialized {
            log::error!("stream manager not initialized");
            return false;
        }
        if self.active {
            return true;
        }
        let mut all = true;
        for streamer in self.streamers.iter_mut() {
            if !streamer.start() {
                log::error!("failed to start streamer: {}", streamer.kind());
                all = false;
            }
        }
        self.active = all;
        if all {
            log::info!("stream manager started, {} streamer(s)", self.streamers.len());
        }
        all
    }

    pub fn stop(&mut self) {
        // also stops streamers that started during a partially failed start
        for streamer in self.streamers.iter_mut() {
            streamer.stop();
        }
        if self.active {
            log::info!("stream manager stopped");
        }
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn push_video_frame(&self, data: &[u8], width: u32, height: u32) {
        if !self.active || data.is_empty() {
            return;
        }
        for streamer in self.streamers.iter().filter(|s| s.is_active()) {
            streamer.push_video_frame(data, width, height);
        }
    }

    pub fn push_audio_samples(&self, samples: &[i16]) {
        if !self.active || samples.is_empty() {
            return;
        }
        for streamer in self.streamers.iter().filter(|s| s.is_active()) {
            streamer.push_audio_samples(samples);
        }
    }

    pub fn stream_urls(&self) -> Vec<String> {
        self.streamers
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.stream_url())
            .collect()
    }

    pub fn total_client_count(&self) -> u32 {
        self.streamers.iter().map(|s| s.client_count()).sum()
    }

    /// Applies `apply` to every streamer that exposes encoder controls and
    /// returns how many did.
    pub fn configure_encoders(&mut self, mut apply: impl FnMut(&mut dyn EncoderControls)) -> usize {
        let mut configured = 0;
        for streamer in self.streamers.iter_mut() {
            if let Some(controls) = streamer.encoder_controls() {
                apply(controls);
                configured += 1;
            }
        }
        configured
    }

    /// Encoder settings of the first streamer that exposes them.
    pub fn encoder_settings(&mut self) -> Option<StreamerConfig> {
        self.streamers
            .iter_mut()
            .find_map(|s| s.encoder_controls().map(|c| c.settings()))
    }

    pub fn cleanup(&mut self) {
        self.stop();
        for streamer in self.streamers.iter_mut() {
            streamer.cleanup();
        }
        self.streamers.clear();
        self.initialized = false;
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}
