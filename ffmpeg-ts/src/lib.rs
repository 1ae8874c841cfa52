/// Registers FFmpeg components and quiets FFmpeg's own logger down to
/// warnings. Call once at startup before opening any encoder.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Warning);
    Ok(())
}

pub mod config;
pub mod encoder;
pub mod frame;
pub mod ingest;
pub mod manager;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod registry;
pub mod resampler;
pub mod scaler;
pub mod server;
pub mod streamer;
pub mod timestamp;

pub use config::{BackpressurePolicy, StreamerConfig};
pub use manager::StreamManager;
pub use streamer::{EncoderControls, Streamer, TsStreamer};
