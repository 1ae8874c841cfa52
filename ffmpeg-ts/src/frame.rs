use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// Bytes per RGB24 pixel.
pub const RGB24_BYTES_PER_PIXEL: usize = 3;

/// One packed RGB24 picture, rows top to bottom with no padding.
#[derive(Clone)]
pub struct VideoFrame {
    data: Bytes,
    width: u32,
    height: u32,
}

impl VideoFrame {
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * RGB24_BYTES_PER_PIXEL
    }

    /// Copies `data` out of the caller's buffer. Extra trailing bytes are
    /// ignored.
    pub fn new(data: &[u8], width: u32, height: u32) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            anyhow::bail!("invalid video size {}x{}", width, height);
        }
        let expected = Self::expected_len(width, height);
        if data.len() < expected {
            anyhow::bail!(
                "short rgb24 buffer for {}x{}: {} < {}",
                width,
                height,
                data.len(),
                expected
            );
        }
        Ok(Self {
            data: Bytes::copy_from_slice(&data[..expected]),
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Copies the picture into an FFmpeg frame, honoring the frame's stride.
    pub fn to_av_frame(&self) -> ffmpeg_next::frame::Video {
        let mut frame = ffmpeg_next::frame::Video::new(
            ffmpeg_next::format::Pixel::RGB24,
            self.width,
            self.height,
        );
        let row = self.width as usize * RGB24_BYTES_PER_PIXEL;
        let stride = frame.stride(0);
        let dst = frame.data_mut(0);
        for (y, src) in self.data.chunks_exact(row).enumerate() {
            let offset = y * stride;
            dst[offset..offset + row].copy_from_slice(src);
        }
        frame
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "VideoFrame({}x{}, {} bytes)", self.width, self.height, self.data.len())
    }
}

/// Exactly one encoder frame worth of interleaved signed 16-bit PCM.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: Vec<i16>,
    channels: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>, channels: u32) -> Self {
        Self { samples, channels }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Builds a packed s16 FFmpeg frame from the chunk.
    pub fn to_av_frame(
        &self,
        layout: ffmpeg_next::ChannelLayout,
        rate: u32,
    ) -> ffmpeg_next::frame::Audio {
        let mut frame = ffmpeg_next::frame::Audio::new(
            ffmpeg_next::format::Sample::I16(ffmpeg_next::format::sample::Type::Packed),
            self.frames(),
            layout,
        );
        frame.set_rate(rate);
        let used = self.frames() * self.channels as usize;
        let dst = frame.data_mut(0);
        for (out, sample) in dst.chunks_exact_mut(2).zip(&self.samples[..used]) {
            out.copy_from_slice(&sample.to_ne_bytes());
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_frame_rejects_short_buffers() {
        assert!(VideoFrame::new(&[0u8; 11], 2, 2).is_err());
        assert!(VideoFrame::new(&[0u8; 12], 0, 2).is_err());
        let frame = VideoFrame::new(&[7u8; 20], 2, 2).unwrap();
        assert_eq!(frame.data().len(), 12);
        assert_eq!(frame.to_string(), "VideoFrame(2x2, 12 bytes)");
    }

    #[test]
    fn audio_chunk_counts_frames_per_channel() {
        let chunk = AudioChunk::new(vec![0; 2048], 2);
        assert_eq!(chunk.frames(), 1024);
        assert_eq!(chunk.channels(), 2);
    }
}
