use ffmpeg_next::ChannelLayout;
use ffmpeg_next::format::Sample;
use ffmpeg_next::software::resampling::Context;

use crate::frame::AudioChunk;

/// Converts interleaved s16 capture audio into the encoder's sample format.
pub struct Resampler {
    context: Context,
    src_layout: ChannelLayout,
    rate: u32,
}

impl Resampler {
    pub fn new(
        channels: u32,
        rate: u32,
        dst_format: Sample,
        dst_layout: ChannelLayout,
    ) -> anyhow::Result<Self> {
        let src_layout = ChannelLayout::default(channels as i32);
        let context = Context::get(
            Sample::I16(ffmpeg_next::format::sample::Type::Packed),
            src_layout,
            rate,
            dst_format,
            dst_layout,
            rate,
        )?;
        Ok(Self {
            context,
            src_layout,
            rate,
        })
    }

    pub fn convert(&mut self, chunk: &AudioChunk) -> anyhow::Result<ffmpeg_next::frame::Audio> {
        let src = chunk.to_av_frame(self.src_layout, self.rate);
        let mut dst = ffmpeg_next::frame::Audio::empty();
        self.context.run(&src, &mut dst)?;
        dst.set_rate(self.rate);
        Ok(dst)
    }
}

unsafe impl Send for Resampler {}
