use ffmpeg_next::codec::{self, Id};
use ffmpeg_next::format::{Pixel, Sample, sample};
use ffmpeg_next::{ChannelLayout, Dictionary, Rational, Rescale};

use crate::config::StreamerConfig;
use crate::packet::EncodedPacket;
use crate::timestamp::StreamKind;

/// Frame size used when an audio encoder accepts any frame length.
pub const FALLBACK_AUDIO_FRAME_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Mpeg2,
}

impl VideoCodec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "h264" | "libx264" => Some(Self::H264),
            "h265" | "hevc" | "libx265" => Some(Self::Hevc),
            "mpeg2video" => Some(Self::Mpeg2),
            _ => None,
        }
    }

    /// Unknown names fall back to the default codec.
    pub fn resolve(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            log::warn!("unknown video codec {:?}, using {:?}", name, Self::default());
            Self::default()
        })
    }

    fn encoder_name(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::Hevc => "libx265",
            Self::Mpeg2 => "mpeg2video",
        }
    }

    fn id(self) -> Id {
        match self {
            Self::H264 => Id::H264,
            Self::Hevc => Id::HEVC,
            Self::Mpeg2 => Id::MPEG2VIDEO,
        }
    }

    fn find(self) -> Option<ffmpeg_next::Codec> {
        ffmpeg_next::encoder::find_by_name(self.encoder_name())
            .or_else(|| ffmpeg_next::encoder::find(self.id()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioCodec {
    #[default]
    Aac,
    Mp2,
    Ac3,
}

impl AudioCodec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aac" | "libfdk_aac" => Some(Self::Aac),
            "mp2" => Some(Self::Mp2),
            "ac3" => Some(Self::Ac3),
            _ => None,
        }
    }

    pub fn resolve(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            log::warn!("unknown audio codec {:?}, using {:?}", name, Self::default());
            Self::default()
        })
    }

    fn encoder_name(self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Mp2 => "mp2",
            Self::Ac3 => "ac3",
        }
    }

    fn id(self) -> Id {
        match self {
            Self::Aac => Id::AAC,
            Self::Mp2 => Id::MP2,
            Self::Ac3 => Id::AC3,
        }
    }

    fn find(self) -> Option<ffmpeg_next::Codec> {
        ffmpeg_next::encoder::find_by_name(self.encoder_name())
            .or_else(|| ffmpeg_next::encoder::find(self.id()))
    }
}

/// Pulls one packet, mapping "needs more input" and "drained" to `None`.
fn receive_packet(
    encoder: &mut codec::encoder::Encoder,
    kind: StreamKind,
    time_base: Rational,
) -> anyhow::Result<Option<EncodedPacket>> {
    let mut packet = ffmpeg_next::codec::packet::Packet::empty();
    match encoder.receive_packet(&mut packet) {
        Ok(()) => Ok(Some(EncodedPacket::new(packet, kind, time_base))),
        Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
            Ok(None)
        }
        Err(ffmpeg_next::Error::Eof) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub struct VideoEncoder {
    inner: codec::encoder::Video,
    codec: VideoCodec,
    time_base: Rational,
    frame_rate: Rational,
    frames: i64,
}

impl VideoEncoder {
    /// Opens the configured codec, falling back to H.264 if it is missing or
    /// refuses the settings.
    pub fn open(config: &StreamerConfig) -> anyhow::Result<Self> {
        let requested = VideoCodec::resolve(&config.video_codec);
        match Self::open_codec(requested, config) {
            Ok(encoder) => Ok(encoder),
            Err(e) if requested != VideoCodec::default() => {
                log::warn!(
                    "video encoder {:?} failed: {:#}, falling back to {:?}",
                    requested,
                    e,
                    VideoCodec::default()
                );
                Self::open_codec(VideoCodec::default(), config)
            }
            Err(e) => Err(e),
        }
    }

    fn open_codec(kind: VideoCodec, config: &StreamerConfig) -> anyhow::Result<Self> {
        let codec = kind
            .find()
            .ok_or(anyhow::anyhow!("video encoder not found: {:?}", kind))?;
        let frame_rate = Rational::new(config.fps as i32, 1);

        let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(frame_rate));
        encoder.set_time_base(frame_rate.invert());
        encoder.set_bit_rate(config.video_bitrate as usize);
        encoder.set_max_b_frames(0);
        encoder.set_gop(config.keyframe_interval());

        let mut opts = Dictionary::new();
        match kind {
            VideoCodec::H264 => {
                opts.set("preset", &config.video_preset);
                opts.set("tune", "zerolatency");
                opts.set("profile", "baseline");
            }
            VideoCodec::Hevc => {
                opts.set("preset", &config.video_preset);
                opts.set("tune", "zerolatency");
            }
            VideoCodec::Mpeg2 => {}
        }
        let encoder = encoder.open_with(opts)?;
        let time_base: Rational = unsafe { (*encoder.0.as_ptr()).time_base.into() };
        log::info!(
            "video encoder opened: {} {}x{}@{} {}bps gop {}",
            codec.name(),
            config.width,
            config.height,
            config.fps,
            config.video_bitrate,
            config.keyframe_interval()
        );

        Ok(Self {
            inner: encoder,
            codec: kind,
            time_base,
            frame_rate,
            frames: 0,
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn format(&self) -> Pixel {
        self.inner.format()
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// One frame in the encoder time base.
    pub fn frame_duration(&self) -> i64 {
        1i64.rescale(self.frame_rate.invert(), self.time_base).max(1)
    }

    pub fn parameters(&self) -> codec::Parameters {
        codec::Parameters::from(&self.inner)
    }

    /// Stamps `frame` with the next presentation time and submits it. The
    /// counter only advances when the encoder accepts the frame.
    pub fn send_frame(&mut self, frame: &mut ffmpeg_next::frame::Video) -> anyhow::Result<()> {
        let pts = self.frames.rescale(self.frame_rate.invert(), self.time_base);
        frame.set_pts(Some(pts));
        self.inner.send_frame(frame)?;
        self.frames += 1;
        Ok(())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        Ok(())
    }

    pub fn receive_packet(&mut self) -> anyhow::Result<Option<EncodedPacket>> {
        let duration = self.frame_duration();
        let mut packet = receive_packet(&mut self.inner, StreamKind::Video, self.time_base)?;
        if let Some(p) = packet.as_mut() {
            p.set_duration(duration);
        }
        Ok(packet)
    }
}

pub struct AudioEncoder {
    inner: codec::encoder::Audio,
    codec: AudioCodec,
    time_base: Rational,
    frame_size: usize,
    channels: u32,
    frames: i64,
}

impl AudioEncoder {
    /// Opens the configured codec at the capture rate, falling back to AAC if
    /// the codec is missing or cannot take that rate.
    pub fn open(config: &StreamerConfig) -> anyhow::Result<Self> {
        let requested = AudioCodec::resolve(&config.audio_codec);
        match Self::open_codec(requested, config) {
            Ok(encoder) => Ok(encoder),
            Err(e) if requested != AudioCodec::default() => {
                log::warn!(
                    "audio encoder {:?} failed: {:#}, falling back to {:?}",
                    requested,
                    e,
                    AudioCodec::default()
                );
                Self::open_codec(AudioCodec::default(), config)
            }
            Err(e) => Err(e),
        }
    }

    fn open_codec(kind: AudioCodec, config: &StreamerConfig) -> anyhow::Result<Self> {
        let codec = kind
            .find()
            .ok_or(anyhow::anyhow!("audio encoder not found: {:?}", kind))?;
        let caps = codec.audio()?;
        if let Some(mut rates) = caps.rates() {
            if !rates.any(|r| r == config.sample_rate as i32) {
                anyhow::bail!("{} does not support {} Hz", codec.name(), config.sample_rate);
            }
        }
        let planar_float = Sample::F32(sample::Type::Planar);
        let format = match caps.formats() {
            Some(formats) => {
                let formats: Vec<Sample> = formats.collect();
                if formats.contains(&planar_float) {
                    planar_float
                } else {
                    formats
                        .first()
                        .copied()
                        .ok_or(anyhow::anyhow!("{} lists no sample formats", codec.name()))?
                }
            }
            None => planar_float,
        };
        let layout = ChannelLayout::default(config.channels as i32);
        let time_base = Rational::new(1, config.sample_rate as i32);

        let mut encoder = codec::Context::new_with_codec(codec).encoder().audio()?;
        encoder.set_rate(config.sample_rate as i32);
        encoder.set_channel_layout(layout);
        encoder.set_format(format);
        encoder.set_bit_rate(config.audio_bitrate as usize);
        encoder.set_time_base(time_base);
        let encoder = encoder.open_as(codec)?;

        let frame_size = match encoder.frame_size() as usize {
            0 => FALLBACK_AUDIO_FRAME_SIZE,
            n => n,
        };
        log::info!(
            "audio encoder opened: {} {}Hz {}ch {}bps frame size {}",
            codec.name(),
            config.sample_rate,
            config.channels,
            config.audio_bitrate,
            frame_size
        );

        Ok(Self {
            inner: encoder,
            codec: kind,
            time_base,
            frame_size,
            channels: config.channels,
            frames: 0,
        })
    }

    pub fn codec(&self) -> AudioCodec {
        self.codec
    }

    pub fn format(&self) -> Sample {
        self.inner.format()
    }

    pub fn channel_layout(&self) -> ChannelLayout {
        self.inner.channel_layout()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Samples per channel in one encoder frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Interleaved samples the accumulator must release per frame.
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn frame_duration(&self) -> i64 {
        self.frame_size as i64
    }

    pub fn parameters(&self) -> codec::Parameters {
        codec::Parameters::from(&self.inner)
    }

    pub fn send_frame(&mut self, frame: &mut ffmpeg_next::frame::Audio) -> anyhow::Result<()> {
        frame.set_pts(Some(self.frames * self.frame_size as i64));
        self.inner.send_frame(frame)?;
        self.frames += 1;
        Ok(())
    }

    pub fn send_eof(&mut self) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        Ok(())
    }

    pub fn receive_packet(&mut self) -> anyhow::Result<Option<EncodedPacket>> {
        receive_packet(&mut self.inner, StreamKind::Audio, self.time_base)
    }
}
