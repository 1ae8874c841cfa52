use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context, flag::Flags};

use crate::frame::VideoFrame;

pub struct Scaler {
    context: Context,
    src_width: u32,
    src_height: u32,
}

impl Scaler {
    pub fn new(
        src_format: Pixel,
        src_width: u32,
        src_height: u32,
        dst_format: Pixel,
        dst_width: u32,
        dst_height: u32,
    ) -> anyhow::Result<Self> {
        let context = Context::get(
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
            Flags::FAST_BILINEAR,
        )?;
        Ok(Self {
            context,
            src_width,
            src_height,
        })
    }

    pub fn accepts(&self, width: u32, height: u32) -> bool {
        self.src_width == width && self.src_height == height
    }

    pub fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

/// RGB24 to encoder-format conversion, resizing to the stream size when the
/// pushed frame differs. Rebuilds its scaler whenever the input size changes.
pub struct VideoConverter {
    scaler: Option<Scaler>,
    format: Pixel,
    width: u32,
    height: u32,
}

impl VideoConverter {
    pub fn new(format: Pixel, width: u32, height: u32) -> Self {
        Self {
            scaler: None,
            format,
            width,
            height,
        }
    }

    pub fn convert(&mut self, frame: &VideoFrame) -> anyhow::Result<ffmpeg_next::frame::Video> {
        let scaler = match self.scaler.take() {
            Some(scaler) if scaler.accepts(frame.width(), frame.height()) => scaler,
            previous => {
                if previous.is_some() {
                    log::info!(
                        "input size changed to {}x{}, rebuilding converter",
                        frame.width(),
                        frame.height()
                    );
                }
                Scaler::new(
                    Pixel::RGB24,
                    frame.width(),
                    frame.height(),
                    self.format,
                    self.width,
                    self.height,
                )?
            }
        };
        let scaler = self.scaler.insert(scaler);

        let src = frame.to_av_frame();
        let mut dst = ffmpeg_next::frame::Video::new(self.format, self.width, self.height);
        scaler.run(&src, &mut dst)?;
        Ok(dst)
    }
}
