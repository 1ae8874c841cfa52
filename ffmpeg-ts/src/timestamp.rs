use std::fmt::{Display, Formatter};

use ffmpeg_next::{Rational, Rescale};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => f.write_str("video"),
            StreamKind::Audio => f.write_str("audio"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub pts: i64,
    pub dts: i64,
}

/// Keeps one stream's DTS strictly increasing and never ahead of its PTS.
#[derive(Debug, Default)]
pub struct DtsTracker {
    last_dts: Option<i64>,
}

impl DtsTracker {
    /// Returns `None` for a packet carrying neither timestamp; such a packet
    /// cannot be placed and is dropped by the caller.
    pub fn normalize(
        &mut self,
        pts: Option<i64>,
        dts: Option<i64>,
        min_increment: i64,
    ) -> Option<Timestamps> {
        let mut pts = pts.or(dts)?;
        let mut dts = dts.unwrap_or(pts);
        // a negative pts (encoder priming) is kept; the muxer shifts it
        if dts > pts || dts < 0 {
            dts = pts;
        }
        if let Some(last) = self.last_dts {
            if dts <= last {
                dts = last + min_increment.max(1);
            }
        }
        if dts > pts {
            pts = dts;
        }
        self.last_dts = Some(dts);
        Some(Timestamps { pts, dts })
    }

    pub fn last_dts(&self) -> Option<i64> {
        self.last_dts
    }
}

#[derive(Debug, Default)]
pub struct TimestampNormalizer {
    video: DtsTracker,
    audio: DtsTracker,
}

impl TimestampNormalizer {
    pub fn tracker(&mut self, kind: StreamKind) -> &mut DtsTracker {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    pub fn normalize(
        &mut self,
        kind: StreamKind,
        pts: Option<i64>,
        dts: Option<i64>,
        min_increment: i64,
    ) -> Option<Timestamps> {
        self.tracker(kind).normalize(pts, dts, min_increment)
    }
}

/// One encoder frame (`frame_duration` in `codec_time_base`) expressed in the
/// container's time base, never less than one tick.
pub fn frame_increment(frame_duration: i64, codec_time_base: Rational, stream_time_base: Rational) -> i64 {
    frame_duration.rescale(codec_time_base, stream_time_base).max(1)
}
