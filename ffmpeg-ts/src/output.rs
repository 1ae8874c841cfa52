use std::collections::HashMap;
use std::ffi::{CString, c_int, c_void};
use std::ptr;

use ffmpeg_next::{Rational, codec, ffi};

use crate::packet::EncodedPacket;
use crate::timestamp::{StreamKind, TimestampNormalizer, Timestamps, frame_increment};

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// AVIO buffer size. A whole number of TS packets, so every flush hands the
/// sink complete packets.
const AVIO_BUFFER_SIZE: usize = TS_PACKET_SIZE * 348;

/// Upper bound on how long the interleaver waits for a quiet stream, in
/// microseconds.
const MAX_INTERLEAVE_DELTA: i64 = 500_000;

/// Destination for muxed container bytes. Called on the encoding thread.
pub trait ByteSink: Send {
    fn write_bytes(&mut self, buf: &[u8]);
}

impl<F> ByteSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn write_bytes(&mut self, buf: &[u8]) {
        self(buf)
    }
}

struct SinkSlot {
    sink: Box<dyn ByteSink>,
    bytes: u64,
}

type WritePacketFn = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;

unsafe extern "C" fn write_to_sink(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return buf_size.max(0);
    }
    let slot = unsafe { &mut *(opaque as *mut SinkSlot) };
    let bytes = unsafe { std::slice::from_raw_parts(buf, buf_size as usize) };
    slot.sink.write_bytes(bytes);
    slot.bytes += bytes.len() as u64;
    buf_size
}

struct MuxStream {
    index: usize,
    codec_time_base: Rational,
    frame_duration: i64,
}

/// MPEG-TS muxer writing into a [`ByteSink`] instead of a file or URL.
pub struct TsMuxer {
    inner: ffmpeg_next::format::context::Output,
    sink: Box<SinkSlot>,
    streams: HashMap<StreamKind, MuxStream>,
    timestamps: TimestampNormalizer,
    have_written_header: bool,
    have_written_trailer: bool,
}

// The muxer and its sink live on the encoding thread only.
unsafe impl Send for TsMuxer {}

impl TsMuxer {
    pub fn new(sink: Box<dyn ByteSink>) -> anyhow::Result<Self> {
        let mut slot = Box::new(SinkSlot { sink, bytes: 0 });
        let format = CString::new("mpegts")?;
        let mut ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        unsafe {
            let ret = ffi::avformat_alloc_output_context2(
                &mut ctx,
                ptr::null_mut(),
                format.as_ptr(),
                ptr::null(),
            );
            if ret < 0 || ctx.is_null() {
                anyhow::bail!("allocate mpegts context: {}", ffmpeg_next::Error::from(ret));
            }

            let buffer = ffi::av_malloc(AVIO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                ffi::avformat_free_context(ctx);
                anyhow::bail!("allocate avio buffer");
            }
            let opaque = &mut *slot as *mut SinkSlot as *mut c_void;
            let pb = ffi::avio_alloc_context(
                buffer,
                AVIO_BUFFER_SIZE as c_int,
                1,
                opaque,
                None,
                // the buffer argument is const in newer FFmpeg headers only
                Some(std::mem::transmute::<WritePacketFn, _>(write_to_sink)),
                None,
            );
            if pb.is_null() {
                ffi::av_free(buffer as *mut c_void);
                ffi::avformat_free_context(ctx);
                anyhow::bail!("allocate avio context");
            }
            (*ctx).pb = pb;
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
            (*ctx).max_interleave_delta = MAX_INTERLEAVE_DELTA;

            Ok(Self {
                inner: ffmpeg_next::format::context::Output::wrap(ctx),
                sink: slot,
                streams: HashMap::new(),
                timestamps: TimestampNormalizer::default(),
                have_written_header: false,
                have_written_trailer: false,
            })
        }
    }

    /// Adds the elementary stream for `kind`. `frame_duration` is one encoder
    /// frame in `codec_time_base` and bounds how far a repaired DTS advances.
    pub fn add_stream(
        &mut self,
        kind: StreamKind,
        parameters: codec::Parameters,
        codec_time_base: Rational,
        frame_duration: i64,
    ) -> anyhow::Result<()> {
        if self.have_written_header {
            anyhow::bail!("cannot add {} stream after the header", kind);
        }
        let mut stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(parameters.id()))?;
        stream.set_parameters(parameters);
        stream.set_time_base(codec_time_base);
        self.streams.insert(
            kind,
            MuxStream {
                index: stream.index(),
                codec_time_base,
                frame_duration,
            },
        );
        Ok(())
    }

    pub fn write_header(&mut self) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.inner.write_header()?;
            self.have_written_header = true;
            self.flush();
        }
        Ok(())
    }

    /// Rescales `packet` into its container stream, repairs its timestamps and
    /// muxes it. Returns the timestamps that were written.
    pub fn write_packet(&mut self, mut packet: EncodedPacket) -> anyhow::Result<Timestamps> {
        self.write_header()?;
        let kind = packet.kind();
        let time_base = packet.time_base();
        let stream = match self.streams.get(&kind) {
            Some(stream) => stream,
            None => return Err(anyhow::anyhow!("{} stream not found", kind)),
        };
        let index = stream.index;
        let out_time_base = self
            .inner
            .stream(index)
            .ok_or(anyhow::anyhow!("{} stream missing from context", kind))?
            .time_base();
        let min_increment = frame_increment(stream.frame_duration, stream.codec_time_base, out_time_base);

        let p = packet.get_mut();
        p.set_stream(index);
        p.set_position(-1);
        p.rescale_ts(time_base, out_time_base);
        let timestamps = self
            .timestamps
            .normalize(kind, p.pts(), p.dts(), min_increment)
            .ok_or(anyhow::anyhow!("{} packet has no timestamps", kind))?;
        p.set_pts(Some(timestamps.pts));
        p.set_dts(Some(timestamps.dts));
        p.write_interleaved(&mut self.inner)?;
        self.flush();
        Ok(timestamps)
    }

    pub fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
            self.flush();
        }
        Ok(())
    }

    /// Container bytes handed to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.sink.bytes
    }

    fn flush(&mut self) {
        unsafe {
            let pb = (*self.inner.as_mut_ptr()).pb;
            if !pb.is_null() {
                ffi::avio_flush(pb);
            }
        }
    }
}

impl Drop for TsMuxer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::warn!("write mpegts trailer: {:#}", e);
        }
        unsafe {
            let ctx = self.inner.as_mut_ptr();
            let mut pb = (*ctx).pb;
            (*ctx).pb = ptr::null_mut();
            if !pb.is_null() {
                ffi::av_freep(&mut (*pb).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut pb);
            }
        }
    }
}
