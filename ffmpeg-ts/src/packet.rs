use ffmpeg_next::Rational;

use crate::timestamp::StreamKind;

/// A compressed packet fresh out of an encoder, still in the encoder's time
/// base.
pub struct EncodedPacket {
    packet: ffmpeg_next::codec::packet::Packet,
    kind: StreamKind,
    time_base: Rational,
}

impl EncodedPacket {
    pub fn new(
        packet: ffmpeg_next::codec::packet::Packet,
        kind: StreamKind,
        time_base: Rational,
    ) -> Self {
        Self {
            packet,
            kind,
            time_base,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.packet.set_duration(duration);
    }

    pub fn get_mut(&mut self) -> &mut ffmpeg_next::codec::packet::Packet {
        &mut self.packet
    }
}
