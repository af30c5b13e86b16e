// crates/mixcast-core/src/packet.rs
//
// Encoded packets as they travel encoder → interleaver → output backend.
//
// Within one run, pts/dts are monotone non-decreasing per type and
// timebase_den never changes. dts_usec is the interleaving key — derived
// once from (dts, timebase) when the packet enters the output, then
// adjusted in place when the stream-start offsets are applied.

use std::sync::Arc;

use crate::clock::{packet_dts_usec, packet_ms_time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Audio,
    Video,
}

/// H.264 NAL reference priorities, reused as drop priorities by the RTMP
/// congestion logic. Audio always survives a drop pass.
pub mod nal_priority {
    pub const DISPOSABLE: i32 = 0;
    pub const LOW: i32 = 1;
    pub const HIGH: i32 = 2;
    pub const HIGHEST: i32 = 3;
}

#[derive(Clone)]
pub struct EncoderPacket {
    pub data: Arc<Vec<u8>>,
    pub pts: i64,
    pub dts: i64,
    pub timebase_num: u32,
    pub timebase_den: u32,
    pub ptype: PacketType,
    pub keyframe: bool,
    /// NAL reference priority of the slice (video only).
    pub priority: i32,
    /// Priority consulted by congestion dropping.
    pub drop_priority: i32,
    /// Audio mix the packet belongs to.
    pub track_idx: usize,
    /// dts rescaled to microseconds — the interleaving key.
    pub dts_usec: i64,
    /// Wall-clock µs at which the encoder emitted the packet; gates
    /// graceful shutdown.
    pub sys_dts_usec: i64,
    /// True on the first packet the encoder produced after a (re)start.
    pub encoder_first_packet: bool,
}

impl EncoderPacket {
    pub fn new(ptype: PacketType, data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            pts: 0,
            dts: 0,
            timebase_num: 1,
            timebase_den: 1,
            ptype,
            keyframe: false,
            priority: 0,
            drop_priority: 0,
            track_idx: 0,
            dts_usec: 0,
            sys_dts_usec: 0,
            encoder_first_packet: false,
        }
    }

    /// Recompute `dts_usec` from the current dts and timebase.
    pub fn refresh_dts_usec(&mut self) {
        self.dts_usec = packet_dts_usec(self.dts, self.timebase_num, self.timebase_den);
    }

    /// `val` ticks of this packet's timebase, in milliseconds. FLV tag
    /// timestamps and composition offsets use this.
    pub fn ms_time(&self, val: i64) -> i64 {
        packet_ms_time(val, self.timebase_num, self.timebase_den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_packet(dts: i64, den: u32) -> EncoderPacket {
        let mut p = EncoderPacket::new(PacketType::Video, vec![0]);
        p.dts = dts;
        p.pts = dts;
        p.timebase_den = den;
        p.refresh_dts_usec();
        p
    }

    #[test]
    fn dts_usec_follows_timebase() {
        assert_eq!(video_packet(30, 30).dts_usec, 1_000_000);
        assert_eq!(video_packet(3, 30).dts_usec, 100_000);
    }

    #[test]
    fn ms_time_matches_flv_expectations() {
        let p = video_packet(90_000, 90_000);
        assert_eq!(p.ms_time(p.dts), 1_000);
    }
}
