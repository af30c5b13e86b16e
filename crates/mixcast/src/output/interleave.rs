// crates/mixcast/src/output/interleave.rs
//
// Merges the paired encoders' packet streams into one stream that is
// monotone by dts_usec and starts on a joint audio/video boundary.
//
// Rules, in arrival order:
//   1. Before the stream starts, a non-keyframe video packet is dropped
//      and takes any older buffered audio with it.
//   2. Buffered packets sort by dts_usec; at equal dts_usec video sorts
//      before audio (only enforced pre-start — readers may not resort).
//   3. The stream starts once a keyframe and audio at-or-after it are
//      both buffered. Audio strictly older than the first video is
//      discarded; offsets are captured from the first packet of each type
//      so the stream begins at timestamp zero, and every buffered packet
//      is re-stamped and re-sorted.
//   4. After start, the head packet is emitted only while a packet of the
//      opposing type with strictly higher dts_usec exists — monotone
//      interleaving with no lookahead blocking.

use mixcast_core::frame::MAX_AUDIO_MIXES;
use mixcast_core::packet::{EncoderPacket, PacketType};

pub struct Interleaver {
    packets: Vec<EncoderPacket>,
    received_video: bool,
    received_audio: bool,
    started: bool,
    video_offset: i64,
    audio_offsets: [i64; MAX_AUDIO_MIXES],
    highest_video_ts: i64,
    highest_audio_ts: i64,
}

impl Default for Interleaver {
    fn default() -> Self {
        Self::new()
    }
}

impl Interleaver {
    pub fn new() -> Self {
        Self {
            packets: Vec::new(),
            received_video: false,
            received_audio: false,
            started: false,
            video_offset: 0,
            audio_offsets: [0; MAX_AUDIO_MIXES],
            highest_video_ts: 0,
            highest_audio_ts: 0,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Feed one encoder packet; returns the packets released for sending,
    /// already offset-normalized and in emission order.
    pub fn submit(&mut self, mut packet: EncoderPacket) -> Vec<EncoderPacket> {
        let was_started = self.started;

        if !was_started && packet.ptype == PacketType::Video && !packet.keyframe {
            // stream must open on a keyframe; stale audio before this
            // point will never be emitted either
            let cutoff = packet.dts_usec;
            self.discard_front_older_than(cutoff);
            return Vec::new();
        }

        if was_started {
            self.apply_offset(&mut packet);
        } else {
            match packet.ptype {
                PacketType::Video => self.received_video = true,
                PacketType::Audio => self.received_audio = true,
            }
        }

        self.set_higher_ts(&packet);
        self.insert_sorted(packet);

        let mut out = Vec::new();
        if self.received_video && self.received_audio {
            if !was_started {
                if self.prune_premature() && self.initialize_offsets() {
                    self.resort();
                    self.started = true;
                    self.drain_sendable(&mut out);
                }
            } else {
                self.drain_sendable(&mut out);
            }
        }
        out
    }

    /// Packets still buffered (diagnostics / tests).
    pub fn pending(&self) -> usize {
        self.packets.len()
    }

    fn discard_front_older_than(&mut self, dts_usec: i64) {
        let keep_from = self
            .packets
            .iter()
            .position(|p| p.dts_usec >= dts_usec)
            .unwrap_or(self.packets.len());
        self.packets.drain(..keep_from);
    }

    fn apply_offset(&self, packet: &mut EncoderPacket) {
        let offset = match packet.ptype {
            PacketType::Video => self.video_offset,
            PacketType::Audio => self.audio_offsets[packet.track_idx % MAX_AUDIO_MIXES],
        };
        packet.dts -= offset;
        packet.pts -= offset;
        packet.refresh_dts_usec();
    }

    fn set_higher_ts(&mut self, packet: &EncoderPacket) {
        match packet.ptype {
            PacketType::Video => {
                self.highest_video_ts = self.highest_video_ts.max(packet.dts_usec)
            }
            PacketType::Audio => {
                self.highest_audio_ts = self.highest_audio_ts.max(packet.dts_usec)
            }
        }
    }

    fn insert_sorted(&mut self, packet: EncoderPacket) {
        let idx = self
            .packets
            .iter()
            .position(|cur| {
                packet.dts_usec < cur.dts_usec
                    || (packet.dts_usec == cur.dts_usec && packet.ptype == PacketType::Video)
            })
            .unwrap_or(self.packets.len());
        self.packets.insert(idx, packet);
    }

    fn first_of(&self, ptype: PacketType) -> Option<&EncoderPacket> {
        self.packets.iter().find(|p| p.ptype == ptype)
    }

    /// Drop audio strictly older than the first video; report whether a
    /// joint start is possible yet.
    fn prune_premature(&mut self) -> bool {
        let video_dts = match self.first_of(PacketType::Video) {
            Some(v) => v.dts_usec,
            None => {
                self.received_video = false;
                return false;
            }
        };
        self.packets
            .retain(|p| p.ptype == PacketType::Video || p.dts_usec >= video_dts);
        if self.first_of(PacketType::Audio).is_none() {
            self.received_audio = false;
            return false;
        }
        true
    }

    /// Capture stream-start offsets and re-stamp every buffered packet.
    fn initialize_offsets(&mut self) -> bool {
        let (video_pts, video_dts_usec) = match self.first_of(PacketType::Video) {
            Some(v) => (v.pts, v.dts_usec),
            None => return false,
        };
        let (audio_dts, audio_dts_usec) = match self.first_of(PacketType::Audio) {
            Some(a) => (a.dts, a.dts_usec),
            None => return false,
        };

        self.video_offset = video_pts;
        self.audio_offsets[0] = audio_dts;
        self.highest_video_ts -= video_dts_usec;
        self.highest_audio_ts -= audio_dts_usec;

        let mut packets = std::mem::take(&mut self.packets);
        for p in &mut packets {
            self.apply_offset(p);
        }
        self.packets = packets;
        true
    }

    fn resort(&mut self) {
        let old = std::mem::take(&mut self.packets);
        for p in old {
            self.insert_sorted(p);
        }
    }

    fn head_sendable(&self) -> bool {
        match self.packets.first() {
            Some(head) => match head.ptype {
                PacketType::Video => self.highest_audio_ts > head.dts_usec,
                PacketType::Audio => self.highest_video_ts > head.dts_usec,
            },
            None => false,
        }
    }

    fn drain_sendable(&mut self, out: &mut Vec<EncoderPacket>) {
        while self.head_sendable() {
            out.push(self.packets.remove(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// dts in milliseconds on a 1/1000 timebase.
    fn pkt(ptype: PacketType, dts_ms: i64, keyframe: bool) -> EncoderPacket {
        let mut p = EncoderPacket::new(ptype, vec![1]);
        p.pts = dts_ms;
        p.dts = dts_ms;
        p.timebase_num = 1;
        p.timebase_den = 1000;
        p.keyframe = keyframe;
        p.refresh_dts_usec();
        p
    }

    fn video(dts_ms: i64, kf: bool) -> EncoderPacket {
        pkt(PacketType::Video, dts_ms, kf)
    }

    fn audio(dts_ms: i64) -> EncoderPacket {
        pkt(PacketType::Audio, dts_ms, false)
    }

    #[test]
    fn cold_start_drops_audio_before_first_video() {
        // V_kf@100, A@95, A@105, A@115, V@133 — then A@140 to release the
        // held video. Audio before the keyframe never comes out.
        let mut il = Interleaver::new();
        let mut emitted = Vec::new();
        for p in [video(100, true), audio(95), audio(105), audio(115), video(133, false)] {
            emitted.extend(il.submit(p));
        }
        let order: Vec<_> = emitted.iter().map(|p| (p.ptype, p.dts_usec)).collect();
        assert_eq!(
            order,
            vec![
                (PacketType::Video, 0),
                (PacketType::Audio, 0),
                (PacketType::Audio, 10_000),
            ]
        );

        emitted.extend(il.submit(audio(140)));
        let order: Vec<_> = emitted.iter().map(|p| (p.ptype, p.dts_usec)).collect();
        assert_eq!(
            order,
            vec![
                (PacketType::Video, 0),     // V@100
                (PacketType::Audio, 0),     // A@105
                (PacketType::Audio, 10_000), // A@115
                (PacketType::Video, 33_000), // V@133
            ]
        );
    }

    #[test]
    fn emitted_dts_is_monotone_nondecreasing() {
        let mut il = Interleaver::new();
        let mut emitted = Vec::new();
        emitted.extend(il.submit(video(0, true)));
        for i in 0..40 {
            emitted.extend(il.submit(audio(i * 21)));
            if i % 2 == 0 {
                emitted.extend(il.submit(video(33 * (i / 2 + 1), i % 8 == 0)));
            }
        }
        let mut last = i64::MIN;
        for p in &emitted {
            assert!(p.dts_usec >= last, "dts went backwards: {} < {last}", p.dts_usec);
            last = p.dts_usec;
        }
    }

    #[test]
    fn first_emitted_video_is_a_keyframe_and_audio_never_leads() {
        let mut il = Interleaver::new();
        let mut emitted = Vec::new();
        // non-keyframe video first: dropped along with older audio
        emitted.extend(il.submit(audio(0)));
        emitted.extend(il.submit(video(10, false)));
        emitted.extend(il.submit(audio(20)));
        emitted.extend(il.submit(video(43, true)));
        emitted.extend(il.submit(audio(50)));
        emitted.extend(il.submit(audio(70)));
        emitted.extend(il.submit(video(76, false)));
        emitted.extend(il.submit(audio(90)));

        let first_video = emitted.iter().find(|p| p.ptype == PacketType::Video).unwrap();
        assert!(first_video.keyframe);
        let video_pos = emitted.iter().position(|p| p.ptype == PacketType::Video).unwrap();
        assert_eq!(
            emitted[..video_pos]
                .iter()
                .filter(|p| p.ptype == PacketType::Audio)
                .count(),
            0,
            "audio emitted before the first video"
        );
    }

    #[test]
    fn offsets_normalize_stream_start_to_zero() {
        let mut il = Interleaver::new();
        let mut emitted = Vec::new();
        emitted.extend(il.submit(video(5000, true)));
        emitted.extend(il.submit(audio(5002)));
        emitted.extend(il.submit(audio(5023)));
        emitted.extend(il.submit(video(5033, false)));
        emitted.extend(il.submit(audio(5044)));

        assert!(!emitted.is_empty());
        assert_eq!(emitted[0].dts_usec, 0);
        assert_eq!(emitted[0].dts, 0);
    }

    #[test]
    fn video_before_audio_at_equal_dts_pre_start() {
        let mut il = Interleaver::new();
        let mut emitted = Vec::new();
        emitted.extend(il.submit(audio(100)));
        emitted.extend(il.submit(video(100, true)));
        emitted.extend(il.submit(audio(121)));
        emitted.extend(il.submit(video(133, false)));
        emitted.extend(il.submit(audio(142)));

        assert_eq!(emitted[0].ptype, PacketType::Video);
        assert_eq!(emitted[1].ptype, PacketType::Audio);
        assert_eq!(emitted[0].dts_usec, emitted[1].dts_usec);
    }

    #[test]
    fn deinterleave_recovers_per_type_order() {
        let mut il = Interleaver::new();
        let mut emitted = Vec::new();
        emitted.extend(il.submit(video(0, true)));
        let mut audio_sent = Vec::new();
        let mut video_sent = vec![0i64];
        for i in 1..30 {
            let a = i * 21;
            audio_sent.push(a);
            emitted.extend(il.submit(audio(a)));
            if i % 2 == 0 {
                let v = 33 * i / 2;
                video_sent.push(v);
                emitted.extend(il.submit(video(v, false)));
            }
        }
        // sent packets keep payload markers via dts; recover each stream
        let videos: Vec<i64> = emitted
            .iter()
            .filter(|p| p.ptype == PacketType::Video)
            .map(|p| p.dts)
            .collect();
        let audios: Vec<i64> = emitted
            .iter()
            .filter(|p| p.ptype == PacketType::Audio)
            .map(|p| p.dts)
            .collect();
        assert!(videos.windows(2).all(|w| w[0] < w[1]));
        assert!(audios.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn payload_is_shared_not_copied() {
        let mut il = Interleaver::new();
        let v = video(0, true);
        let data = Arc::clone(&v.data);
        il.submit(v);
        assert_eq!(Arc::strong_count(&data), 2);
    }
}
