// crates/mixcast/src/output/avmux.rs
//
// Shared libavformat plumbing for the MPEG-TS and file backends: stream
// registration with codec parameters, packet conversion with timebase
// rescale, and error mapping.
//
// Stream setup writes AVCodecParameters directly through the ffi — the
// safe wrapper only fills codecpar from an opened encoder context, and
// these muxers receive extradata bytes, not encoder objects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use ffmpeg::util::rational::Rational;
use parking_lot::{Condvar, Mutex};

use mixcast_core::clock::now_ns;
use mixcast_core::log_warn;
use mixcast_core::packet::{EncoderPacket, PacketType};
use mixcast_core::MixError;

use super::OutputContext;

/// Outcome of writing one packet to the muxer.
pub(crate) enum WriteOutcome {
    Ok(usize),
    /// Bad packet; skip it and keep the stream alive.
    Skipped,
    Fatal(MixError),
}

pub(crate) struct MuxStreams {
    pub video_index: usize,
    pub audio_index: usize,
    pub video_tb: Rational,
    pub audio_tb: Rational,
}

/// Register one H.264 and one AAC stream on `octx`, extradata attached.
/// Must run before `write_header`.
///
/// # Safety
/// `octx` must be a valid, not-yet-started output context.
pub(crate) unsafe fn add_streams(
    octx: &mut ffmpeg::format::context::Output,
    ctx: &OutputContext,
    video_extradata: &[u8],
    audio_extradata: &[u8],
) -> Result<MuxStreams, MixError> {
    let video_index = add_stream(
        octx,
        ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
        ffi::AVCodecID::AV_CODEC_ID_H264,
        ctx,
        video_extradata,
    )?;
    let audio_index = add_stream(
        octx,
        ffi::AVMediaType::AVMEDIA_TYPE_AUDIO,
        ffi::AVCodecID::AV_CODEC_ID_AAC,
        ctx,
        audio_extradata,
    )?;
    Ok(MuxStreams {
        video_index,
        audio_index,
        // refreshed from the muxer after write_header
        video_tb: Rational::new(ctx.video_info.fps_den as i32, ctx.video_info.fps_num as i32),
        audio_tb: Rational::new(1, ctx.audio_info.sample_rate as i32),
    })
}

unsafe fn add_stream(
    octx: &mut ffmpeg::format::context::Output,
    media_type: ffi::AVMediaType,
    codec_id: ffi::AVCodecID,
    ctx: &OutputContext,
    extradata: &[u8],
) -> Result<usize, MixError> {
    let stream = ffi::avformat_new_stream(octx.as_mut_ptr(), std::ptr::null());
    if stream.is_null() {
        return Err(MixError::InvalidStream("avformat_new_stream failed".into()));
    }

    let par = (*stream).codecpar;
    (*par).codec_type = media_type;
    (*par).codec_id = codec_id;

    if media_type == ffi::AVMediaType::AVMEDIA_TYPE_VIDEO {
        (*par).width = ctx.video_info.width as i32;
        (*par).height = ctx.video_info.height as i32;
        (*par).bit_rate = ctx.video_info.bitrate_kbps as i64 * 1000;
        (*stream).time_base = ffi::AVRational {
            num: ctx.video_info.fps_den as i32,
            den: ctx.video_info.fps_num as i32,
        };
    } else {
        (*par).sample_rate = ctx.audio_info.sample_rate as i32;
        (*par).bit_rate = ctx.audio_info.bitrate_kbps as i64 * 1000;
        ffi::av_channel_layout_default(&mut (*par).ch_layout, ctx.audio_info.channels as i32);
        (*stream).time_base = ffi::AVRational {
            num: 1,
            den: ctx.audio_info.sample_rate as i32,
        };
    }

    if !extradata.is_empty() {
        let size = extradata.len();
        let buf = ffi::av_mallocz(size + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
        if buf.is_null() {
            return Err(MixError::InvalidStream("extradata allocation failed".into()));
        }
        std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, size);
        (*par).extradata = buf;
        (*par).extradata_size = size as i32;
    }

    Ok((*stream).index as usize)
}

/// Re-read the muxer-assigned timebases after `write_header`.
pub(crate) fn refresh_timebases(
    octx: &ffmpeg::format::context::Output,
    streams: &mut MuxStreams,
) {
    if let Some(st) = octx.stream(streams.video_index) {
        streams.video_tb = st.time_base();
    }
    if let Some(st) = octx.stream(streams.audio_index) {
        streams.audio_tb = st.time_base();
    }
}

/// Convert, rescale, and write one packet interleaved.
pub(crate) fn write_packet(
    octx: &mut ffmpeg::format::context::Output,
    streams: &MuxStreams,
    packet: &EncoderPacket,
) -> WriteOutcome {
    let mut pkt = ffmpeg::Packet::copy(&packet.data);
    let (stream_index, dst_tb) = match packet.ptype {
        PacketType::Video => (streams.video_index, streams.video_tb),
        PacketType::Audio => (streams.audio_index, streams.audio_tb),
    };
    pkt.set_stream(stream_index);
    pkt.set_pts(Some(packet.pts));
    pkt.set_dts(Some(packet.dts));
    if packet.keyframe {
        pkt.set_flags(ffmpeg::packet::Flags::KEY);
    }
    pkt.rescale_ts(
        Rational::new(packet.timebase_num as i32, packet.timebase_den as i32),
        dst_tb,
    );

    match pkt.write_interleaved(octx) {
        Ok(()) => WriteOutcome::Ok(packet.data.len()),
        Err(e) => map_write_error(e),
    }
}

fn map_write_error(e: ffmpeg::Error) -> WriteOutcome {
    match e {
        ffmpeg::Error::InvalidData => {
            log_warn!("muxer rejected a packet (invalid data), skipping");
            WriteOutcome::Skipped
        }
        ffmpeg::Error::Other { errno } if errno == libc::ENOSPC => {
            WriteOutcome::Fatal(MixError::NoSpace)
        }
        other => WriteOutcome::Fatal(MixError::Disconnected(format!("mux write: {other}"))),
    }
}

// ── Writer-side queue shared by both avformat backends ────────────────────────

pub(crate) struct MuxQueue {
    pub queue: Mutex<VecDeque<EncoderPacket>>,
    pub ready: Condvar,
    pub stopping: AtomicBool,
    pub shutdown_now: AtomicBool,
    pub stop_ts_usec: AtomicI64,
    pub shutdown_deadline_ns: AtomicU64,
    pub total_bytes: AtomicU64,
}

impl MuxQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            stopping: AtomicBool::new(false),
            shutdown_now: AtomicBool::new(false),
            stop_ts_usec: AtomicI64::new(0),
            shutdown_deadline_ns: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
        })
    }

    pub fn push(&self, packet: EncoderPacket) {
        self.queue.lock().push_back(packet);
        self.ready.notify_one();
    }

    pub fn request_stop(&self, ts_usec: u64, max_shutdown_sec: u64) {
        self.stopping.store(true, Ordering::SeqCst);
        if ts_usec == 0 {
            self.shutdown_now.store(true, Ordering::SeqCst);
        } else {
            self.stop_ts_usec.store(ts_usec as i64, Ordering::SeqCst);
            self.shutdown_deadline_ns
                .store(now_ns() + max_shutdown_sec * 1_000_000_000, Ordering::SeqCst);
        }
        self.ready.notify_all();
    }

    /// Next packet to write, honoring stop semantics. None = finish.
    pub fn next_packet(&self) -> Option<EncoderPacket> {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown_now.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(p) = queue.pop_front() {
                let stop_ts = self.stop_ts_usec.load(Ordering::SeqCst);
                let deadline = self.shutdown_deadline_ns.load(Ordering::SeqCst);
                if self.stopping.load(Ordering::SeqCst) {
                    if deadline != 0 && now_ns() >= deadline {
                        return None;
                    }
                    if stop_ts != 0 && p.sys_dts_usec >= stop_ts {
                        return None;
                    }
                }
                return Some(p);
            }
            if self.stopping.load(Ordering::SeqCst) {
                return None;
            }
            self.ready.wait(&mut queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(sys_usec: i64) -> EncoderPacket {
        let mut p = EncoderPacket::new(PacketType::Video, vec![0]);
        p.sys_dts_usec = sys_usec;
        p
    }

    #[test]
    fn graceful_stop_drains_up_to_timestamp() {
        let q = MuxQueue::new();
        for sys in [100, 500, 900, 1000, 1100] {
            q.push(pkt(sys));
        }
        q.request_stop(1000, 30);

        let mut drained = Vec::new();
        while let Some(p) = q.next_packet() {
            drained.push(p.sys_dts_usec);
        }
        // everything with sys_dts_usec < 1000 goes out; the rest is cut
        assert_eq!(drained, vec![100, 500, 900]);
    }

    #[test]
    fn immediate_stop_discards_everything() {
        let q = MuxQueue::new();
        q.push(pkt(1));
        q.push(pkt(2));
        q.request_stop(0, 30);
        assert!(q.next_packet().is_none());
    }
}
