// crates/mixcast/src/output/rtmp.rs
//
// RTMP publish backend.
//
// The protocol (handshake, chunking, connect/publish negotiation) is
// rml_rtmp's sans-io client session over a blocking TcpStream; this file
// owns everything above it: FLV tag bodies, header-first send ordering,
// the congestion drop policy, dynamic bitrate, graceful shutdown, and
// reconnection.
//
// Threads: the framework's connect thread runs the initial connect and
// metadata; one sender thread drains the packet queue for the life of the
// run (reconnects included). The packet queue mutex is held only to
// enqueue/dequeue — never across a socket write.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;

use mixcast_core::clock::now_ns;
use mixcast_core::packet::{nal_priority, EncoderPacket, PacketType};
use mixcast_core::signal::OutputSignal;
use mixcast_core::{log_debug, log_info, log_warn, MixError, StopCode};
use mixcast_media::{avc, flv};

use crate::endpoint::RtmpTarget;

use super::{OutputBackend, OutputContext, OutputState};

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RtmpSettings {
    pub target: RtmpTarget,
    /// Buffer duration beyond which disposable frames drop, ms.
    pub drop_threshold_ms: i64,
    /// Buffer duration beyond which non-keyframe video drops, ms.
    pub pframe_drop_threshold_ms: i64,
    pub dbr_enabled: bool,
    pub reconnect_retry_max: u32,
    pub reconnect_retry_sec: u32,
    pub max_shutdown_sec: u64,
}

impl RtmpSettings {
    pub fn new(target: RtmpTarget) -> Self {
        Self {
            target,
            drop_threshold_ms: 700,
            pframe_drop_threshold_ms: 900,
            dbr_enabled: true,
            reconnect_retry_max: 20,
            reconnect_retry_sec: 2,
            max_shutdown_sec: 30,
        }
    }

    fn pframe_threshold_usec(&self) -> i64 {
        1000 * self.pframe_drop_threshold_ms.max(self.drop_threshold_ms + 200)
    }

    fn drop_threshold_usec(&self) -> i64 {
        1000 * self.drop_threshold_ms
    }
}

// ── Dynamic bitrate ───────────────────────────────────────────────────────────

pub const DBR_TRIGGER_USEC: i64 = 200_000;
const DBR_INC_TIMER_NS: u64 = 30_000_000_000;
const MIN_ESTIMATE_DURATION_MS: u64 = 1_000;
const MAX_ESTIMATE_DURATION_MS: u64 = 2_000;
const DBR_FLOOR_KBPS: i64 = 50;

#[derive(Debug, Clone, Copy)]
pub struct DbrFrame {
    pub send_beg_ns: u64,
    pub send_end_ns: u64,
    pub size: u64,
}

/// Congestion-response bitrate controller: estimates achievable wire rate
/// from a 1–2 s sliding window of send samples, lowers the encoder to the
/// estimate under sustained buffering, and climbs back by a tenth of the
/// original every 30 s of calm.
pub struct DbrController {
    frames: VecDeque<DbrFrame>,
    data_size: u64,
    est_bitrate: i64,
    orig_bitrate: i64,
    prev_bitrate: i64,
    cur_bitrate: i64,
    inc_bitrate: i64,
    audio_bitrate: i64,
    inc_timeout_ns: u64,
}

impl DbrController {
    pub fn new(video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            data_size: 0,
            est_bitrate: 0,
            orig_bitrate: video_kbps as i64,
            prev_bitrate: 0,
            cur_bitrate: video_kbps as i64,
            inc_bitrate: video_kbps as i64 / 10,
            audio_bitrate: audio_kbps as i64,
            inc_timeout_ns: 0,
        }
    }

    pub fn current_kbps(&self) -> i64 {
        self.cur_bitrate
    }

    pub fn original_kbps(&self) -> i64 {
        self.orig_bitrate
    }

    pub fn estimated_kbps(&self) -> i64 {
        self.est_bitrate
    }

    /// Record one send sample and refresh the estimate.
    pub fn add_frame(&mut self, frame: DbrFrame) {
        self.frames.push_back(frame);
        self.data_size += frame.size;

        let front = *self.frames.front().expect("just pushed");
        let dur_ms = frame.send_end_ns.saturating_sub(front.send_beg_ns) / 1_000_000;

        if dur_ms >= MAX_ESTIMATE_DURATION_MS {
            self.data_size -= front.size;
            self.frames.pop_front();
        }

        self.est_bitrate = if dur_ms >= MIN_ESTIMATE_DURATION_MS {
            (self.data_size * 1000 / dur_ms) as i64 * 8 / 1000
        } else {
            0
        };
        if self.est_bitrate != 0 {
            self.est_bitrate = (self.est_bitrate - self.audio_bitrate).max(DBR_FLOOR_KBPS);
        }
    }

    /// Lower the target to the current estimate (rounded down to 100 kbps)
    /// or fall back to the previous bitrate. Arms the 30 s increase timer.
    /// Returns true when the target changed.
    pub fn bitrate_lowered(&mut self, now_ns: u64) -> bool {
        let prev = self.prev_bitrate;
        let mut est = 0;

        if self.est_bitrate != 0 && self.est_bitrate < self.cur_bitrate {
            self.data_size = 0;
            self.frames.pop_front();
            est = (self.est_bitrate / 100 * 100).max(DBR_FLOOR_KBPS);
        }

        let new_bitrate = if est != 0 {
            est
        } else if prev != 0 {
            prev
        } else {
            return false;
        };

        if new_bitrate == self.cur_bitrate {
            return false;
        }

        self.prev_bitrate = 0;
        self.cur_bitrate = new_bitrate;
        self.inc_timeout_ns = now_ns + DBR_INC_TIMER_NS;
        log_info!("dbr: bitrate decreased to {} kbps", self.cur_bitrate);
        true
    }

    /// Step the increase timer; returns the new target when it fired.
    pub fn tick_increase(&mut self, now_ns: u64) -> Option<i64> {
        if self.inc_timeout_ns == 0 || now_ns < self.inc_timeout_ns {
            return None;
        }
        self.inc_timeout_ns = 0;
        self.prev_bitrate = self.cur_bitrate;
        self.cur_bitrate += self.inc_bitrate;
        if self.cur_bitrate >= self.orig_bitrate {
            self.cur_bitrate = self.orig_bitrate;
            log_info!("dbr: bitrate restored to {} kbps", self.cur_bitrate);
        } else {
            self.inc_timeout_ns = now_ns + DBR_INC_TIMER_NS;
            log_info!("dbr: bitrate increased to {} kbps, waiting", self.cur_bitrate);
        }
        Some(self.cur_bitrate)
    }

    pub fn inc_timer_armed(&self) -> bool {
        self.inc_timeout_ns != 0
    }

    /// Restore the original target on stop; returns it when it differed.
    pub fn reset(&mut self) -> Option<i64> {
        self.frames.clear();
        self.data_size = 0;
        self.est_bitrate = 0;
        self.prev_bitrate = 0;
        self.inc_timeout_ns = 0;
        if self.cur_bitrate != self.orig_bitrate {
            self.cur_bitrate = self.orig_bitrate;
            Some(self.cur_bitrate)
        } else {
            None
        }
    }
}

// ── Send queue with congestion drops ──────────────────────────────────────────

struct SendQueue {
    packets: VecDeque<EncoderPacket>,
    last_dts_usec: i64,
    min_priority: i32,
    /// Milliseconds of the first keyframe's dts; subtracted from every
    /// FLV tag timestamp.
    start_dts_offset_ms: Option<i64>,
    dropped_frames: u32,
    congestion: f32,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            packets: VecDeque::new(),
            last_dts_usec: 0,
            min_priority: 0,
            start_dts_offset_ms: None,
            dropped_frames: 0,
            congestion: 0.0,
        }
    }

    fn first_interframe_dts_usec(&self) -> Option<i64> {
        self.packets
            .iter()
            .find(|p| p.ptype == PacketType::Video && !p.keyframe)
            .map(|p| p.dts_usec)
    }

    fn buffer_duration_usec(&self) -> Option<i64> {
        self.first_interframe_dts_usec()
            .map(|first| self.last_dts_usec - first)
    }

    /// Drop buffered video below `highest_priority`. Audio and keyframes
    /// always survive; the floor sticks until a keyframe clears it.
    fn drop_frames(&mut self, highest_priority: i32) {
        let before = self.packets.len();
        self.packets.retain(|p| {
            p.ptype == PacketType::Audio || p.drop_priority >= highest_priority
        });
        let dropped = (before - self.packets.len()) as u32;
        self.dropped_frames += dropped;
        if self.min_priority < highest_priority {
            self.min_priority = highest_priority;
        }
        if dropped > 0 {
            log_debug!("congestion: dropped {dropped} buffered video packets");
        }
    }

    /// The drop / DBR decision for one class of frames. Returns the new
    /// bitrate when DBR lowered it.
    fn check_to_drop(
        &mut self,
        pframes: bool,
        settings: &RtmpSettings,
        dbr: Option<&mut DbrController>,
        now_ns: u64,
    ) -> Option<i64> {
        let (priority, threshold) = if pframes {
            (nal_priority::HIGHEST, settings.pframe_threshold_usec())
        } else {
            (nal_priority::HIGH, settings.drop_threshold_usec())
        };

        if !pframes {
            if let Some(dbr) = dbr.as_mut() {
                if let Some(kbps) = dbr.tick_increase(now_ns) {
                    return Some(kbps);
                }
            }
        }

        if self.packets.len() < 5 {
            if !pframes {
                self.congestion = 0.0;
            }
            return None;
        }

        let Some(buffer_duration) = self.buffer_duration_usec() else {
            return None;
        };

        if !pframes {
            self.congestion = buffer_duration as f32 / threshold as f32;
        }

        if let Some(dbr) = dbr {
            if pframes {
                return None;
            }
            if buffer_duration >= DBR_TRIGGER_USEC && dbr.bitrate_lowered(now_ns) {
                log_debug!("dbr trigger: buffer {} ms", buffer_duration / 1000);
                return Some(dbr.current_kbps());
            }
            return None;
        }

        if buffer_duration > threshold {
            self.drop_frames(priority);
        }
        None
    }

    /// Enqueue one video packet, applying the sticking priority floor.
    fn add_video_packet(&mut self, packet: EncoderPacket) -> bool {
        if packet.drop_priority < self.min_priority {
            self.dropped_frames += 1;
            return false;
        }
        self.min_priority = 0;
        self.last_dts_usec = packet.dts_usec;
        self.packets.push_back(packet);
        true
    }
}

// ── Protocol client ───────────────────────────────────────────────────────────

const READ_TIMEOUT: Duration = Duration::from_secs(10);

struct RtmpClient {
    stream: TcpStream,
    session: ClientSession,
    read_buf: Vec<u8>,
}

impl RtmpClient {
    /// TCP connect, RTMP handshake, connect(app), publish(key).
    fn connect(target: &RtmpTarget) -> Result<Self, MixError> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .map_err(|e| MixError::ConnectFailed(format!("{}:{}: {e}", target.host, target.port)))?;
        Self::bring_up(stream, target)
    }

    fn bring_up(mut stream: TcpStream, target: &RtmpTarget) -> Result<Self, MixError> {
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(READ_TIMEOUT)).ok();
        // a wedged peer must not pin the sender thread forever; stop
        // interrupts at the write timeout instead of a socket close
        stream.set_write_timeout(Some(READ_TIMEOUT)).ok();

        // handshake
        let mut handshake = Handshake::new(PeerType::Client);
        let p0p1 = handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| MixError::ConnectFailed(format!("rtmp handshake: {e:?}")))?;
        stream
            .write_all(&p0p1)
            .map_err(|e| MixError::ConnectFailed(format!("rtmp handshake write: {e}")))?;

        let mut buf = vec![0u8; 4096];
        let leftover = loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| MixError::ConnectFailed(format!("rtmp handshake read: {e}")))?;
            if n == 0 {
                return Err(MixError::ConnectFailed("rtmp handshake: peer closed".into()));
            }
            match handshake
                .process_bytes(&buf[..n])
                .map_err(|e| MixError::InvalidStream(format!("rtmp handshake: {e:?}")))?
            {
                HandshakeProcessResult::InProgress { response_bytes } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes).map_err(|e| {
                            MixError::ConnectFailed(format!("rtmp handshake write: {e}"))
                        })?;
                    }
                }
                HandshakeProcessResult::Completed {
                    response_bytes,
                    remaining_bytes,
                } => {
                    if !response_bytes.is_empty() {
                        stream.write_all(&response_bytes).map_err(|e| {
                            MixError::ConnectFailed(format!("rtmp handshake write: {e}"))
                        })?;
                    }
                    break remaining_bytes;
                }
            }
        };

        // session + connect(app)
        let config = ClientSessionConfig::new();
        let (session, initial) = ClientSession::new(config)
            .map_err(|e| MixError::InvalidStream(format!("rtmp session: {e:?}")))?;
        let mut client = Self {
            stream,
            session,
            read_buf: buf,
        };
        client.write_results(initial)?;
        if !leftover.is_empty() {
            let results = client
                .session
                .handle_input(&leftover)
                .map_err(|e| MixError::InvalidStream(format!("rtmp input: {e:?}")))?;
            client.write_results(results)?;
        }

        let connect_result = client
            .session
            .request_connection(target.app.clone())
            .map_err(|e| MixError::InvalidStream(format!("rtmp connect: {e:?}")))?;
        client.write_results(vec![connect_result])?;
        client.pump_until(|event| {
            matches!(event, ClientSessionEvent::ConnectionRequestAccepted)
        })?;

        // publish(key)
        let publish_result = client
            .session
            .request_publishing(target.stream_key.clone(), PublishRequestType::Live)
            .map_err(|e| MixError::InvalidStream(format!("rtmp publish: {e:?}")))?;
        client.write_results(vec![publish_result])?;
        client.pump_until(|event| matches!(event, ClientSessionEvent::PublishRequestAccepted))?;

        log_info!(
            "rtmp publishing to {}:{}/{}/<key>",
            target.host,
            target.port,
            target.app
        );
        Ok(client)
    }

    fn write_results(&mut self, results: Vec<ClientSessionResult>) -> Result<(), MixError> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    self.stream
                        .write_all(&packet.bytes)
                        .map_err(|e| MixError::Disconnected(format!("rtmp write: {e}")))?;
                }
                ClientSessionResult::RaisedEvent(event) => {
                    log_debug!("rtmp event: {event:?}");
                }
                ClientSessionResult::UnhandleableMessageReceived(_) => {}
            }
        }
        Ok(())
    }

    /// Read and process inbound bytes until `want` matches an event.
    fn pump_until(
        &mut self,
        want: impl Fn(&ClientSessionEvent) -> bool,
    ) -> Result<(), MixError> {
        let deadline = std::time::Instant::now() + READ_TIMEOUT;
        loop {
            if std::time::Instant::now() > deadline {
                return Err(MixError::InvalidStream("rtmp negotiation timed out".into()));
            }
            let n = self
                .stream
                .read(&mut self.read_buf)
                .map_err(|e| MixError::Disconnected(format!("rtmp read: {e}")))?;
            if n == 0 {
                return Err(MixError::Disconnected("rtmp peer closed".into()));
            }
            let buf: Vec<u8> = self.read_buf[..n].to_vec();
            let results = self
                .session
                .handle_input(&buf)
                .map_err(|e| MixError::InvalidStream(format!("rtmp input: {e:?}")))?;

            let mut matched = false;
            let mut rejected: Option<String> = None;
            let mut outbound = Vec::new();
            for result in results {
                match result {
                    ClientSessionResult::OutboundResponse(packet) => {
                        outbound.push(ClientSessionResult::OutboundResponse(packet))
                    }
                    ClientSessionResult::RaisedEvent(event) => {
                        if want(&event) {
                            matched = true;
                        } else if let ClientSessionEvent::ConnectionRequestRejected {
                            description,
                        } = &event
                        {
                            rejected = Some(description.clone());
                        }
                    }
                    ClientSessionResult::UnhandleableMessageReceived(_) => {}
                }
            }
            self.write_results(outbound)?;
            if let Some(description) = rejected {
                return Err(MixError::InvalidStream(description));
            }
            if matched {
                return Ok(());
            }
        }
    }

    /// Drain and discard any pending inbound control traffic.
    fn service_inbound(&mut self) {
        self.stream
            .set_read_timeout(Some(Duration::from_millis(1)))
            .ok();
        if let Ok(n) = self.stream.read(&mut self.read_buf) {
            if n > 0 {
                let buf: Vec<u8> = self.read_buf[..n].to_vec();
                if let Ok(results) = self.session.handle_input(&buf) {
                    let _ = self.write_results(results);
                }
            }
        }
        self.stream.set_read_timeout(Some(READ_TIMEOUT)).ok();
    }

    fn publish_metadata(&mut self, meta: &StreamMetadata) -> Result<(), MixError> {
        let result = self
            .session
            .publish_metadata(meta)
            .map_err(|e| MixError::Disconnected(format!("rtmp metadata: {e:?}")))?;
        self.write_results(vec![result])
    }

    fn publish_video(&mut self, body: Vec<u8>, time_ms: u32) -> Result<usize, MixError> {
        let len = body.len();
        let result = self
            .session
            .publish_video_data(Bytes::from(body), RtmpTimestamp::new(time_ms), false)
            .map_err(|e| MixError::Disconnected(format!("rtmp video: {e:?}")))?;
        self.write_results(vec![result])?;
        Ok(len)
    }

    fn publish_audio(&mut self, body: Vec<u8>, time_ms: u32) -> Result<usize, MixError> {
        let len = body.len();
        let result = self
            .session
            .publish_audio_data(Bytes::from(body), RtmpTimestamp::new(time_ms), false)
            .map_err(|e| MixError::Disconnected(format!("rtmp audio: {e:?}")))?;
        self.write_results(vec![result])?;
        Ok(len)
    }
}

// ── Backend ───────────────────────────────────────────────────────────────────

struct RtmpShared {
    queue: Mutex<SendQueue>,
    ready: Condvar,
    stopping: AtomicBool,
    shutdown_now: AtomicBool,
    stop_ts_usec: AtomicI64,
    shutdown_deadline_ns: AtomicU64,
    total_bytes: AtomicU64,
    dropped_frames: AtomicU32,
    dbr: Mutex<DbrController>,
}

pub struct RtmpOutput {
    settings: RtmpSettings,
    shared: Arc<RtmpShared>,
    sender: Option<JoinHandle<()>>,
}

impl RtmpOutput {
    pub fn new(settings: RtmpSettings, video_kbps: u32, audio_kbps: u32) -> Self {
        Self {
            shared: Arc::new(RtmpShared {
                queue: Mutex::new(SendQueue::new()),
                ready: Condvar::new(),
                stopping: AtomicBool::new(false),
                shutdown_now: AtomicBool::new(false),
                stop_ts_usec: AtomicI64::new(0),
                shutdown_deadline_ns: AtomicU64::new(0),
                total_bytes: AtomicU64::new(0),
                dropped_frames: AtomicU32::new(0),
                dbr: Mutex::new(DbrController::new(video_kbps, audio_kbps)),
            }),
            settings,
            sender: None,
        }
    }
}

impl OutputBackend for RtmpOutput {
    fn name(&self) -> &'static str {
        "rtmp"
    }

    fn start(&mut self, ctx: &OutputContext) -> Result<(), MixError> {
        let client = RtmpClient::connect(&self.settings.target)?;

        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.shutdown_now.store(false, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        let ctx = ctx.clone();
        self.sender = Some(
            std::thread::Builder::new()
                .name("mixcast-rtmp-send".into())
                .spawn(move || sender_thread(client, shared, settings, ctx))
                .expect("spawn rtmp sender"),
        );
        Ok(())
    }

    fn encoded_packet(&mut self, packet: EncoderPacket, ctx: &OutputContext) {
        let now = now_ns();

        // Annex-B → AVCC for FLV; keyframe/priority re-derived
        let packet = match packet.ptype {
            PacketType::Video => avc::parse_packet(&packet),
            PacketType::Audio => packet,
        };

        let mut bitrate_change = None;
        {
            let mut queue = self.shared.queue.lock();
            if queue.start_dts_offset_ms.is_none()
                && packet.ptype == PacketType::Video
                && packet.keyframe
            {
                queue.start_dts_offset_ms = Some(packet.ms_time(packet.dts));
            }

            let added = match packet.ptype {
                PacketType::Audio => {
                    queue.packets.push_back(packet);
                    true
                }
                PacketType::Video => {
                    let mut dbr = self.shared.dbr.lock();
                    let dbr_ref = self.settings.dbr_enabled.then_some(&mut *dbr);
                    if let Some(kbps) = queue.check_to_drop(false, &self.settings, dbr_ref, now) {
                        bitrate_change = Some(kbps);
                    }
                    queue.check_to_drop(true, &self.settings, None, now);
                    queue.add_video_packet(packet)
                }
            };
            self.shared
                .dropped_frames
                .store(queue.dropped_frames, Ordering::Relaxed);
            if added {
                self.shared.ready.notify_one();
            }
        }

        if let Some(kbps) = bitrate_change {
            ctx.update_video_bitrate(kbps as u32);
        }
    }

    fn stop(&mut self, ts_usec: u64, _ctx: &OutputContext) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        if ts_usec == 0 {
            self.shared.shutdown_now.store(true, Ordering::SeqCst);
        } else {
            self.shared
                .stop_ts_usec
                .store(ts_usec as i64, Ordering::SeqCst);
            self.shared.shutdown_deadline_ns.store(
                now_ns() + self.settings.max_shutdown_sec * 1_000_000_000,
                Ordering::SeqCst,
            );
        }
        self.shared.ready.notify_all();
        if ts_usec == 0 {
            if let Some(t) = self.sender.take() {
                let _ = t.join();
            }
        }
    }

    fn total_bytes(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }

    fn dropped_frames(&self) -> u32 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }
}

/// True when the sender may close: immediate shutdown, wall-clock budget
/// exhausted, or the packet is at/after the graceful stop timestamp.
fn can_shutdown(packet: &EncoderPacket, stop_ts_usec: i64, deadline_ns: u64, now: u64) -> bool {
    if deadline_ns != 0 && now >= deadline_ns {
        log_warn!("rtmp shutdown budget exhausted, closing");
        return true;
    }
    stop_ts_usec != 0 && packet.sys_dts_usec >= stop_ts_usec
}

fn build_metadata(ctx: &OutputContext) -> StreamMetadata {
    let mut meta = StreamMetadata::new();
    meta.video_width = Some(ctx.video_info.width);
    meta.video_height = Some(ctx.video_info.height);
    meta.video_codec = Some("avc1".to_string());
    meta.video_frame_rate = Some(ctx.video_info.fps_num as f32 / ctx.video_info.fps_den as f32);
    meta.video_bitrate_kbps = Some(ctx.video_info.bitrate_kbps);
    meta.audio_codec = Some("mp4a".to_string());
    meta.audio_bitrate_kbps = Some(ctx.audio_info.bitrate_kbps);
    meta.audio_sample_rate = Some(ctx.audio_info.sample_rate);
    meta.audio_channels = Some(ctx.audio_info.channels);
    meta.audio_is_stereo = Some(ctx.audio_info.channels == 2);
    meta.encoder = Some("mixcast".to_string());
    meta
}

/// Sequence headers, metadata first: onMetaData, AVC config record, AAC
/// AudioSpecificConfig. Media may flow only after these.
fn send_headers(client: &mut RtmpClient, ctx: &OutputContext) -> Result<usize, MixError> {
    let mut sent = 0;
    client.publish_metadata(&build_metadata(ctx))?;

    let video_extra = ctx.video_extradata();
    if let Some(avcc) = avc::header_to_avcc(&video_extra) {
        let mut header_pkt = EncoderPacket::new(PacketType::Video, avcc);
        header_pkt.keyframe = true;
        let (body, _) = flv::flv_video_body(&header_pkt, 0, true);
        sent += client.publish_video(body, 0)?;
    }

    let audio_extra = ctx.audio_extradata();
    if !audio_extra.is_empty() {
        let header_pkt = EncoderPacket::new(PacketType::Audio, audio_extra);
        let (body, _) = flv::flv_audio_body(&header_pkt, 0, true);
        sent += client.publish_audio(body, 0)?;
    }

    Ok(sent)
}

fn sender_thread(
    mut client: RtmpClient,
    shared: Arc<RtmpShared>,
    settings: RtmpSettings,
    ctx: OutputContext,
) {
    let mut sent_headers = false;
    let mut first_media_sent = false;
    let mut disconnected = false;

    'run: loop {
        // wait for work or a stop request
        let packet = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown_now.load(Ordering::SeqCst) {
                    break 'run;
                }
                if let Some(p) = queue.packets.pop_front() {
                    break p;
                }
                if shared.stopping.load(Ordering::SeqCst) {
                    // graceful stop with an empty queue: done
                    break 'run;
                }
                shared.ready.wait(&mut queue);
            }
        };

        if shared.stopping.load(Ordering::SeqCst)
            && can_shutdown(
                &packet,
                shared.stop_ts_usec.load(Ordering::SeqCst),
                shared.shutdown_deadline_ns.load(Ordering::SeqCst),
                now_ns(),
            )
        {
            break 'run;
        }

        if !sent_headers || (packet.ptype == PacketType::Video && packet.encoder_first_packet) {
            match send_headers(&mut client, &ctx) {
                Ok(n) => {
                    shared.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    sent_headers = true;
                }
                Err(e) => {
                    log_warn!("rtmp header send failed: {e}");
                    disconnected = true;
                }
            }
        }

        if !disconnected {
            client.service_inbound();
            let offset_ms = shared
                .queue
                .lock()
                .start_dts_offset_ms
                .unwrap_or_default();
            let send_beg = now_ns();
            let result = match packet.ptype {
                PacketType::Video => {
                    let (body, time_ms) = flv::flv_video_body(&packet, offset_ms, false);
                    client.publish_video(body, time_ms)
                }
                PacketType::Audio => {
                    let (body, time_ms) = flv::flv_audio_body(&packet, offset_ms, false);
                    client.publish_audio(body, time_ms)
                }
            };
            match result {
                Ok(n) => {
                    shared.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    if !first_media_sent {
                        first_media_sent = true;
                        ctx.signals.emit(OutputSignal::FirstMediaPacket);
                    }
                    if settings.dbr_enabled {
                        shared.dbr.lock().add_frame(DbrFrame {
                            send_beg_ns: send_beg,
                            send_end_ns: now_ns(),
                            size: n as u64,
                        });
                    }
                }
                Err(e) => {
                    log_warn!("rtmp send failed: {e}");
                    disconnected = true;
                }
            }
        }

        if disconnected {
            match try_reconnect(&shared, &settings, &ctx) {
                Some(new_client) => {
                    client = new_client;
                    disconnected = false;
                    sent_headers = false;
                    ctx.set_state(OutputState::Active);
                    ctx.signals.emit(OutputSignal::ReconnectSuccess);
                }
                None => {
                    // stopped or retries exhausted
                    if !shared.stopping.load(Ordering::SeqCst) {
                        ctx.signals
                            .signal_stop(StopCode::Disconnected, "rtmp connection lost");
                        return;
                    }
                    break 'run;
                }
            }
        }
    }

    // clean exit: restore bitrate, report success
    if let Some(kbps) = shared.dbr.lock().reset() {
        ctx.update_video_bitrate(kbps as u32);
    }
    shared.queue.lock().packets.clear();
    log_info!("rtmp sender finished, {} bytes", shared.total_bytes.load(Ordering::Relaxed));
    ctx.signals.signal_stop(StopCode::Success, "stream stopped");
}

/// Retry the connection until it succeeds, retries run out, or a stop is
/// requested. The retry wait is an event-with-deadline, never a raw sleep.
fn try_reconnect(
    shared: &Arc<RtmpShared>,
    settings: &RtmpSettings,
    ctx: &OutputContext,
) -> Option<RtmpClient> {
    if settings.reconnect_retry_max == 0 {
        return None;
    }

    for attempt in 1..=settings.reconnect_retry_max {
        if shared.stopping.load(Ordering::SeqCst) {
            return None;
        }
        ctx.set_state(OutputState::Reconnecting);
        ctx.signals.emit(OutputSignal::Reconnect);

        // cancellable wait
        let deadline = now_ns() + settings.reconnect_retry_sec as u64 * 1_000_000_000;
        {
            let mut queue = shared.queue.lock();
            while now_ns() < deadline {
                if shared.stopping.load(Ordering::SeqCst) || shared.shutdown_now.load(Ordering::SeqCst)
                {
                    return None;
                }
                let remaining = Duration::from_nanos(deadline.saturating_sub(now_ns()));
                shared.ready.wait_for(&mut queue, remaining.min(Duration::from_millis(200)));
            }
        }

        match RtmpClient::connect(&settings.target) {
            Ok(client) => {
                log_info!("rtmp reconnected on attempt {attempt}");
                return Some(client);
            }
            Err(e) => {
                log_warn!(
                    "rtmp reconnect attempt {attempt}/{} failed: {e}",
                    settings.reconnect_retry_max
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn video_pkt(dts_ms: i64, keyframe: bool, priority: i32, sys_usec: i64) -> EncoderPacket {
        let mut p = EncoderPacket::new(PacketType::Video, vec![0u8; 100]);
        p.pts = dts_ms;
        p.dts = dts_ms;
        p.timebase_num = 1;
        p.timebase_den = 1000;
        p.keyframe = keyframe;
        p.priority = priority;
        p.drop_priority = priority;
        p.sys_dts_usec = sys_usec;
        p.refresh_dts_usec();
        p
    }

    fn audio_pkt(dts_ms: i64) -> EncoderPacket {
        let mut p = EncoderPacket::new(PacketType::Audio, vec![0u8; 20]);
        p.pts = dts_ms;
        p.dts = dts_ms;
        p.timebase_num = 1;
        p.timebase_den = 1000;
        p.refresh_dts_usec();
        p
    }

    fn settings() -> RtmpSettings {
        RtmpSettings::new(RtmpTarget {
            host: "localhost".into(),
            port: 1935,
            app: "live".into(),
            stream_key: "key".into(),
        })
    }

    #[test]
    fn drop_policy_spares_audio_and_keyframes() {
        // 20 packets spanning one second of dts
        let mut queue = SendQueue::new();
        for i in 0..20i64 {
            let dts = i * 50;
            if i % 4 == 0 {
                queue.packets.push_back(audio_pkt(dts));
            } else if i % 7 == 0 {
                queue.add_video_packet(video_pkt(dts, true, nal_priority::HIGHEST, 0));
            } else {
                queue.add_video_packet(video_pkt(dts, false, nal_priority::LOW, 0));
            }
        }
        queue.last_dts_usec = 1_000_000;

        let mut s = settings();
        s.drop_threshold_ms = 700;
        s.pframe_drop_threshold_ms = 900;

        // buffer spans ~1000 ms > 700 ms: disposable/low video drops
        queue.check_to_drop(false, &s, None, 0);
        assert!(queue
            .packets
            .iter()
            .all(|p| p.ptype == PacketType::Audio || p.drop_priority >= nal_priority::HIGH));
        assert!(queue.packets.iter().any(|p| p.ptype == PacketType::Audio));
        assert_eq!(queue.min_priority, nal_priority::HIGH);
        assert!(queue.dropped_frames > 0);

        // the floor holds until a keyframe arrives
        assert!(!queue.add_video_packet(video_pkt(1050, false, nal_priority::LOW, 0)));
        assert!(queue.add_video_packet(video_pkt(1100, true, nal_priority::HIGHEST, 0)));
        assert_eq!(queue.min_priority, 0);
    }

    #[test]
    fn congestion_gauge_tracks_buffer_duration() {
        let mut queue = SendQueue::new();
        queue.add_video_packet(video_pkt(0, true, nal_priority::HIGHEST, 0));
        for i in 1..8i64 {
            queue.add_video_packet(video_pkt(i * 50, false, nal_priority::HIGH, 0));
        }
        let s = settings();
        queue.check_to_drop(false, &s, None, 0);
        // buffer = 350 ms - 50 (first interframe at 50) = 300 ms of 700 ms
        assert!((queue.congestion - (300.0 / 700.0)).abs() < 1e-3);
    }

    #[test]
    fn dbr_lowers_to_estimate_rounded_down() {
        // 4 Mbps video, 160 kbps audio; wire shows ~1560 kbps over 1.5 s
        let mut dbr = DbrController::new(4000, 160);
        let total_bytes = 292_500u64; // 1560 kbit/s * 1.5 s / 8
        let samples = 15;
        for i in 0..samples {
            dbr.add_frame(DbrFrame {
                send_beg_ns: i * 100_000_000,
                send_end_ns: i * 100_000_000 + 50_000_000,
                size: total_bytes / samples,
            });
        }
        // window spans 1450 ms: raw ≈ 1613 kbps, minus 160 audio = 1453
        assert_eq!(dbr.estimated_kbps(), 1453);

        let now = 10_000_000_000;
        assert!(dbr.bitrate_lowered(now));
        // lowered target rounds down to the nearest 100 kbps
        assert_eq!(dbr.current_kbps(), 1400);
        assert!(dbr.inc_timer_armed());
    }

    #[test]
    fn dbr_climbs_back_by_tenths_and_caps_at_original() {
        let mut dbr = DbrController::new(4000, 160);
        dbr.est_bitrate = 1000;
        let mut now = 0u64;
        assert!(dbr.bitrate_lowered(now));
        assert_eq!(dbr.current_kbps(), 1000);

        // each 30 s of calm adds orig/10 = 400 kbps
        let mut steps = 0;
        loop {
            now += DBR_INC_TIMER_NS;
            match dbr.tick_increase(now) {
                Some(kbps) => {
                    steps += 1;
                    assert!(kbps <= 4000);
                }
                None => break,
            }
            if !dbr.inc_timer_armed() {
                break;
            }
        }
        assert_eq!(dbr.current_kbps(), 4000);
        // 1000 → 4000 in 400 kbps steps: ceil(3000/400) = 8 firings
        assert_eq!(steps, 8);

        // never exceeds the original even if the timer fires again
        now += DBR_INC_TIMER_NS;
        assert!(dbr.tick_increase(now).is_none());
        assert_eq!(dbr.current_kbps(), 4000);
    }

    #[test]
    fn dbr_trigger_needs_buffer_and_low_estimate() {
        let mut queue = SendQueue::new();
        queue.add_video_packet(video_pkt(0, true, nal_priority::HIGHEST, 0));
        for i in 1..10i64 {
            queue.add_video_packet(video_pkt(i * 33, false, nal_priority::HIGH, 0));
        }
        // buffer ≈ 264 ms ≥ 200 ms trigger
        let mut s = settings();
        s.dbr_enabled = true;
        let mut dbr = DbrController::new(4000, 160);
        dbr.est_bitrate = 1400;

        let changed = queue.check_to_drop(false, &s, Some(&mut dbr), 0);
        assert_eq!(changed, Some(1400));
        // dbr mode never drops frames
        assert_eq!(queue.dropped_frames, 0);
    }

    #[test]
    fn graceful_stop_cutoff() {
        let deadline = 0; // no budget pressure
        assert!(!can_shutdown(&video_pkt(0, true, 3, 900), 1000, deadline, 0));
        assert!(can_shutdown(&video_pkt(0, true, 3, 1000), 1000, deadline, 0));
        assert!(can_shutdown(&video_pkt(0, true, 3, 1500), 1000, deadline, 0));
        // wall-clock budget exhausted wins regardless of packet time
        assert!(can_shutdown(&video_pkt(0, true, 3, 0), 1000, 5, 10));
    }

    #[test]
    fn reconnect_gives_up_after_max_retries() {
        let shared = StdArc::new(RtmpShared {
            queue: Mutex::new(SendQueue::new()),
            ready: Condvar::new(),
            stopping: AtomicBool::new(false),
            shutdown_now: AtomicBool::new(false),
            stop_ts_usec: AtomicI64::new(0),
            shutdown_deadline_ns: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            dropped_frames: AtomicU32::new(0),
            dbr: Mutex::new(DbrController::new(4000, 160)),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx_state = StdArc::new(Mutex::new(super::OutputState::Active));
        let ctx = OutputContext {
            signals: mixcast_core::SignalHub::new(tx),
            state: ctx_state,
            video_info: super::super::VideoStreamInfo {
                width: 16,
                height: 16,
                fps_num: 30,
                fps_den: 1,
                bitrate_kbps: 500,
            },
            audio_info: super::super::AudioStreamInfo {
                sample_rate: 48_000,
                channels: 2,
                bitrate_kbps: 128,
            },
            video_encoder: StdArc::new(Mutex::new(
                mixcast_media::H264Encoder::create(mixcast_media::VideoEncoderSettings {
                    width: 16,
                    height: 16,
                    fps_num: 30,
                    fps_den: 1,
                    bitrate_kbps: 500,
                    format: mixcast_core::frame::PixelFormat::I420,
                    color_space: Default::default(),
                    color_range: Default::default(),
                })
                .expect("h264 encoder"),
            )),
            audio_encoder: StdArc::new(Mutex::new(
                mixcast_media::AacEncoder::create(mixcast_media::AudioEncoderSettings {
                    bitrate_kbps: 128,
                    sample_rate: 48_000,
                    layout: mixcast_core::frame::SpeakerLayout::Stereo,
                    mixer_idx: 0,
                })
                .expect("aac encoder"),
            )),
        };

        // port 1 is never listening; each attempt fails fast
        let mut s = RtmpSettings::new(RtmpTarget {
            host: "127.0.0.1".into(),
            port: 1,
            app: "live".into(),
            stream_key: "key".into(),
        });
        s.reconnect_retry_max = 2;
        s.reconnect_retry_sec = 0;

        assert!(try_reconnect(&shared, &s, &ctx).is_none());
        let reconnect_signals = rx
            .try_iter()
            .filter(|sig| matches!(sig, OutputSignal::Reconnect))
            .count();
        assert_eq!(reconnect_signals, 2);

        // a zero retry budget never signals Reconnect at all
        s.reconnect_retry_max = 0;
        assert!(try_reconnect(&shared, &s, &ctx).is_none());
    }

    #[test]
    fn start_offset_seeds_from_first_keyframe_only() {
        let shared = StdArc::new(RtmpShared {
            queue: Mutex::new(SendQueue::new()),
            ready: Condvar::new(),
            stopping: AtomicBool::new(false),
            shutdown_now: AtomicBool::new(false),
            stop_ts_usec: AtomicI64::new(0),
            shutdown_deadline_ns: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            dropped_frames: AtomicU32::new(0),
            dbr: Mutex::new(DbrController::new(4000, 160)),
        });
        // a non-keyframe (e.g. an SEI-only packet at dts 0) must not seed
        {
            let mut q = shared.queue.lock();
            let non_kf = video_pkt(0, false, nal_priority::HIGH, 0);
            if q.start_dts_offset_ms.is_none() && non_kf.keyframe {
                q.start_dts_offset_ms = Some(non_kf.ms_time(non_kf.dts));
            }
            assert!(q.start_dts_offset_ms.is_none());

            let kf = video_pkt(250, true, nal_priority::HIGHEST, 0);
            if q.start_dts_offset_ms.is_none() && kf.keyframe {
                q.start_dts_offset_ms = Some(kf.ms_time(kf.dts));
            }
            assert_eq!(q.start_dts_offset_ms, Some(250));
        }
    }
}
