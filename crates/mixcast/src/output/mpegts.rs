// crates/mixcast/src/output/mpegts.rs
//
// MPEG-TS output over udp/tcp/http (native AVIO protocols) or SRT.
//
// The muxer lives on the writer thread: libavformat contexts hold raw
// pointers and never cross threads. start() spawns the writer and blocks
// on its bring-up result, so connect failures still surface synchronously
// on the connect thread.
//
// For SRT the same mpegts muxer writes through a custom AVIO callback
// that chunks the muxer's output into SRT payloads and pushes them down a
// srt-tokio socket, driven by a current-thread runtime owned by the
// writer.

use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use bytes::Bytes;
use futures_util::SinkExt;
use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use srt_tokio::SrtSocket;

use mixcast_core::packet::EncoderPacket;
use mixcast_core::signal::OutputSignal;
use mixcast_core::{log_info, log_warn, MixError, StopCode};

use crate::endpoint::TsTransport;

use super::avmux::{self, MuxQueue, WriteOutcome};
use super::{OutputBackend, OutputContext};

/// SRT's maximum payload per packet.
const SRT_PAYLOAD: usize = 1316;

const AVIO_BUFFER: usize = 32 * 1024;

pub struct MpegTsOutput {
    url: String,
    transport: TsTransport,
    max_shutdown_sec: u64,
    shared: Arc<MuxQueue>,
    writer: Option<JoinHandle<()>>,
}

impl MpegTsOutput {
    pub fn new(url: String, transport: TsTransport) -> Self {
        Self {
            url,
            transport,
            max_shutdown_sec: 30,
            shared: MuxQueue::new(),
            writer: None,
        }
    }
}

impl OutputBackend for MpegTsOutput {
    fn name(&self) -> &'static str {
        "mpegts"
    }

    fn start(&mut self, ctx: &OutputContext) -> Result<(), MixError> {
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let url = self.url.clone();
        let transport = self.transport;
        let shared = Arc::clone(&self.shared);
        let ctx = ctx.clone();

        self.writer = Some(
            std::thread::Builder::new()
                .name("mixcast-ts-write".into())
                .spawn(move || writer_thread(url, transport, shared, ctx, init_tx))
                .map_err(|e| MixError::ConnectFailed(format!("spawn ts writer: {e}")))?,
        );

        match init_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MixError::ConnectFailed("ts writer died during bring-up".into())),
        }
    }

    fn encoded_packet(&mut self, packet: EncoderPacket, _ctx: &OutputContext) {
        self.shared.push(packet);
    }

    fn stop(&mut self, ts_usec: u64, _ctx: &OutputContext) {
        self.shared.request_stop(ts_usec, self.max_shutdown_sec);
        if ts_usec == 0 {
            if let Some(t) = self.writer.take() {
                let _ = t.join();
            }
        }
    }

    fn total_bytes(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }
}

// ── SRT transport behind a custom AVIO ────────────────────────────────────────

struct SrtIo {
    runtime: tokio::runtime::Runtime,
    socket: SrtSocket,
    failed: bool,
}

impl SrtIo {
    fn connect(url: &str) -> Result<Box<Self>, MixError> {
        // srt://host:port?streamid=… — srt-tokio takes host:port and the
        // stream id separately
        let rest = url.strip_prefix("srt://").unwrap_or(url);
        let (addr, query) = rest.split_once('?').unwrap_or((rest, ""));
        let streamid = query
            .split('&')
            .find_map(|kv| kv.strip_prefix("streamid="))
            .map(str::to_string);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MixError::ConnectFailed(format!("srt runtime: {e}")))?;

        let addr_owned = addr.to_string();
        let socket = runtime
            .block_on(async {
                SrtSocket::builder()
                    .call(addr_owned.as_str(), streamid.as_deref())
                    .await
            })
            .map_err(|e| MixError::ConnectFailed(format!("srt connect {addr}: {e}")))?;

        log_info!("srt connected to {addr}");
        Ok(Box::new(Self {
            runtime,
            socket,
            failed: false,
        }))
    }

    fn send(&mut self, data: &[u8]) -> bool {
        for chunk in data.chunks(SRT_PAYLOAD) {
            let payload = (Instant::now(), Bytes::copy_from_slice(chunk));
            if self
                .runtime
                .block_on(self.socket.send(payload))
                .is_err()
            {
                self.failed = true;
                return false;
            }
        }
        true
    }
}

unsafe extern "C" fn srt_write_packet(opaque: *mut c_void, buf: *mut u8, size: c_int) -> c_int {
    let io = &mut *(opaque as *mut SrtIo);
    let data = std::slice::from_raw_parts(buf as *const u8, size as usize);
    if io.send(data) {
        size
    } else {
        ffi::AVERROR_EXTERNAL
    }
}

/// The muxer plus whatever owns its byte sink.
struct TsMuxer {
    octx: ffmpeg::format::context::Output,
    // kept alive for the custom AVIO callback's opaque pointer
    _srt: Option<Box<SrtIo>>,
}

fn open_muxer(url: &str, transport: TsTransport) -> Result<TsMuxer, MixError> {
    match transport {
        TsTransport::Avio => {
            let octx = ffmpeg::format::output_as(&url, "mpegts").map_err(|e| {
                MixError::ConnectFailed(format!("open mpegts target '{url}': {e}"))
            })?;
            Ok(TsMuxer { octx, _srt: None })
        }
        TsTransport::Srt => {
            let mut srt = SrtIo::connect(url)?;

            let octx = unsafe {
                let mut ptr: *mut ffi::AVFormatContext = std::ptr::null_mut();
                let format = CString::new("mpegts").expect("static name");
                let ret = ffi::avformat_alloc_output_context2(
                    &mut ptr,
                    std::ptr::null_mut(),
                    format.as_ptr(),
                    std::ptr::null(),
                );
                if ret < 0 || ptr.is_null() {
                    return Err(MixError::InvalidStream("alloc mpegts context failed".into()));
                }

                let io_buf = ffi::av_malloc(AVIO_BUFFER) as *mut u8;
                let avio = ffi::avio_alloc_context(
                    io_buf,
                    AVIO_BUFFER as c_int,
                    1,
                    &mut *srt as *mut SrtIo as *mut c_void,
                    None,
                    Some(srt_write_packet),
                    None,
                );
                if avio.is_null() {
                    ffi::avformat_free_context(ptr);
                    return Err(MixError::InvalidStream("alloc avio context failed".into()));
                }
                (*ptr).pb = avio;
                (*ptr).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

                ffmpeg::format::context::Output::wrap(ptr)
            };

            Ok(TsMuxer {
                octx,
                _srt: Some(srt),
            })
        }
    }
}

fn writer_thread(
    url: String,
    transport: TsTransport,
    shared: Arc<MuxQueue>,
    ctx: OutputContext,
    init_tx: crossbeam_channel::Sender<Result<(), MixError>>,
) {
    // extradata must be attached before write_header; both encoders carry
    // global headers, so this resolves immediately once they exist
    let video_extra = ctx.video_extradata();
    let audio_extra = ctx.audio_extradata();
    if video_extra.is_empty() || audio_extra.is_empty() {
        let _ = init_tx.send(Err(MixError::InvalidStream(
            "encoder extradata unavailable before mux header".into(),
        )));
        return;
    }

    let mut muxer = match open_muxer(&url, transport) {
        Ok(m) => m,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    let mut streams =
        match unsafe { avmux::add_streams(&mut muxer.octx, &ctx, &video_extra, &audio_extra) } {
            Ok(s) => s,
            Err(e) => {
                let _ = init_tx.send(Err(e));
                return;
            }
        };

    if let Err(e) = muxer.octx.write_header() {
        let _ = init_tx.send(Err(MixError::InvalidStream(format!(
            "mpegts write_header: {e}"
        ))));
        return;
    }
    avmux::refresh_timebases(&muxer.octx, &mut streams);
    let _ = init_tx.send(Ok(()));
    log_info!("mpegts streaming to {url}");

    let mut first_media_sent = false;
    let mut failure: Option<MixError> = None;

    while let Some(packet) = shared.next_packet() {
        match avmux::write_packet(&mut muxer.octx, &streams, &packet) {
            WriteOutcome::Ok(n) => {
                shared.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
                if !first_media_sent {
                    first_media_sent = true;
                    ctx.signals.emit(OutputSignal::FirstMediaPacket);
                }
            }
            WriteOutcome::Skipped => {}
            WriteOutcome::Fatal(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if failure.is_none() {
        if let Err(e) = muxer.octx.write_trailer() {
            log_warn!("mpegts trailer write failed: {e}");
        }
    }

    match failure {
        Some(e) => ctx.signals.signal_stop(StopCode::from(&e), e.to_string()),
        None => ctx.signals.signal_stop(StopCode::Success, "stream stopped"),
    }
}
