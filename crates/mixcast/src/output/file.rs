// crates/mixcast/src/output/file.rs
//
// Local container recording: the endpoint's extension picks the muxer
// (mp4, flv, ts, …) and libavformat writes the file. Same writer-thread
// shape as the MPEG-TS backend, minus transports; a full disk maps to
// NoSpace.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use ffmpeg_the_third as ffmpeg;

use mixcast_core::packet::EncoderPacket;
use mixcast_core::signal::OutputSignal;
use mixcast_core::{log_info, log_warn, MixError, StopCode};

use super::avmux::{self, MuxQueue, WriteOutcome};
use super::{OutputBackend, OutputContext};

pub struct FileOutput {
    path: PathBuf,
    max_shutdown_sec: u64,
    shared: Arc<MuxQueue>,
    writer: Option<JoinHandle<()>>,
}

impl FileOutput {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_shutdown_sec: 30,
            shared: MuxQueue::new(),
            writer: None,
        }
    }
}

impl OutputBackend for FileOutput {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&mut self, ctx: &OutputContext) -> Result<(), MixError> {
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let path = self.path.clone();
        let shared = Arc::clone(&self.shared);
        let ctx = ctx.clone();

        self.writer = Some(
            std::thread::Builder::new()
                .name("mixcast-file-write".into())
                .spawn(move || writer_thread(path, shared, ctx, init_tx))
                .map_err(|e| MixError::ConnectFailed(format!("spawn file writer: {e}")))?,
        );

        match init_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(MixError::ConnectFailed("file writer died during bring-up".into())),
        }
    }

    fn encoded_packet(&mut self, packet: EncoderPacket, _ctx: &OutputContext) {
        self.shared.push(packet);
    }

    fn stop(&mut self, ts_usec: u64, _ctx: &OutputContext) {
        self.shared.request_stop(ts_usec, self.max_shutdown_sec);
        // the trailer must be written before stop is reported, so join on
        // both immediate and graceful stops
        if let Some(t) = self.writer.take() {
            let _ = t.join();
        }
    }

    fn total_bytes(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }
}

fn writer_thread(
    path: PathBuf,
    shared: Arc<MuxQueue>,
    ctx: OutputContext,
    init_tx: crossbeam_channel::Sender<Result<(), MixError>>,
) {
    let video_extra = ctx.video_extradata();
    let audio_extra = ctx.audio_extradata();
    if video_extra.is_empty() || audio_extra.is_empty() {
        let _ = init_tx.send(Err(MixError::InvalidStream(
            "encoder extradata unavailable before mux header".into(),
        )));
        return;
    }

    let mut octx = match ffmpeg::format::output(&path) {
        Ok(o) => o,
        Err(e) => {
            let _ = init_tx.send(Err(MixError::BadPath(format!(
                "open '{}': {e}",
                path.display()
            ))));
            return;
        }
    };

    let mut streams =
        match unsafe { avmux::add_streams(&mut octx, &ctx, &video_extra, &audio_extra) } {
            Ok(s) => s,
            Err(e) => {
                let _ = init_tx.send(Err(e));
                return;
            }
        };

    if let Err(e) = octx.write_header() {
        let _ = init_tx.send(Err(MixError::InvalidStream(format!(
            "file write_header: {e}"
        ))));
        return;
    }
    avmux::refresh_timebases(&octx, &mut streams);
    let _ = init_tx.send(Ok(()));
    log_info!("recording to {}", path.display());

    let mut first_media_sent = false;
    let mut failure: Option<MixError> = None;

    while let Some(packet) = shared.next_packet() {
        match avmux::write_packet(&mut octx, &streams, &packet) {
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
        if let Err(e) = octx.write_trailer() {
            log_warn!("file trailer write failed: {e}");
        }
    }

    match failure {
        Some(e) => ctx.signals.signal_stop(StopCode::from(&e), e.to_string()),
        None => ctx.signals.signal_stop(StopCode::Success, "recording finished"),
    }
}
