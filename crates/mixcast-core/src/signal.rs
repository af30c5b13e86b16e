// crates/mixcast-core/src/signal.rs
//
// Output lifecycle notifications, delivered over a caller-owned channel.
// The output framework guarantees Stop is sent exactly once per run, so
// the hub carries that latch instead of every backend re-implementing it.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;

use crate::error::StopCode;
use crate::log_debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSignal {
    /// Connect is in progress.
    Starting,
    /// The stream is live.
    Start,
    /// A stop was requested; draining may still be in progress.
    Stopping,
    /// Final word for the run. Sent exactly once.
    Stop { code: StopCode, msg: String },
    Activate,
    Deactivate,
    Connected,
    /// Connection lost; a reconnect attempt is scheduled.
    Reconnect,
    ReconnectSuccess,
    /// First media packet hit the wire.
    FirstMediaPacket,
}

/// Fans signals out to the embedder. Cloned freely across output threads.
pub struct SignalHub {
    tx: Sender<OutputSignal>,
    stop_sent: std::sync::Arc<AtomicBool>,
}

impl Clone for SignalHub {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            stop_sent: self.stop_sent.clone(),
        }
    }
}

impl SignalHub {
    pub fn new(tx: Sender<OutputSignal>) -> Self {
        Self {
            tx,
            stop_sent: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send a non-stop signal. A gone receiver is not an error — the
    /// embedder may simply not care about lifecycle events.
    pub fn emit(&self, signal: OutputSignal) {
        debug_assert!(!matches!(signal, OutputSignal::Stop { .. }), "use signal_stop");
        let _ = self.tx.send(signal);
    }

    /// Send the final Stop. Later calls for the same run are dropped.
    pub fn signal_stop(&self, code: StopCode, msg: impl Into<String>) {
        if self.stop_sent.swap(true, Ordering::SeqCst) {
            log_debug!("duplicate stop signal suppressed ({code:?})");
            return;
        }
        let _ = self.tx.send(OutputSignal::Stop {
            code,
            msg: msg.into(),
        });
    }

    /// Re-arm the stop latch for a fresh run of the same output.
    pub fn reset(&self) {
        self.stop_sent.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn stop_is_delivered_exactly_once() {
        let (tx, rx) = unbounded();
        let hub = SignalHub::new(tx);
        hub.signal_stop(StopCode::Success, "done");
        hub.signal_stop(StopCode::Disconnected, "late");
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], OutputSignal::Stop { code: StopCode::Success, .. }));
    }

    #[test]
    fn reset_rearms_the_latch() {
        let (tx, rx) = unbounded();
        let hub = SignalHub::new(tx);
        hub.signal_stop(StopCode::Success, "run 1");
        hub.reset();
        hub.signal_stop(StopCode::Success, "run 2");
        assert_eq!(rx.try_iter().count(), 2);
    }
}
