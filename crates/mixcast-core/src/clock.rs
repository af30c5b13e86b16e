// crates/mixcast-core/src/clock.rs
//
// Monotonic clock, frame-interval pacing, and timebase rescale helpers.
//
// Every timestamp in mixcast is nanoseconds on one process-wide monotonic
// clock, anchored at the first call to now_ns(). Packet timestamps leave
// this domain only at the encoder boundary, where they become integer
// ticks of the encoder timebase; rescale_ts / packet_dts_usec convert
// between the two without overflowing on long-running streams.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Nanoseconds since the first call in this process. Monotonic.
pub fn now_ns() -> u64 {
    anchor().elapsed().as_nanos() as u64
}

/// Microseconds since the first call in this process.
pub fn now_usec() -> i64 {
    (now_ns() / 1_000) as i64
}

/// Sleep until the absolute tick `target_ns` on the process clock.
///
/// Returns false (without sleeping) when the deadline has already passed —
/// the caller is lagging and must account for the missed interval(s).
pub fn sleep_to_ns(target_ns: u64) -> bool {
    let now = now_ns();
    if target_ns <= now {
        return false;
    }
    std::thread::sleep(Duration::from_nanos(target_ns - now));
    true
}

/// Duration of one output frame in nanoseconds: `1e9 * den / num`.
///
/// ```
/// use mixcast_core::clock::frame_interval_ns;
/// assert_eq!(frame_interval_ns(30, 1), 33_333_333);
/// assert_eq!(frame_interval_ns(30000, 1001), 33_366_666);
/// ```
pub fn frame_interval_ns(fps_num: u32, fps_den: u32) -> u64 {
    1_000_000_000u64 * fps_den as u64 / fps_num as u64
}

/// Rescale `val` ticks of `1/den` into units of `num` without overflow.
///
/// The intermediate product can exceed 64 bits on long streams, so the
/// multiply runs in i128 (the original carried a hand-rolled uint128 for
/// exactly this).
pub fn rescale_ts(val: i64, num: i64, den: i64) -> i64 {
    if den == 0 {
        return 0;
    }
    (val as i128 * num as i128 / den as i128) as i64
}

/// A packet timestamp in microseconds: `dts * 1e6 * tb_num / tb_den`.
///
/// ```
/// use mixcast_core::clock::packet_dts_usec;
/// // frame 3 at 30 fps → 100 ms
/// assert_eq!(packet_dts_usec(3, 1, 30), 100_000);
/// // sample 48000 at 48 kHz → one second
/// assert_eq!(packet_dts_usec(48_000, 1, 48_000), 1_000_000);
/// ```
pub fn packet_dts_usec(dts: i64, tb_num: u32, tb_den: u32) -> i64 {
    rescale_ts(dts, 1_000_000 * tb_num as i64, tb_den as i64)
}

/// Same rescale into milliseconds — FLV tag timestamps live in ms.
pub fn packet_ms_time(val: i64, tb_num: u32, tb_den: u32) -> i64 {
    rescale_ts(val, 1_000 * tb_num as i64, tb_den as i64)
}

// ── Frame pacing ──────────────────────────────────────────────────────────────

/// Outcome of one pacing step: how many frame intervals elapsed since the
/// previous step. `count > 1` means `count - 1` frames were lagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// Frame clock for this tick (start of the interval), ns.
    pub frame_time_ns: u64,
    /// Intervals consumed; 1 in the steady state.
    pub count: u64,
}

/// Paces the render loop at a fixed frame interval.
///
/// In the steady state `wait()` sleeps to the next frame boundary and
/// returns `count == 1`. Under overload it does not sleep; it advances the
/// frame clock by however many whole intervals were missed so published
/// frame timestamps stay monotone and on-grid.
pub struct FramePacer {
    interval_ns: u64,
    last_ns: u64,
}

impl FramePacer {
    pub fn new(fps_num: u32, fps_den: u32) -> Self {
        Self {
            interval_ns: frame_interval_ns(fps_num, fps_den),
            last_ns: now_ns(),
        }
    }

    pub fn interval_ns(&self) -> u64 {
        self.interval_ns
    }

    /// Frame clock of the most recent tick.
    pub fn frame_time_ns(&self) -> u64 {
        self.last_ns
    }

    /// Block until the next frame boundary and advance the frame clock.
    pub fn wait(&mut self) -> FrameTick {
        let target = self.last_ns + self.interval_ns;
        let count = if sleep_to_ns(target) {
            1
        } else {
            missed_intervals(now_ns(), self.last_ns, self.interval_ns)
        };
        self.last_ns += self.interval_ns * count;
        FrameTick {
            frame_time_ns: self.last_ns,
            count,
        }
    }
}

/// Whole frame intervals elapsed between `last` and `now`, at least 1.
///
/// ```
/// use mixcast_core::clock::missed_intervals;
/// assert_eq!(missed_intervals(133, 100, 33), 1);
/// assert_eq!(missed_intervals(200, 100, 33), 3);
/// ```
pub fn missed_intervals(now_ns: u64, last_ns: u64, interval_ns: u64) -> u64 {
    if now_ns <= last_ns {
        return 1;
    }
    ((now_ns - last_ns) / interval_ns).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn interval_grid_is_exact_for_integer_rates() {
        // Property: the frame clock advances by exactly 1e9 * den / num
        // between consecutive ticks in the absence of overload.
        let interval = frame_interval_ns(60, 1);
        assert_eq!(interval, 16_666_666);
        let mut t = 0u64;
        for _ in 0..600 {
            t += interval;
        }
        assert_eq!(t, 600 * interval);
    }

    #[test]
    fn rescale_survives_large_values() {
        // ~28 hours of 90 kHz ticks * 1e6 would overflow i64 naively.
        let dts = 9_000_000_000i64;
        assert_eq!(packet_dts_usec(dts, 1, 90_000), 100_000_000_000);
    }

    #[test]
    fn lag_accounting_counts_whole_intervals() {
        assert_eq!(missed_intervals(1_000, 0, 333), 3);
        assert_eq!(missed_intervals(332, 0, 333), 1);
        // clock went backwards or equal: still one frame
        assert_eq!(missed_intervals(5, 5, 333), 1);
    }

    #[test]
    fn pacer_produces_on_grid_timestamps() {
        let mut pacer = FramePacer::new(1000, 1); // 1 ms frames — fast test
        let start = pacer.frame_time_ns();
        let mut total = 0;
        for _ in 0..5 {
            total += pacer.wait().count;
        }
        let elapsed = pacer.frame_time_ns() - start;
        assert_eq!(elapsed, total * pacer.interval_ns());
    }
}
