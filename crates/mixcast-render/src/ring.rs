// crates/mixcast-render/src/ring.rs
//
// The video frame ring: single writer (the compositor), many readers.
//
// Slots hold Arc<VideoFrame>. A slot is reusable when no reader still
// holds its Arc; lock_frame returns None when every slot is pinned, which
// is the writer's back-pressure signal (it accounts a lagged frame and
// skips publishing — it never blocks on a reader).
//
// Readers are bounded channels fed with try_send: a subscriber that stops
// draining loses frames, the writer keeps real-time cadence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use mixcast_core::frame::VideoFrame;
use mixcast_core::log_debug;

/// Distinct GPU textures the encode queue may reference at once.
pub const MAX_GPU_QUEUE: usize = 5;

struct RingState {
    slots: Vec<Option<Arc<VideoFrame>>>,
    write_idx: usize,
    /// Logical frame counter; lock_frame advances it by the pacer count.
    logical_frame: u64,
}

struct RingSubscriber {
    tx: Sender<Arc<VideoFrame>>,
}

pub struct VideoRing {
    state: Mutex<RingState>,
    subscribers: Mutex<Vec<RingSubscriber>>,
    total_frames: AtomicU64,
    lagged_frames: AtomicU64,
    dropped_deliveries: AtomicU64,
    texture_subscribers: AtomicUsize,
}

/// A reserved slot being filled by the writer.
pub struct FrameSlot {
    pub frame: VideoFrame,
    slot_idx: usize,
}

impl VideoRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                slots: (0..capacity.max(2)).map(|_| None).collect(),
                write_idx: 0,
                logical_frame: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            total_frames: AtomicU64::new(0),
            lagged_frames: AtomicU64::new(0),
            dropped_deliveries: AtomicU64::new(0),
            texture_subscribers: AtomicUsize::new(0),
        }
    }

    /// Reserve a slot for the frame at logical time `ts`, advancing the
    /// frame clock by `count` intervals. Returns None when all slots are
    /// pinned by readers.
    pub fn lock_frame(
        &self,
        count: u64,
        ts: u64,
        alloc: impl FnOnce() -> VideoFrame,
    ) -> Option<FrameSlot> {
        let mut state = self.state.lock();
        state.logical_frame += count;
        if count > 1 {
            self.lagged_frames.fetch_add(count - 1, Ordering::Relaxed);
        }

        let capacity = state.slots.len();
        let start = state.write_idx;
        for probe in 0..capacity {
            let idx = (start + probe) % capacity;
            let reusable = match &state.slots[idx] {
                None => true,
                Some(arc) => Arc::strong_count(arc) == 1,
            };
            if !reusable {
                continue;
            }

            // recycle the allocation when we are the sole owner
            let mut frame = match state.slots[idx].take() {
                Some(arc) => Arc::try_unwrap(arc).unwrap_or_else(|_| alloc()),
                None => alloc(),
            };
            frame.timestamp_ns = ts;
            state.write_idx = (idx + 1) % capacity;
            return Some(FrameSlot {
                frame,
                slot_idx: idx,
            });
        }

        self.lagged_frames.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Publish a filled slot to every subscriber.
    pub fn unlock_frame(&self, slot: FrameSlot) {
        let frame = Arc::new(slot.frame);
        {
            let mut state = self.state.lock();
            state.slots[slot.slot_idx] = Some(Arc::clone(&frame));
        }
        self.total_frames.fetch_add(1, Ordering::Relaxed);

        let mut subs = self.subscribers.lock();
        subs.retain(|sub| match sub.tx.try_send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    /// Add a raw-frame subscriber. The channel holds a handful of frames;
    /// a reader that falls behind loses frames rather than stalling the
    /// compositor.
    pub fn connect(&self) -> Receiver<Arc<VideoFrame>> {
        let (tx, rx) = bounded(4);
        self.subscribers.lock().push(RingSubscriber { tx });
        rx
    }

    pub fn logical_frame(&self) -> u64 {
        self.state.lock().logical_frame
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Relaxed)
    }

    pub fn lagged_frames(&self) -> u64 {
        self.lagged_frames.load(Ordering::Relaxed)
    }

    pub fn add_texture_subscriber(&self) {
        self.texture_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_texture_subscriber(&self) {
        self.texture_subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn has_texture_subscribers(&self) -> bool {
        self.texture_subscribers.load(Ordering::Relaxed) > 0
    }
}

// ── GPU encode queue ──────────────────────────────────────────────────────────

/// Timestamped references to output textures for texture-taking encoders.
/// Bounded at MAX_GPU_QUEUE distinct textures; when full, the new frame's
/// texture is skipped and the oldest queued slot is referenced again
/// under the new timestamp — the consumer encodes a duplicate frame, the
/// timeline never gaps.
pub struct GpuEncodeQueue {
    state: Mutex<GpuQueueState>,
    ready: Condvar,
}

struct GpuQueueState {
    entries: VecDeque<(u64, usize)>,
    skipped: u64,
    closed: bool,
}

impl Default for GpuEncodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuEncodeQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GpuQueueState {
                entries: VecDeque::new(),
                skipped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Writer side: enqueue `(timestamp, texture slot)`.
    pub fn push(&self, timestamp_ns: u64, slot: usize) {
        let mut state = self.state.lock();
        let slot = if state.entries.len() >= MAX_GPU_QUEUE {
            // full: do not admit another distinct texture — re-reference
            // the oldest queued slot so this timestamp still reaches the
            // consumer (as a duplicate of content it already holds)
            state.skipped += 1;
            let (_, oldest_slot) = *state.entries.front().expect("queue is full");
            log_debug!("gpu encode queue full, duplicating slot {oldest_slot} at {timestamp_ns}");
            oldest_slot
        } else {
            slot
        };
        state.entries.push_back((timestamp_ns, slot));
        self.ready.notify_one();
    }

    /// Consumer side: block until an entry or close.
    pub fn pop_blocking(&self) -> Option<(u64, usize)> {
        let mut state = self.state.lock();
        loop {
            if let Some(entry) = state.entries.pop_front() {
                return Some(entry);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    pub fn skipped(&self) -> u64 {
        self.state.lock().skipped
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixcast_core::frame::PixelFormat;

    fn alloc() -> VideoFrame {
        VideoFrame::alloc(2, 2, PixelFormat::I420)
    }

    #[test]
    fn writer_reuses_free_slots() {
        let ring = VideoRing::new(3);
        for i in 0..10u64 {
            let slot = ring.lock_frame(1, i * 33, alloc).expect("slot free");
            ring.unlock_frame(slot);
        }
        assert_eq!(ring.total_frames(), 10);
        assert_eq!(ring.lagged_frames(), 0);
    }

    #[test]
    fn pinned_slots_backpressure_the_writer() {
        let ring = VideoRing::new(2);
        let rx = ring.connect();

        let mut held = Vec::new();
        let s1 = ring.lock_frame(1, 0, alloc).unwrap();
        ring.unlock_frame(s1);
        held.push(rx.recv().unwrap());
        let s2 = ring.lock_frame(1, 33, alloc).unwrap();
        ring.unlock_frame(s2);
        held.push(rx.recv().unwrap());

        // both slots pinned by the reader
        assert!(ring.lock_frame(1, 66, alloc).is_none());
        assert_eq!(ring.lagged_frames(), 1);

        drop(held);
        assert!(ring.lock_frame(1, 99, alloc).is_some());
    }

    #[test]
    fn lag_count_accumulates_from_pacer() {
        let ring = VideoRing::new(2);
        let slot = ring.lock_frame(3, 100, alloc).unwrap();
        ring.unlock_frame(slot);
        assert_eq!(ring.lagged_frames(), 2);
        assert_eq!(ring.logical_frame(), 3);
    }

    #[test]
    fn subscriber_overflow_drops_frames_not_writer() {
        let ring = VideoRing::new(8);
        let rx = ring.connect();
        for i in 0..10u64 {
            let slot = ring.lock_frame(1, i, alloc).unwrap();
            ring.unlock_frame(slot);
        }
        // channel holds 4; the writer never stalled
        assert_eq!(ring.total_frames(), 10);
        assert!(rx.try_iter().count() <= 4);
    }

    #[test]
    fn gpu_queue_accounts_skips_without_dropping_timestamps() {
        let q = GpuEncodeQueue::new();
        for i in 0..(MAX_GPU_QUEUE as u64 + 3) {
            q.push(i, i as usize % 2);
        }
        assert_eq!(q.skipped(), 3);
        // every pushed timestamp is still delivered, overflow included
        let mut popped = 0;
        q.close();
        while q.pop_blocking().is_some() {
            popped += 1;
        }
        assert_eq!(popped, MAX_GPU_QUEUE + 3);
    }

    #[test]
    fn gpu_queue_full_redelivers_oldest_slot_at_new_timestamp() {
        let q = GpuEncodeQueue::new();
        for i in 0..MAX_GPU_QUEUE as u64 {
            q.push(i * 33, i as usize);
        }
        // full: the new frame's texture (slot 7) must not be admitted;
        // the oldest queued slot carries the new timestamp instead
        q.push(999, 7);
        assert_eq!(q.skipped(), 1);

        q.close();
        let mut entries = Vec::new();
        while let Some(e) = q.pop_blocking() {
            entries.push(e);
        }
        assert_eq!(entries.len(), MAX_GPU_QUEUE + 1);
        assert_eq!(*entries.last().unwrap(), (999, 0));
        assert!(entries.iter().all(|&(_, slot)| slot != 7));
        // queue order itself is untouched: original timestamps first
        assert_eq!(entries[0], (0, 0));
        assert_eq!(entries[MAX_GPU_QUEUE - 1], ((MAX_GPU_QUEUE as u64 - 1) * 33, MAX_GPU_QUEUE - 1));
    }
}
