use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::domain::RangeFrame;

/// A published frame together with when it was published.
#[derive(Debug, Clone)]
pub struct StampedFrame {
    /// 1-based publish sequence number.
    pub seq: u64,
    pub published_at: Instant,
    pub frame: Arc<RangeFrame>,
}

impl StampedFrame {
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.published_at)
    }
}

/// Single-slot mailbox holding the most recent complete frame.
///
/// Newest wins: a publish replaces whatever is held, read or not. The lock
/// only ever guards a pointer swap, so neither side holds it across I/O.
#[derive(Debug, Default)]
pub struct SharedScanBuffer {
    slot: Mutex<Slot>,
}

#[derive(Debug, Default)]
struct Slot {
    seq: u64,
    latest: Option<StampedFrame>,
}

impl SharedScanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: RangeFrame) {
        let frame = Arc::new(frame);
        let mut slot = self.lock();
        slot.seq += 1;
        let seq = slot.seq;
        slot.latest = Some(StampedFrame { seq, published_at: Instant::now(), frame });
    }

    pub fn snapshot(&self) -> Option<Arc<RangeFrame>> {
        self.lock().latest.as_ref().map(|s| Arc::clone(&s.frame))
    }

    pub fn snapshot_stamped(&self) -> Option<StampedFrame> {
        self.lock().latest.clone()
    }

    /// Number of frames published so far.
    pub fn published_count(&self) -> u64 {
        self.lock().seq
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // slot writes are plain assignments, a poisoned lock still holds a whole frame
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
