//! Hashed timing wheel for per-topic timeouts.
//!
//! Sixty slots, one per second of a minute. A timeout of `p` seconds is
//! split into `p / 60` laps and `p % 60` seconds; the entry lands `p % 60`
//! slots ahead of the current position and carries the lap count. Each tick
//! advances the wheel one slot and visits it: entries with no laps left fire
//! (re-enqueued as [`WorkEntry::Timeout`]), the rest lose one lap.
//!
//! The wheel is owned by the engine thread and advanced only through
//! `TimerTick` entries, so it needs no locking. Rescheduling after a fired
//! timeout is the engine's job, which is what makes timers periodic.

use crate::queue::WorkQueue;
use crate::work::WorkEntry;

/// Number of wheel slots; one slot per second of a minute.
pub const WHEEL_SLOTS: u64 = 60;

/// A pending timeout parked in one slot of the wheel.
#[derive(Debug)]
struct TimeoutInfo {
    topic: String,
    period_seconds: u32,
    /// Full wheel revolutions remaining before this entry fires.
    iterations_left: u32,
}

/// The 60-slot wheel plus its monotonically increasing tick counter.
#[derive(Debug)]
pub struct TimeoutWheel {
    slots: Vec<Vec<TimeoutInfo>>,
    ticks: u64,
}

impl Default for TimeoutWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutWheel {
    /// Create an empty wheel at tick 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..WHEEL_SLOTS).map(|_| Vec::new()).collect(),
            ticks: 0,
        }
    }

    /// Total ticks the wheel has advanced.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Schedule a timeout for `topic` to fire in exactly `period_seconds`
    /// ticks. `period_seconds` must be at least 1.
    ///
    /// When the period is an exact multiple of 60 the insertion index equals
    /// the current index, i.e. the entry is parked in the slot about to lap
    /// itself; one lap is consumed by that placement, hence `minutes - 1`.
    pub fn add(&mut self, topic: &str, period_seconds: u32) {
        debug_assert!(period_seconds >= 1, "wheel periods start at one second");

        let minutes = period_seconds / 60;
        let seconds = period_seconds % 60;

        let cur = (self.ticks % WHEEL_SLOTS) as u32;
        let index = (u64::from(cur) + u64::from(seconds)) % WHEEL_SLOTS;
        let iterations_left = if seconds == 0 { minutes - 1 } else { minutes };

        self.slots[index as usize].push(TimeoutInfo {
            topic: topic.to_owned(),
            period_seconds,
            iterations_left,
        });
    }

    /// Advance one second and visit the new slot.
    ///
    /// Entries whose lap count reached zero are removed and emitted onto
    /// `queue` as [`WorkEntry::Timeout`], in insertion order; the remaining
    /// entries lose one lap. Slots other than the visited one are untouched.
    pub fn tick(&mut self, queue: &WorkQueue) {
        self.ticks += 1;
        let slot = &mut self.slots[(self.ticks % WHEEL_SLOTS) as usize];

        let mut i = 0;
        while i < slot.len() {
            if slot[i].iterations_left == 0 {
                let info = slot.remove(i);
                queue.push(WorkEntry::Timeout {
                    topic: info.topic,
                    period_seconds: info.period_seconds,
                });
            } else {
                slot[i].iterations_left -= 1;
                i += 1;
            }
        }
    }

    /// Log slot occupancy at debug level.
    pub fn dump_state(&self) {
        let mut out = String::new();
        for (i, slot) in self.slots.iter().enumerate() {
            out.push_str(&format!("{i}:{{"));
            for info in slot {
                out.push_str(&info.topic);
                out.push(',');
            }
            out.push_str("}, ");
        }
        log::debug!("[wheel] tick {}: {}", self.ticks, out);
    }

    /// Number of pending entries for `topic` across all slots.
    #[must_use]
    pub fn pending_for(&self, topic: &str) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|info| info.topic == topic)
            .count()
    }
}
