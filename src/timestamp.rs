//! Unique Monotonic Timestamp Issuance
//!
//! Every live event gets its timestamp from one `TimestampAssigner`. The
//! assigner follows the wall clock at millisecond resolution and, when
//! several events land in the same millisecond (or the clock stalls or
//! steps backwards), hands out microsecond sub-ticks inside that
//! millisecond. After `SUB_TICK_RESOLUTION` sub-ticks it borrows the next
//! millisecond, so values stay pairwise distinct and non-decreasing.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

/// Highest sub-tick value before rolling into the next millisecond
pub const SUB_TICK_RESOLUTION: u32 = 999;

/// Millisecond wall-clock source
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

#[derive(Debug, Clone, Copy)]
struct AssignerState {
    last_millis: i64,
    sub_tick: u32,
    issued: u64,
}

impl AssignerState {
    const fn new() -> Self {
        Self {
            last_millis: i64::MIN,
            sub_tick: 0,
            issued: 0,
        }
    }

    fn advance(&mut self, now_millis: i64) -> DateTime<Utc> {
        if now_millis > self.last_millis {
            self.last_millis = now_millis;
            self.sub_tick = 0;
        } else {
            self.sub_tick += 1;
            if self.sub_tick > SUB_TICK_RESOLUTION {
                self.last_millis += 1;
                self.sub_tick = 0;
            }
        }
        self.issued += 1;

        let micros = self
            .last_millis
            .saturating_mul(1_000)
            .saturating_add(self.sub_tick as i64);
        DateTime::from_timestamp_micros(micros).unwrap_or_default()
    }
}

/// Issues globally unique, non-decreasing timestamps.
///
/// Constructed once by the owner (usually `GenerationManager`) and shared
/// behind an `Arc`. All access goes through one mutex, which is the only
/// critical section in the timing core.
pub struct TimestampAssigner {
    state: Mutex<AssignerState>,
    clock: Clock,
}

impl TimestampAssigner {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Build an assigner driven by a custom millisecond clock
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            state: Mutex::new(AssignerState::new()),
            clock,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, AssignerState> {
        // The state is plain data; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue the next timestamp
    pub fn issue(&self) -> DateTime<Utc> {
        let now = (self.clock)();
        self.lock().advance(now)
    }

    /// Issue `count` consecutive timestamps under a single lock acquisition.
    ///
    /// Used by the batch coordinator so a whole tick's worth of events gets
    /// a contiguous range before work fans out to worker threads.
    pub fn reserve(&self, count: usize) -> Vec<DateTime<Utc>> {
        let mut stamps = Vec::with_capacity(count);
        let mut state = self.lock();
        for _ in 0..count {
            let now = (self.clock)();
            stamps.push(state.advance(now));
        }
        stamps
    }

    /// Total timestamps issued since construction or the last reset
    pub fn issued(&self) -> u64 {
        self.lock().issued
    }

    /// Forget all issued state. Intended for test harnesses only.
    pub fn reset(&self) {
        *self.lock() = AssignerState::new();
    }
}

impl Default for TimestampAssigner {
    fn default() -> Self {
        Self::new()
    }
}
