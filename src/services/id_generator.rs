use std::sync::atomic::{AtomicU32, Ordering};

/// Low bits reserved for the per-millisecond counter.
const COUNTER_BITS: u32 = 10;
const COUNTER_MASK: i64 = (1 << COUNTER_BITS) - 1;

/// Ids below this value are reserved by terminal firmware for built-in messages.
pub const MIN_COMMAND_ID: i32 = 100_000;

/// Number of distinct ids in `MIN_COMMAND_ID..=i32::MAX`.
const ID_SPACE: i64 = i32::MAX as i64 - MIN_COMMAND_ID as i64 + 1;

/// Time-ordered 32-bit command ids.
///
/// A millisecond timestamp is shifted left by `COUNTER_BITS` and combined with a
/// wrapping atomic counter, then folded into `MIN_COMMAND_ID..=i32::MAX`. Ids
/// issued within the same millisecond are strictly increasing until either the
/// counter or the id space wraps.
#[derive(Debug, Default)]
pub struct IdentityGenerator {
    counter: AtomicU32,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    pub fn next_id(&self) -> i32 {
        let millis = chrono::Utc::now().timestamp_millis();
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        compose_id(millis, count)
    }
}

fn compose_id(millis: i64, count: u32) -> i32 {
    let raw = (millis << COUNTER_BITS) | (count as i64 & COUNTER_MASK);
    (raw.rem_euclid(ID_SPACE) + MIN_COMMAND_ID as i64) as i32
}
