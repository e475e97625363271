//! Action id generation
//!
//! Ids combine wall-clock milliseconds with a logical counter, the same way a
//! hybrid logical clock does, plus a random suffix:
//!
//! ```text
//! 1760601600123-000002-9f3a61c0
//! └ physical ms ┘└logical┘└ random ┘
//! ```
//!
//! Both numeric parts are zero-padded, so the lexical order of ids equals
//! their creation order, and the physical part is the action's `createdAt`.
//! If the wall clock stalls or steps backwards the logical counter keeps ids
//! strictly increasing.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

const LOGICAL_MAX: u32 = 999_999;

/// Current time truncated to millisecond precision, the resolution everything
/// is persisted with.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Unique, creation-ordered identifier of a pending action.
///
/// Also sent as the `Idempotency-Key` of every API call made for the action.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    fn from_parts(physical: i64, logical: u32, suffix: u32) -> Self {
        Self(format!("{physical:013}-{logical:06}-{suffix:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Physical and logical components, if the id has the generated shape.
    fn parts(&self) -> Option<(i64, u32)> {
        let mut split = self.0.splitn(3, '-');
        let physical = split.next()?.parse().ok()?;
        let logical = split.next()?.parse().ok()?;
        Some((physical, logical))
    }

    /// Creation time encoded in the id.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.parts().map(|(physical, _)| physical)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Default)]
struct ClockState {
    physical: i64,
    logical: u32,
}

/// Generates strictly increasing [`ActionId`]s for a single client.
#[derive(Debug, Default)]
pub struct ActionIdGenerator {
    state: Mutex<ClockState>,
}

impl ActionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id and its creation time.
    pub fn next_id(&self) -> (ActionId, DateTime<Utc>) {
        let now = now_millis();
        let (id, physical) = self.next_at(now.timestamp_millis());
        let created_at = DateTime::from_timestamp_millis(physical).unwrap_or(now);
        (id, created_at)
    }

    /// Next id for a given wall-clock reading. Returns the id and the physical
    /// time it encodes, which never decreases between calls.
    pub fn next_at(&self, wall_ms: i64) -> (ActionId, i64) {
        let mut state = self.state.lock();

        if wall_ms > state.physical {
            state.physical = wall_ms;
            state.logical = 0;
        } else if state.logical >= LOGICAL_MAX {
            state.physical = state.physical.saturating_add(1);
            state.logical = 0;
        } else {
            state.logical += 1;
        }

        let suffix: u32 = rand::thread_rng().gen();
        (
            ActionId::from_parts(state.physical, state.logical, suffix),
            state.physical,
        )
    }

    /// Fast-forwards the clock past an id produced earlier, e.g. one loaded
    /// from the persisted queue after a restart.
    pub fn observe(&self, id: &ActionId) {
        let Some((physical, logical)) = id.parts() else {
            return;
        };
        let mut state = self.state.lock();
        if (physical, logical) > (state.physical, state.logical) {
            state.physical = physical;
            state.logical = logical;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let generator = ActionIdGenerator::new();
        let mut previous: Option<(ActionId, DateTime<Utc>)> = None;
        for _ in 0..1_000 {
            let (id, created_at) = generator.next_id();
            if let Some((prev_id, prev_at)) = &previous {
                assert!(id > *prev_id, "{id} should sort after {prev_id}");
                assert!(created_at >= *prev_at);
            }
            previous = Some((id, created_at));
        }
    }

    #[test]
    fn test_same_millisecond_uses_logical_counter() {
        let generator = ActionIdGenerator::new();
        let (a, pa) = generator.next_at(1_760_000_000_000);
        let (b, pb) = generator.next_at(1_760_000_000_000);
        assert_eq!(pa, pb);
        assert!(b > a);
        assert!(b.as_str().starts_with("1760000000000-000001-"));
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let generator = ActionIdGenerator::new();
        let (a, pa) = generator.next_at(1_760_000_000_500);
        let (b, pb) = generator.next_at(1_760_000_000_100);
        assert!(b > a);
        assert_eq!(pb, pa);
    }

    #[test]
    fn test_observe_fast_forwards() {
        let seen = ActionIdGenerator::new();
        let (persisted, _) = seen.next_at(1_900_000_000_000);

        let fresh = ActionIdGenerator::new();
        fresh.observe(&persisted);
        let (next, _) = fresh.next_at(1_800_000_000_000);
        assert!(next > persisted);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let generator = ActionIdGenerator::new();
        let (id, created_at) = generator.next_id();
        assert_eq!(id.timestamp_ms(), Some(created_at.timestamp_millis()));
        assert_eq!(ActionId::from("garbage").timestamp_ms(), None);
    }
}
