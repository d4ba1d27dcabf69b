//! # Tide State Calculator
//!
//! Turns the discrete events in the [`EventStore`] into a continuous tide state.
//! Nothing is retained between calls: every call re-reads the bracketing pair, so
//! the direction flips by itself the moment `now` passes the next event.
//!
//! ## Algorithm
//! 1. Find the latest event at or before `now` and the earliest event after `now`
//! 2. Either one missing → [`TideReading::Unavailable`]
//! 3. Direction is [`Direction::Rising`] when the next event is a high tide
//! 4. `progress = (now - last) / (next - last)`, clamped to `[0.0, 1.0]`

use crate::event_store::EventStore;
use crate::{TideFlag, WaterLevelEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Whether the water is heading towards high or low tide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rising,
    Falling,
}

impl Direction {
    /// Direction implied by the upcoming event.
    pub fn towards(next: TideFlag) -> Self {
        match next {
            TideFlag::High => Direction::Rising,
            TideFlag::Low => Direction::Falling,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rising => write!(f, "rising"),
            Direction::Falling => write!(f, "falling"),
        }
    }
}

/// Tide state between two consecutive events.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TideState {
    pub direction: Direction,
    /// 0.0 at `last_event`, 1.0 at `next_event`
    pub progress: f64,
    pub last_event: WaterLevelEvent,
    pub next_event: WaterLevelEvent,
}

impl TideState {
    /// Build the state for `now` from a bracketing pair.
    ///
    /// Equal timestamps give `progress == 0.0`; a `now` outside the pair is clamped.
    pub fn between(last: WaterLevelEvent, next: WaterLevelEvent, now: DateTime<Utc>) -> Self {
        let total = (next.time - last.time).num_milliseconds();
        let progress = if total <= 0 {
            0.0
        } else {
            let elapsed = (now - last.time).num_milliseconds();
            (elapsed as f64 / total as f64).clamp(0.0, 1.0)
        };

        TideState {
            direction: Direction::towards(next.flag),
            progress,
            last_event: last,
            next_event: next,
        }
    }
}

/// Why no tide state could be produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Cache is empty (no marker or no events)
    NoData,
    /// Every cached event lies after `now`
    BeforeFirstEvent,
    /// Every cached event lies at or before `now`
    AfterLastEvent,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::NoData => write!(f, "No tide data available"),
            UnavailableReason::BeforeFirstEvent => write!(f, "No tide event cached before now"),
            UnavailableReason::AfterLastEvent => write!(f, "No tide event cached after now"),
        }
    }
}

/// Result of a calculator query. Never an error: missing data is a normal reading.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TideReading {
    Available(TideState),
    Unavailable { reason: UnavailableReason },
}

impl TideReading {
    pub fn state(&self) -> Option<&TideState> {
        match self {
            TideReading::Available(state) => Some(state),
            TideReading::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, TideReading::Available(_))
    }
}

/// Stateless view over the shared event store.
#[derive(Debug, Clone)]
pub struct TideCalculator {
    store: Arc<EventStore>,
}

impl TideCalculator {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    /// Tide reading for the current wall-clock time.
    pub fn current(&self) -> TideReading {
        self.at(Utc::now())
    }

    /// Tide reading for an arbitrary instant.
    pub fn at(&self, now: DateTime<Utc>) -> TideReading {
        if self.store.is_empty() {
            return TideReading::Unavailable {
                reason: UnavailableReason::NoData,
            };
        }

        let bracket = self.store.bracketing(now);
        match (bracket.last, bracket.next) {
            (Some(last), Some(next)) => TideReading::Available(TideState::between(last, next, now)),
            (None, Some(_)) => TideReading::Unavailable {
                reason: UnavailableReason::BeforeFirstEvent,
            },
            (Some(_), None) => TideReading::Unavailable {
                reason: UnavailableReason::AfterLastEvent,
            },
            // Store emptied between the two reads
            (None, None) => TideReading::Unavailable {
                reason: UnavailableReason::NoData,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Location;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn calculator_with(events: &[WaterLevelEvent]) -> TideCalculator {
        let store = Arc::new(EventStore::in_memory());
        store.insert(events, Location::new(59.9, 10.7)).unwrap();
        TideCalculator::new(store)
    }

    #[test]
    fn midpoint_towards_low_is_falling_half_way() {
        let calc = calculator_with(&[
            WaterLevelEvent::new(at(100), TideFlag::High),
            WaterLevelEvent::new(at(200), TideFlag::Low),
        ]);

        let state = *calc.at(at(150)).state().unwrap();
        assert_eq!(state.progress, 0.5);
        assert_eq!(state.direction, Direction::Falling);
        assert_eq!(state.last_event.time, at(100));
        assert_eq!(state.next_event.time, at(200));
    }

    #[test]
    fn rising_when_next_is_high() {
        let calc = calculator_with(&[
            WaterLevelEvent::new(at(0), TideFlag::Low),
            WaterLevelEvent::new(at(6 * 3600), TideFlag::High),
        ]);
        let state = *calc.at(at(3 * 3600)).state().unwrap();
        assert_eq!(state.direction, Direction::Rising);
    }

    #[test]
    fn outside_cached_range_is_unavailable() {
        let calc = calculator_with(&[
            WaterLevelEvent::new(at(100), TideFlag::High),
            WaterLevelEvent::new(at(200), TideFlag::Low),
        ]);

        assert_eq!(
            calc.at(at(50)),
            TideReading::Unavailable {
                reason: UnavailableReason::BeforeFirstEvent
            }
        );
        assert_eq!(
            calc.at(at(200)),
            TideReading::Unavailable {
                reason: UnavailableReason::AfterLastEvent
            }
        );
        assert_eq!(
            calc.at(at(500)),
            TideReading::Unavailable {
                reason: UnavailableReason::AfterLastEvent
            }
        );
    }

    #[test]
    fn empty_store_is_unavailable() {
        let calc = TideCalculator::new(Arc::new(EventStore::in_memory()));
        assert_eq!(
            calc.current(),
            TideReading::Unavailable {
                reason: UnavailableReason::NoData
            }
        );
    }

    #[test]
    fn direction_flips_at_event_boundary() {
        let calc = calculator_with(&[
            WaterLevelEvent::new(at(0), TideFlag::Low),
            WaterLevelEvent::new(at(100), TideFlag::High),
            WaterLevelEvent::new(at(200), TideFlag::Low),
        ]);

        let before = *calc.at(at(99)).state().unwrap();
        assert_eq!(before.direction, Direction::Rising);
        assert!(before.progress > 0.98);

        let on = *calc.at(at(100)).state().unwrap();
        assert_eq!(on.direction, Direction::Falling);
        assert_eq!(on.progress, 0.0);
        assert_eq!(on.last_event.flag, TideFlag::High);
    }

    #[test]
    fn progress_stays_in_bounds() {
        let last = WaterLevelEvent::new(at(1_000), TideFlag::Low);
        let next = WaterLevelEvent::new(at(1_000 + 22_357), TideFlag::High);

        let mut now = last.time;
        while now < next.time {
            let state = TideState::between(last, next, now);
            assert!(
                (0.0..=1.0).contains(&state.progress),
                "progress {} out of bounds at {now}",
                state.progress
            );
            now += Duration::seconds(97);
        }

        // Skewed clocks are clamped rather than extrapolated
        assert_eq!(TideState::between(last, next, at(0)).progress, 0.0);
        assert_eq!(TideState::between(last, next, at(100_000)).progress, 1.0);
    }

    #[test]
    fn direction_follows_next_flag() {
        for (last_flag, next_flag) in [
            (TideFlag::Low, TideFlag::High),
            (TideFlag::High, TideFlag::Low),
            (TideFlag::High, TideFlag::High),
            (TideFlag::Low, TideFlag::Low),
        ] {
            let state = TideState::between(
                WaterLevelEvent::new(at(0), last_flag),
                WaterLevelEvent::new(at(100), next_flag),
                at(50),
            );
            assert_eq!(
                state.direction == Direction::Rising,
                next_flag == TideFlag::High
            );
        }
    }

    #[test]
    fn equal_timestamps_do_not_divide_by_zero() {
        let e = WaterLevelEvent::new(at(100), TideFlag::High);
        let state = TideState::between(e, e, at(100));
        assert_eq!(state.progress, 0.0);
    }
}
