//! # Tide Light Core Library
//!
//! This library holds the tide data engine behind the tide light: a local cache of
//! high/low tide events for a single location, a background scheduler that keeps the
//! cache fresh, and a calculator that turns the discrete events into a continuous
//! "where are we between low and high tide" signal.
//!
//! ## Data Flow
//!
//! 1. **Configure**: the [`bridge::ConfigBridge`] reports the configured location and
//!    announces changes to it
//! 2. **Fetch**: the [`scheduler`] asks a [`tide_data::TideFetcher`] for events in a
//!    bounded window
//! 3. **Cache**: results are reconciled into the [`event_store::EventStore`]
//! 4. **Display**: the render loop asks the [`calculator::TideCalculator`] for the
//!    current [`calculator::TideReading`] several times per second
//!
//! ## Core Types
//!
//! - [`Location`]: latitude/longitude of the cached tide station
//! - [`TideFlag`]: whether an event is a high or a low tide
//! - [`WaterLevelEvent`]: a single tide event, unique by its timestamp

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod bridge;
pub mod calculator;
pub mod config;
pub mod event_store;
pub mod renderer;
pub mod scheduler;
pub mod status;
pub mod tide_data;

#[cfg(test)]
mod tests;

/// Geographic position the cached tide events belong to.
///
/// Compared with exact float equality: a location "changes" whenever the configured
/// coordinates differ in any way from the cached ones.
///
/// # Example
/// ```
/// use tide_light_lib::Location;
///
/// let oslo = Location::new(59.9, 10.7);
/// assert_eq!(oslo.to_string(), "(59.9, 10.7)");
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

/// Kind of tide event. Serialized as `"high"` / `"low"`, the same spelling the
/// tide API uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TideFlag {
    High,
    Low,
}

impl fmt::Display for TideFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TideFlag::High => write!(f, "high"),
            TideFlag::Low => write!(f, "low"),
        }
    }
}

/// A single high or low tide occurrence.
///
/// Times are kept at second precision; [`WaterLevelEvent::new`] drops any
/// sub-second part so that two fetches reporting the same event always collide on
/// the same key in the store.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use tide_light_lib::{TideFlag, WaterLevelEvent};
///
/// let t = Utc.with_ymd_and_hms(2025, 7, 24, 5, 12, 0).unwrap();
/// let event = WaterLevelEvent::new(t, TideFlag::High);
/// assert_eq!(event.flag, TideFlag::High);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaterLevelEvent {
    pub time: DateTime<Utc>,
    pub flag: TideFlag,
}

impl WaterLevelEvent {
    pub fn new(time: DateTime<Utc>, flag: TideFlag) -> Self {
        Self {
            time: truncate_to_second(time),
            flag,
        }
    }
}

/// Drop the sub-second part of a timestamp.
pub(crate) fn truncate_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}
