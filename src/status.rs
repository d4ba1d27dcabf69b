//! Read-only status snapshot for external reporting.
//!
//! Combines the calculator's reading with the cache's own view. The transport
//! (BLE characteristic, log line, ...) is up to the caller; [`StatusReporter::spawn`]
//! logs the JSON form periodically.

use crate::calculator::{Direction, TideCalculator, TideReading};
use crate::event_store::EventStore;
use crate::{Location, WaterLevelEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_event: Option<WaterLevelEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<WaterLevelEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub cache_has_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_location: Option<Location>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusReporter {
    calculator: TideCalculator,
    store: Arc<EventStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            calculator: TideCalculator::new(store.clone()),
            store,
        }
    }

    pub fn snapshot(&self) -> StatusReport {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> StatusReport {
        let cache_has_data = !self.store.is_empty();
        let cache_location = self.store.current_location();

        match self.calculator.at(now) {
            TideReading::Available(state) => StatusReport {
                available: true,
                direction: Some(state.direction),
                progress: Some((state.progress * 1000.0).round() / 1000.0),
                next_event: Some(state.next_event),
                last_event: Some(state.last_event),
                reason: None,
                cache_has_data,
                cache_location,
                generated_at: now,
            },
            TideReading::Unavailable { reason } => StatusReport {
                available: false,
                direction: None,
                progress: None,
                next_event: None,
                last_event: None,
                reason: Some(reason.to_string()),
                cache_has_data,
                cache_location,
                generated_at: now,
            },
        }
    }

    /// Log a JSON status report every `period`.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match serde_json::to_string(&self.snapshot()) {
                    Ok(json) => info!(target: "tide_light::status", status = %json, "status"),
                    Err(e) => warn!(error = %e, "could not encode status"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TideFlag;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn empty_cache_reports_reason() {
        let reporter = StatusReporter::new(Arc::new(EventStore::in_memory()));
        let report = reporter.snapshot_at(at(1_000));

        assert!(!report.available);
        assert!(!report.cache_has_data);
        assert_eq!(report.cache_location, None);
        assert_eq!(report.reason.as_deref(), Some("No tide data available"));

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["available"], json!(false));
        assert_eq!(value["cacheHasData"], json!(false));
        assert!(value.get("direction").is_none());
        assert!(value.get("cacheLocation").is_none());
    }

    #[test]
    fn available_report_carries_state() {
        let store = Arc::new(EventStore::in_memory());
        let oslo = Location::new(59.9, 10.7);
        store
            .insert(
                &[
                    WaterLevelEvent::new(at(0), TideFlag::Low),
                    WaterLevelEvent::new(at(3000), TideFlag::High),
                ],
                oslo,
            )
            .unwrap();
        let reporter = StatusReporter::new(store);

        let report = reporter.snapshot_at(at(1000));
        assert!(report.available);
        assert_eq!(report.direction, Some(Direction::Rising));
        assert_eq!(report.progress, Some(0.333));
        assert_eq!(report.cache_location, Some(oslo));
        assert!(report.reason.is_none());

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["direction"], json!("rising"));
        assert_eq!(value["nextEvent"]["flag"], json!("high"));
        assert_eq!(value["lastEvent"]["flag"], json!("low"));
        assert_eq!(value["cacheLocation"]["latitude"], json!(59.9));
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn stale_cache_has_data_but_is_unavailable() {
        let store = Arc::new(EventStore::in_memory());
        store
            .insert(
                &[WaterLevelEvent::new(at(0), TideFlag::Low)],
                Location::new(59.9, 10.7),
            )
            .unwrap();
        let report = StatusReporter::new(store).snapshot_at(at(10_000));

        assert!(!report.available);
        assert!(report.cache_has_data);
        assert!(report.cache_location.is_some());
    }

    #[tokio::test]
    async fn periodic_reporter_keeps_running() {
        let store = Arc::new(EventStore::in_memory());
        let task = StatusReporter::new(store).spawn(Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
