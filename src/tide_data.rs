//! # Tide Prediction Fetching
//!
//! This module defines the contract the scheduler uses to obtain tide events and
//! provides the production implementation backed by the Norwegian Mapping
//! Authority (Kartverket) tide API.
//!
//! ## Data Source
//!
//! ### Kartverket "Se havnivå" API
//! - **URL**: https://api.sehavniva.no/tideapi.php
//! - **Request**: `tide_request=locationdata` for a latitude/longitude pair
//! - **Format**: XML, one `<waterlevel time=".." flag="high|low"/>` per tide event
//! - **Window**: always explicit; the scheduler never asks for "all data"
//!
//! ## Error Handling
//!
//! - **Network failures / 4xx / 5xx**: reported as [`FetchError::Http`]
//! - **Malformed payloads**: reported as [`FetchError::Parse`]
//! - **Slow responses**: the scheduler wraps every call in a timeout and reports
//!   [`FetchError::Timeout`]
//!
//! None of these are fatal: the scheduler retries with backoff.

use crate::{Location, TideFlag, WaterLevelEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default endpoint of the Kartverket tide API.
pub const KARTVERKET_API: &str = "https://api.sehavniva.no/tideapi.php";

/// Errors that can occur while fetching tide predictions.
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request failed (network, server, or protocol error)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body did not contain usable tide events
    #[error("parse failed: {0}")]
    Parse(String),

    /// Request did not complete within its time bound
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Source of tide events for a location and bounded window.
#[async_trait]
pub trait TideFetcher: Send + Sync {
    async fn fetch(
        &self,
        location: Location,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WaterLevelEvent>, FetchError>;
}

/// [`TideFetcher`] backed by the Kartverket tide API.
#[derive(Debug, Clone)]
pub struct KartverketFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl KartverketFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for KartverketFetcher {
    fn default() -> Self {
        Self::new(KARTVERKET_API)
    }
}

#[async_trait]
impl TideFetcher for KartverketFetcher {
    async fn fetch(
        &self,
        location: Location,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WaterLevelEvent>, FetchError> {
        let query = [
            ("tide_request", "locationdata".to_string()),
            ("lat", location.latitude.to_string()),
            ("lon", location.longitude.to_string()),
            ("fromtime", format_api_time(from)),
            ("totime", format_api_time(to)),
            ("datatype", "tab".to_string()),
            ("refcode", "cd".to_string()),
            ("lang", "en".to_string()),
            ("interval", "10".to_string()),
            ("dst", "0".to_string()),
            ("tzone", "0".to_string()),
        ];

        debug!(location = %location, %from, %to, "requesting tide predictions");
        let body = self
            .client
            .get(&self.base_url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_waterlevels(&body)
    }
}

/// Format a timestamp the way the API expects (`2025-07-24T05:12`, UTC).
fn format_api_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M").to_string()
}

/// Extract tide events from an API response.
///
/// The response looks like:
/// ```xml
/// <tide>
///   <locationdata>
///     <data type="prediction" unit="cm">
///       <waterlevel value="212.3" time="2025-07-24T05:12:00+00:00" flag="high"/>
///       <waterlevel value="48.1" time="2025-07-24T11:31:00+00:00" flag="low"/>
///     </data>
///   </locationdata>
/// </tide>
/// ```
/// Events with a flag other than `high`/`low` are skipped. A `time` attribute that
/// is missing or not RFC 3339 fails the whole parse.
pub fn parse_waterlevels(body: &str) -> Result<Vec<WaterLevelEvent>, FetchError> {
    let doc = Html::parse_document(body);
    let sel = Selector::parse("waterlevel").map_err(|e| FetchError::Parse(e.to_string()))?;

    let mut events = Vec::new();
    for node in doc.select(&sel) {
        let attrs = node.value();
        let flag = match attrs.attr("flag") {
            Some("high") => TideFlag::High,
            Some("low") => TideFlag::Low,
            _ => continue,
        };

        let raw = attrs
            .attr("time")
            .ok_or_else(|| FetchError::Parse("waterlevel without time".to_string()))?;
        let time = DateTime::parse_from_rfc3339(raw.trim())
            .map_err(|e| FetchError::Parse(format!("bad time {raw:?}: {e}")))?
            .with_timezone(&Utc);

        events.push(WaterLevelEvent::new(time, flag));
    }

    Ok(events)
}
