//! # Tide Update Scheduler
//!
//! Background task deciding when to call the [`TideFetcher`], reconciling results
//! into the [`EventStore`], and reacting to location changes.
//!
//! ## States
//!
//! - **Idle**: waiting for the next periodic check, a retry deadline, or a command
//! - **Fetching**: a request is in flight (the store lock is *not* held)
//! - **Reconciling**: applying results to the store, then notifying listeners
//!
//! ## Triggers
//!
//! - **Start**: a cached location that differs from the configured one is dropped;
//!   then the cache is checked immediately
//! - **Periodic check** (weekly by default): fetch the missing future window when the
//!   cache no longer covers `now .. now + lookahead`
//! - **Location change**: invalidate the cache synchronously, then fetch for the new
//!   location right away
//! - **Fetch failure**: retry with exponential backoff, bounded by [`RetryPolicy`]
//!
//! ## Stale Results
//!
//! Every fetch runs in its own task and reports back over a channel tagged with the
//! location it was issued for. A result is applied only if that location is still
//! the target, so a slow fetch for an old location can never refill a cache that was
//! just invalidated. After shutdown the channel is closed and late results are dropped.

use crate::event_store::{EventStore, StorageError};
use crate::tide_data::{FetchError, TideFetcher};
use crate::{Location, WaterLevelEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Consecutive storage failures after which the scheduler gives up.
const MAX_STORAGE_FAILURES: u32 = 3;

/// Upper bound for any configured span in days.
const MAX_DAYS: u32 = 366;

/// Upper bound for any configured delay.
const MAX_DELAY: Duration = Duration::from_secs(MAX_DAYS as u64 * 24 * 3600);

/// Errors that end the scheduler task.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The cache kept failing even after rebuilding it
    #[error("persistent storage failure: {0}")]
    Storage(#[from] StorageError),

    /// The scheduler task panicked or was cancelled
    #[error("scheduler task failed: {0}")]
    Task(#[from] JoinError),
}

/// Observable scheduler state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Fetching,
    Reconciling,
}

/// Receives a signal after new tide data has been committed to the store.
///
/// The signal carries no payload: listeners re-query the store.
pub trait DataListener: Send + Sync {
    fn on_tide_data_updated(&self);
}

impl<F> DataListener for F
where
    F: Fn() + Send + Sync,
{
    fn on_tide_data_updated(&self) {
        self()
    }
}

/// Bounded exponential backoff for failed fetches.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), or `None` once retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt);
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

/// Scheduler timing and window sizes.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Time between periodic coverage checks
    pub interval: Duration,
    /// Future span the cache must cover
    pub lookahead: chrono::Duration,
    /// History requested when the cache is empty
    pub lookback: chrono::Duration,
    /// Upper bound on a single fetch
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    /// Events older than this are pruned after each reconciliation
    pub retention: Option<chrono::Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval: Duration::from_secs(7 * 24 * 3600),
            lookahead: chrono::Duration::days(7),
            lookback: chrono::Duration::days(1),
            fetch_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            retention: Some(chrono::Duration::days(2)),
        }
    }
}

impl From<&crate::config::Config> for SchedulerConfig {
    /// Out-of-range values are clamped to [`MAX_DAYS`] / [`MAX_DELAY`].
    fn from(config: &crate::config::Config) -> Self {
        let s = &config.scheduler;
        let days = |d: u32| chrono::Duration::days(i64::from(d.min(MAX_DAYS)));
        let secs = |n: u64| Duration::from_secs(n).min(MAX_DELAY);
        SchedulerConfig {
            interval: secs(u64::from(s.interval_days.clamp(1, MAX_DAYS)) * 24 * 3600),
            lookahead: days(s.lookahead_days),
            lookback: days(s.lookback_days),
            fetch_timeout: secs(s.fetch_timeout_secs.max(1)),
            retry: RetryPolicy {
                max_retries: s.max_retries,
                initial_delay: secs(s.retry_initial_secs),
                max_delay: secs(s.retry_max_secs),
            },
            retention: match config.cache.retention_days {
                0 => None,
                d => Some(days(d)),
            },
        }
    }
}

#[derive(Debug)]
enum Command {
    LocationChanged(Location),
    Shutdown,
}

/// Cloneable sender for scheduler commands.
#[derive(Clone, Debug)]
pub struct SchedulerCommands {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerCommands {
    /// Announce a new configured location.
    pub fn location_changed(&self, location: Location) {
        self.send(Command::LocationChanged(location));
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("scheduler already stopped, command dropped");
        }
    }
}

/// Handle to the running scheduler task.
#[derive(Debug)]
pub struct SchedulerHandle {
    commands: SchedulerCommands,
    state: watch::Receiver<SchedulerState>,
    task: JoinHandle<Result<(), SchedulerError>>,
}

impl SchedulerHandle {
    pub fn commands(&self) -> SchedulerCommands {
        self.commands.clone()
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Receiver notified on state changes.
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Wait for the task to end on its own (shutdown command or fatal error).
    pub async fn join(self) -> Result<(), SchedulerError> {
        self.task.await?
    }

    /// Ask the task to stop and wait for it.
    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        self.commands.shutdown();
        self.join().await
    }
}

/// A fetch window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

struct FetchOutcome {
    seq: u64,
    location: Location,
    window: FetchWindow,
    result: Result<Vec<WaterLevelEvent>, FetchError>,
}

/// Update scheduler, configured but not yet running.
pub struct UpdateScheduler {
    store: Arc<EventStore>,
    fetcher: Arc<dyn TideFetcher>,
    config: SchedulerConfig,
    target: Location,
    listeners: Vec<Arc<dyn DataListener>>,
}

impl UpdateScheduler {
    /// `location` is the configured location at startup.
    pub fn new(
        store: Arc<EventStore>,
        fetcher: Arc<dyn TideFetcher>,
        config: SchedulerConfig,
        location: Location,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
            target: location,
            listeners: Vec::new(),
        }
    }

    /// Register a listener for "tide data updated" signals.
    pub fn add_listener(&mut self, listener: Arc<dyn DataListener>) {
        self.listeners.push(listener);
    }

    /// Start the scheduler on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SchedulerState::Idle);
        let (results_tx, results) = mpsc::unbounded_channel();

        let worker = Worker {
            store: self.store,
            fetcher: self.fetcher,
            config: self.config,
            target: self.target,
            listeners: self.listeners,
            state: state_tx,
            results: results_tx,
            seq: 0,
            in_flight: None,
            attempt: 0,
            storage_failures: 0,
            next_wake: Instant::now(),
        };
        let task = tokio::spawn(worker.run(commands, results));

        SchedulerHandle {
            commands: SchedulerCommands { tx },
            state,
            task,
        }
    }
}

struct Worker {
    store: Arc<EventStore>,
    fetcher: Arc<dyn TideFetcher>,
    config: SchedulerConfig,
    target: Location,
    listeners: Vec<Arc<dyn DataListener>>,
    state: watch::Sender<SchedulerState>,
    results: mpsc::UnboundedSender<FetchOutcome>,
    seq: u64,
    /// Sequence number of the fetch issued for the current target
    in_flight: Option<u64>,
    /// Failed attempts since the last success
    attempt: u32,
    storage_failures: u32,
    next_wake: Instant,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<FetchOutcome>,
    ) -> Result<(), SchedulerError> {
        info!(location = %self.target, "tide scheduler started");
        self.startup().await?;

        loop {
            let wake = self.next_wake;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::LocationChanged(location)) => self.location_changed(location).await?,
                    Some(Command::Shutdown) | None => break,
                },
                Some(outcome) = results.recv() => self.fetch_finished(outcome).await?,
                _ = tokio::time::sleep_until(wake) => {
                    self.next_wake = deadline(self.config.interval);
                    self.check_coverage();
                }
            }
        }

        info!("tide scheduler stopped");
        Ok(())
    }

    /// Drop a cache left over from a location configured while we were offline,
    /// then check coverage straight away.
    async fn startup(&mut self) -> Result<(), SchedulerError> {
        match self.store.current_location() {
            Some(cached) if cached != self.target => {
                info!(cached = %cached, configured = %self.target, "location changed while offline, clearing cache");
                self.invalidate().await?;
            }
            Some(_) => {}
            None => info!("no cached location (first run or cache cleared)"),
        }
        self.next_wake = deadline(self.config.interval);
        self.check_coverage();
        Ok(())
    }

    async fn location_changed(&mut self, location: Location) -> Result<(), SchedulerError> {
        if location == self.target {
            debug!(location = %location, "location unchanged, ignoring");
            return Ok(());
        }

        info!(from = %self.target, to = %location, "location change, invalidating cache");
        self.invalidate().await?;
        self.target = location;
        self.attempt = 0;
        // Any fetch still running is for the old location and will be discarded.
        self.in_flight = None;
        self.next_wake = deadline(self.config.interval);
        self.check_coverage();
        Ok(())
    }

    /// Decide whether a fetch is needed and for which window.
    fn check_coverage(&mut self) {
        if self.in_flight.is_some() {
            debug!("fetch already in flight, skipping coverage check");
            return;
        }

        let now = Utc::now();
        match self.missing_window(now) {
            Some(window) => self.start_fetch(window),
            None => debug!("cache up to date"),
        }
    }

    fn missing_window(&self, now: DateTime<Utc>) -> Option<FetchWindow> {
        let horizon = now + self.config.lookahead;
        let earliest_wanted = now - self.config.lookback;

        if self.store.is_empty() {
            return Some(FetchWindow {
                from: earliest_wanted,
                to: horizon,
            });
        }
        if self.store.has_data_for_range(now, horizon) {
            return None;
        }

        let from = match self.store.bounds() {
            // Past is covered: only the future beyond the latest event is missing
            Some((first, last)) if first.time <= now => last.time.max(earliest_wanted),
            _ => earliest_wanted,
        };
        Some(FetchWindow { from, to: horizon })
    }

    fn start_fetch(&mut self, window: FetchWindow) {
        self.seq += 1;
        let seq = self.seq;
        let location = self.target;
        self.in_flight = Some(seq);
        self.set_state(SchedulerState::Fetching);
        info!(location = %location, from = %window.from, to = %window.to, "fetching tide data");

        let fetcher = self.fetcher.clone();
        let results = self.results.clone();
        let timeout = self.config.fetch_timeout;
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, fetcher.fetch(location, window.from, window.to))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                };
            // Receiver is gone after shutdown; the result is simply dropped.
            let _ = results.send(FetchOutcome {
                seq,
                location,
                window,
                result,
            });
        });
    }

    async fn fetch_finished(&mut self, outcome: FetchOutcome) -> Result<(), SchedulerError> {
        if self.in_flight == Some(outcome.seq) {
            self.in_flight = None;
        }

        if outcome.location != self.target {
            warn!(
                fetched_for = %outcome.location,
                target = %self.target,
                "discarding tide data for a stale location"
            );
            self.settle();
            return Ok(());
        }

        match outcome.result {
            Ok(events) if events.is_empty() => {
                warn!(
                    location = %outcome.location,
                    from = %outcome.window.from,
                    to = %outcome.window.to,
                    "no tide data for location"
                );
                self.attempt = 0;
                self.next_wake = deadline(self.config.interval);
            }
            Ok(events) => self.reconcile(events, outcome.location).await?,
            Err(e) => self.schedule_retry(&e),
        }

        self.settle();
        Ok(())
    }

    async fn reconcile(
        &mut self,
        events: Vec<WaterLevelEvent>,
        location: Location,
    ) -> Result<(), SchedulerError> {
        self.set_state(SchedulerState::Reconciling);
        let received = events.len();
        match self.on_store(move |store| store.insert(&events, location)).await? {
            Ok(added) => {
                self.storage_failures = 0;
                self.attempt = 0;
                self.next_wake = deadline(self.config.interval);
                info!(
                    location = %location,
                    received,
                    inserted = added,
                    "reconciled tide data"
                );
                self.prune().await?;
                for listener in &self.listeners {
                    listener.on_tide_data_updated();
                }
                Ok(())
            }
            Err(e) => {
                self.storage_failed(e).await?;
                self.next_wake = deadline(self.config.retry.initial_delay);
                Ok(())
            }
        }
    }

    async fn prune(&mut self) -> Result<(), SchedulerError> {
        let Some(retention) = self.config.retention else {
            return Ok(());
        };
        let now = Utc::now();
        match self.on_store(move |store| store.prune(now - retention, now)).await? {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "pruned old tide events"),
            Err(e) => warn!(error = %e, "pruning tide cache failed"),
        }
        Ok(())
    }

    fn schedule_retry(&mut self, e: &FetchError) {
        match self.config.retry.delay_for(self.attempt) {
            Some(delay) => {
                self.attempt += 1;
                warn!(
                    error = %e,
                    attempt = self.attempt,
                    retry_in = ?delay,
                    "tide fetch failed, retrying"
                );
                self.next_wake = deadline(delay);
            }
            None => {
                error!(
                    error = %e,
                    attempts = self.attempt,
                    "tide fetch failed, retries exhausted until next periodic check"
                );
                self.attempt = 0;
                self.next_wake = deadline(self.config.interval);
            }
        }
    }

    async fn invalidate(&mut self) -> Result<(), SchedulerError> {
        match self.on_store(|store| store.invalidate_all()).await? {
            Ok(()) => {
                self.storage_failures = 0;
                Ok(())
            }
            Err(e) => self.storage_failed(e).await,
        }
    }

    /// Log a storage failure and try to recover by rebuilding the cache empty.
    /// Gives up once failures keep repeating.
    async fn storage_failed(&mut self, e: StorageError) -> Result<(), SchedulerError> {
        self.storage_failures += 1;
        error!(error = %e, failures = self.storage_failures, "tide cache storage failure");
        if self.storage_failures >= MAX_STORAGE_FAILURES {
            return Err(e.into());
        }

        match self.on_store(|store| store.rebuild()).await? {
            Ok(()) => warn!("tide cache rebuilt empty"),
            Err(rebuild) => error!(error = %rebuild, "rebuilding tide cache failed"),
        }
        Ok(())
    }

    /// Run a store write on the blocking pool; the cache file is written synchronously.
    async fn on_store<T, F>(&self, op: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&EventStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || op(&store)).await?)
    }

    fn settle(&mut self) {
        if self.in_flight.is_some() {
            self.set_state(SchedulerState::Fetching);
        } else {
            self.set_state(SchedulerState::Idle);
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }
}

/// `delay` from now, saturating instead of overflowing the clock.
fn deadline(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(20)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(40)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(60)));
        assert_eq!(policy.delay_for(5), None);
    }

    #[test]
    fn zero_retries_never_retries() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn config_conversion() {
        let mut config = crate::config::Config::default();
        config.scheduler.interval_days = 3;
        config.cache.retention_days = 0;
        let scheduler = SchedulerConfig::from(&config);
        assert_eq!(scheduler.interval, Duration::from_secs(3 * 24 * 3600));
        assert_eq!(scheduler.lookahead, chrono::Duration::days(7));
        assert_eq!(scheduler.retention, None);
        assert_eq!(scheduler.retry.max_retries, 5);
    }

    #[test]
    fn config_extremes_are_clamped() {
        let mut config = crate::config::Config::default();
        config.scheduler.interval_days = u32::MAX;
        config.scheduler.lookahead_days = u32::MAX;
        config.scheduler.lookback_days = u32::MAX;
        config.scheduler.fetch_timeout_secs = u64::MAX;
        config.scheduler.retry_initial_secs = u64::MAX;
        config.scheduler.retry_max_secs = u64::MAX;
        config.cache.retention_days = u32::MAX;

        let scheduler = SchedulerConfig::from(&config);
        assert_eq!(scheduler.interval, MAX_DELAY);
        assert_eq!(scheduler.lookahead, chrono::Duration::days(366));
        assert_eq!(scheduler.lookback, chrono::Duration::days(366));
        assert_eq!(scheduler.retry.initial_delay, MAX_DELAY);
        assert_eq!(scheduler.retry.delay_for(4), Some(MAX_DELAY));
        assert_eq!(scheduler.retention, Some(chrono::Duration::days(366)));

        // Windows and deadlines stay representable
        let now = Utc::now();
        assert!(now + scheduler.lookahead > now);
        assert!(deadline(scheduler.retry.initial_delay) > Instant::now());
    }

    #[test]
    fn deadline_saturates() {
        assert!(deadline(Duration::MAX) > Instant::now());
    }
}
