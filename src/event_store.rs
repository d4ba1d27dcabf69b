//! # Tide Event Store
//!
//! Durable, queryable set of tide events for exactly one location at a time.
//!
//! ## Single-Location Cache
//!
//! The store holds a location marker next to its events. Either both are present
//! and the events belong to the marker's location, or the store is empty. Events
//! for a second location are never mixed in: [`EventStore::insert`] refuses a
//! location that differs from the marker, and a location change goes through
//! [`EventStore::invalidate_all`] first.
//!
//! ## Persistence
//!
//! - **Format**: one JSON document holding the marker and all events
//! - **Writes**: the whole document is written to a temporary file and renamed over
//!   the previous one, so an insert or invalidation is all-or-nothing on disk
//! - **Memory**: the in-memory copy is only replaced after the write succeeded
//! - **Recovery**: a malformed file is replaced with an empty store once, at open
//!   ([`EventStore::open_read_only`] reads it as empty and leaves it in place)
//!
//! ## Concurrency
//!
//! Writers are serialized by their own mutex and write the file before taking the
//! `RwLock` write guard just for the swap. Readers see either the old or the new
//! state and never wait on disk I/O.

use crate::{truncate_to_second, Location, TideFlag, WaterLevelEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{info, warn};

/// On-disk format version.
const CACHE_VERSION: u32 = 1;

/// Errors raised by the event store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading or writing the cache file failed
    #[error("cache IO: {0}")]
    Io(#[from] io::Error),

    /// The cache document could not be encoded
    #[error("cache encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// An insert tried to mix events from a second location into the cache
    #[error("cache holds data for {cached}, refusing events for {requested}")]
    LocationMismatch {
        cached: Location,
        requested: Location,
    },
}

/// The two events surrounding an instant.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bracket {
    /// Latest event at or before the instant
    pub last: Option<WaterLevelEvent>,
    /// Earliest event strictly after the instant
    pub next: Option<WaterLevelEvent>,
}

#[derive(Clone, Debug, Default)]
struct CacheState {
    location: Option<Location>,
    events: BTreeMap<DateTime<Utc>, TideFlag>,
}

impl CacheState {
    fn has_data(&self) -> bool {
        self.location.is_some() && !self.events.is_empty()
    }

    fn to_event((time, flag): (&DateTime<Utc>, &TideFlag)) -> WaterLevelEvent {
        WaterLevelEvent {
            time: *time,
            flag: *flag,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    location: Option<Location>,
    events: Vec<WaterLevelEvent>,
}

impl From<&CacheState> for PersistedCache {
    fn from(state: &CacheState) -> Self {
        PersistedCache {
            version: CACHE_VERSION,
            location: state.location,
            events: state.events.iter().map(CacheState::to_event).collect(),
        }
    }
}

/// Tide event cache for a single location.
///
/// # Example
/// ```
/// use chrono::{TimeZone, Utc};
/// use tide_light_lib::event_store::EventStore;
/// use tide_light_lib::{Location, TideFlag, WaterLevelEvent};
///
/// let store = EventStore::in_memory();
/// let t = Utc.with_ymd_and_hms(2025, 7, 24, 5, 0, 0).unwrap();
/// store
///     .insert(&[WaterLevelEvent::new(t, TideFlag::High)], Location::new(59.9, 10.7))
///     .unwrap();
/// assert!(!store.is_empty());
/// ```
#[derive(Debug)]
pub struct EventStore {
    path: Option<PathBuf>,
    state: RwLock<CacheState>,
    /// Serializes writers; held across the file write, unlike `state`
    writer: Mutex<()>,
}

/// What a cache file held when it was read.
enum Loaded {
    Missing,
    Valid(CacheState),
    Invalid,
}

impl EventStore {
    /// Store that lives purely in memory. Used by tests.
    pub fn in_memory() -> Self {
        Self::with_state(None, CacheState::default())
    }

    fn with_state(path: Option<PathBuf>, state: CacheState) -> Self {
        Self {
            path,
            state: RwLock::new(state),
            writer: Mutex::new(()),
        }
    }

    /// Open (or create) the cache file at `path`.
    ///
    /// A missing file yields an empty store. A file that cannot be decoded, or that
    /// holds events without a marker (or a marker without events), is rebuilt as an
    /// empty store. Any other I/O failure is returned.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let loaded = load(&path)?;
        let store = Self::with_state(Some(path), CacheState::default());
        match loaded {
            Loaded::Missing => {}
            Loaded::Valid(state) => *store.write() = state,
            Loaded::Invalid => {
                warn!("rebuilding tide cache empty");
                store.rebuild()?;
            }
        }
        Ok(store)
    }

    /// Snapshot of the cache file at `path` that never writes to it.
    ///
    /// An unusable file reads as an empty store; the file itself is left alone.
    /// Mutations on the returned store only change memory.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let state = match load(path.as_ref())? {
            Loaded::Valid(state) => state,
            Loaded::Missing | Loaded::Invalid => CacheState::default(),
        };
        Ok(Self::with_state(None, state))
    }

    /// True when there is no location marker or no events.
    pub fn is_empty(&self) -> bool {
        !self.read().has_data()
    }

    /// Location of the cached events, if any.
    pub fn current_location(&self) -> Option<Location> {
        self.read().location
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    /// Insert events for `location`, ignoring any whose time is already stored.
    ///
    /// Sets the location marker. Returns how many events were new.
    ///
    /// # Errors
    /// [`StorageError::LocationMismatch`] when the marker names another location,
    /// or an I/O error when the cache could not be written. Nothing is changed in
    /// either case.
    pub fn insert(
        &self,
        events: &[WaterLevelEvent],
        location: Location,
    ) -> Result<usize, StorageError> {
        let _writer = self.lock_writer();
        let mut next = self.read().clone();
        if let Some(cached) = next.location {
            if cached != location {
                return Err(StorageError::LocationMismatch {
                    cached,
                    requested: location,
                });
            }
        }
        // A marker is never written without events
        if events.is_empty() {
            return Ok(0);
        }

        next.location = Some(location);
        let before = next.events.len();
        for event in events {
            next.events
                .entry(truncate_to_second(event.time))
                .or_insert(event.flag);
        }
        let added = next.events.len() - before;

        self.commit(next)?;
        Ok(added)
    }

    /// Events with `start <= time <= end`, ascending by time.
    ///
    /// Callers check [`EventStore::is_empty`] first; an empty store yields nothing.
    pub fn events_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<WaterLevelEvent> {
        if start > end {
            return Vec::new();
        }
        let state = self.read();
        if !state.has_data() {
            return Vec::new();
        }
        state
            .events
            .range(start..=end)
            .map(CacheState::to_event)
            .collect()
    }

    /// True when some event lies at or before `start` and some event at or after
    /// `end`, i.e. the whole range is covered.
    pub fn has_data_for_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let state = self.read();
        state.has_data()
            && state.events.range(..=start).next_back().is_some()
            && state.events.range(end..).next().is_some()
    }

    /// Events surrounding `now`, read under one lock.
    pub fn bracketing(&self, now: DateTime<Utc>) -> Bracket {
        let state = self.read();
        if !state.has_data() {
            return Bracket::default();
        }
        Bracket {
            last: state
                .events
                .range(..=now)
                .next_back()
                .map(CacheState::to_event),
            next: state
                .events
                .range((Bound::Excluded(now), Bound::Unbounded))
                .next()
                .map(CacheState::to_event),
        }
    }

    /// Earliest and latest stored events.
    pub fn bounds(&self) -> Option<(WaterLevelEvent, WaterLevelEvent)> {
        let state = self.read();
        if !state.has_data() {
            return None;
        }
        let first = state.events.iter().next().map(CacheState::to_event)?;
        let last = state.events.iter().next_back().map(CacheState::to_event)?;
        Some((first, last))
    }

    /// Clear all events and the location marker together.
    pub fn invalidate_all(&self) -> Result<(), StorageError> {
        let _writer = self.lock_writer();
        self.commit(CacheState::default())
    }

    /// Delete events older than `horizon`.
    ///
    /// The latest event at or before `now` is always kept, since it is the lower
    /// half of the bracket currently on display. Returns how many events were removed.
    pub fn prune(&self, horizon: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let _writer = self.lock_writer();
        let mut next = self.read().clone();
        let keep_from = match next.events.range(..=now).next_back() {
            Some((last, _)) => horizon.min(*last),
            None => horizon,
        };

        let kept = next.events.split_off(&keep_from);
        let removed = next.events.len();
        if removed == 0 {
            return Ok(0);
        }
        next.events = kept;

        self.commit(next)?;
        Ok(removed)
    }

    /// Recovery path: reset the cache to empty and rewrite the file from scratch.
    ///
    /// Memory is emptied even when the file cannot be rewritten.
    pub fn rebuild(&self) -> Result<(), StorageError> {
        let _writer = self.lock_writer();
        *self.write() = CacheState::default();
        if let Some(path) = &self.path {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        self.persist(&CacheState::default())
    }

    /// Write `next` to disk, then swap it in. Caller holds the writer lock.
    fn commit(&self, next: CacheState) -> Result<(), StorageError> {
        self.persist(&next)?;
        *self.write() = next;
        Ok(())
    }

    fn persist(&self, state: &CacheState) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_vec(&PersistedCache::from(state))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load(path: &Path) -> Result<Loaded, StorageError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no tide cache found, starting empty");
            return Ok(Loaded::Missing);
        }
        Err(e) => return Err(e.into()),
    };

    let persisted = match serde_json::from_slice::<PersistedCache>(&data) {
        Ok(persisted) => persisted,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "tide cache unreadable");
            return Ok(Loaded::Invalid);
        }
    };

    let state = CacheState {
        location: persisted.location,
        events: persisted
            .events
            .iter()
            .map(|e| (truncate_to_second(e.time), e.flag))
            .collect(),
    };
    if state.location.is_some() != !state.events.is_empty() {
        warn!(path = %path.display(), "tide cache has events and marker out of step");
        return Ok(Loaded::Invalid);
    }

    info!(
        path = %path.display(),
        events = state.events.len(),
        location = ?state.location,
        "loaded tide cache"
    );
    Ok(Loaded::Valid(state))
}
