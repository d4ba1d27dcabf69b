//! # Configuration Bridge
//!
//! The tide core only needs two things from configuration: the configured location,
//! and a notification when it changes. [`ConfigBridge`] is that narrow interface.
//!
//! [`FileConfigBridge`] implements it on top of the TOML config file. Changes arrive
//! either through [`FileConfigBridge::update_location`] (what a BLE/GATT transport
//! calls) or by editing the file, which [`FileConfigBridge::watch`] notices by polling
//! its modification time.

use crate::config::{Config, ConfigError};
use crate::Location;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback fired with the new location after it changed.
pub type LocationListener = Box<dyn Fn(Location) + Send + Sync>;

/// Source of the configured tide location.
pub trait ConfigBridge: Send + Sync {
    fn current_location(&self) -> Location;

    fn on_location_changed(&self, listener: LocationListener);
}

/// [`ConfigBridge`] over a TOML file.
pub struct FileConfigBridge {
    path: PathBuf,
    config: RwLock<Config>,
    modified: Mutex<Option<SystemTime>>,
    listeners: Mutex<Vec<LocationListener>>,
}

impl FileConfigBridge {
    /// Load `path` (defaults if missing or invalid) and remember its modification time.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let config = Config::load_from_path(&path);
        let modified = modified_time(&path);
        Self {
            path,
            config: RwLock::new(config),
            modified: Mutex::new(modified),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the whole configuration.
    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a new location and notify listeners if it differs from the current one.
    pub fn update_location(&self, location: Location) -> Result<(), ConfigError> {
        let previous = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            let previous = config.location();
            let mut next = config.clone();
            next.set_location(location);
            next.save_to_path(&self.path)?;
            *config = next;
            previous
        };
        *self.modified.lock().unwrap_or_else(PoisonError::into_inner) = modified_time(&self.path);

        if previous != location {
            info!(from = %previous, to = %location, "location updated");
            self.notify(location);
        }
        Ok(())
    }

    /// Re-read the file. Returns true when the location changed.
    ///
    /// An unreadable or invalid file leaves the current configuration in place.
    pub fn reload(&self) -> bool {
        let next = match Config::try_load_from_path(&self.path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config reload failed, keeping current config");
                return false;
            }
        };

        let (previous, location) = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            let previous = config.location();
            let location = next.location();
            *config = next;
            (previous, location)
        };

        if previous == location {
            debug!("config reloaded, location unchanged");
            return false;
        }
        info!(from = %previous, to = %location, "location changed in config file");
        self.notify(location);
        true
    }

    /// Poll the file's modification time every `period` and reload on change.
    pub fn watch(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let current = modified_time(&self.path);
                let changed = {
                    let mut seen = self.modified.lock().unwrap_or_else(PoisonError::into_inner);
                    if current.is_some() && current != *seen {
                        *seen = current;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.reload();
                }
            }
        })
    }

    fn notify(&self, location: Location) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(location);
        }
    }
}

impl ConfigBridge for FileConfigBridge {
    fn current_location(&self) -> Location {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .location()
    }

    fn on_location_changed(&self, listener: LocationListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
