use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Retry and polling intervals, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wait between attempts to open a device that reported busy.
    pub open_retry_interval_ms: u64,
    /// Wait between passes over the candidate requests on one device.
    pub attempt_interval_ms: u64,
    /// Discovery interval while no device is being worked on.
    pub idle_poll_interval_ms: u64,
    /// Discovery interval while at least one device is being worked on.
    pub active_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            open_retry_interval_ms: 100,
            attempt_interval_ms: 200,
            idle_poll_interval_ms: 300,
            active_poll_interval_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Read a config file, `None` if it does not exist. Missing fields take their defaults.
    pub fn load(path: &Path) -> io::Result<Option<ClientConfig>> {
        match File::open(path) {
            Ok(file) => serde_json::from_reader(file)
                .map_err(|e| e.into())
                .map(Some),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| e.into())
    }

    pub fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_interval_ms)
    }

    pub fn attempt_interval(&self) -> Duration {
        Duration::from_millis(self.attempt_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn active_poll_interval(&self) -> Duration {
        Duration::from_millis(self.active_poll_interval_ms)
    }
}
