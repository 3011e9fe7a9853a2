//! Read tracking: a TTL set of accessed paths flushed to a file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Configuration for the access log.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadTrackingConfig {
    /// Output path for the access log.
    pub path: PathBuf,
    /// TTL in seconds for tracked entries.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Flush interval in seconds.
    #[serde(default = "default_update")]
    pub update: u64,
    /// Only track paths whose mtime is older than this many seconds.
    #[serde(default)]
    pub modified: Option<u64>,
}

fn default_timeout() -> u64 {
    3600
}

fn default_update() -> u64 {
    60
}

/// TTL set of accessed paths. A background task rewrites the output file on
/// every flush interval, dropping entries past their TTL.
pub struct ReadTracker {
    config: ReadTrackingConfig,
    entries: Mutex<HashMap<String, Instant>>,
}

impl ReadTracker {
    pub fn spawn(config: ReadTrackingConfig) -> Arc<Self> {
        let tracker = Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&tracker);
        let interval = Duration::from_secs(tracker.config.update.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(tracker) => tracker.flush().await,
                    None => break,
                }
            }
        });
        tracker
    }

    /// The configured modification-age threshold, if any.
    pub fn modified_threshold(&self) -> Option<u64> {
        self.config.modified
    }

    /// Record one accessed path.
    pub fn track(&self, path: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), Instant::now());
    }

    #[cfg(test)]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.lock().unwrap().contains_key(path)
    }

    /// Drop expired entries and rewrite the output file, one path per line.
    pub async fn flush(&self) {
        let ttl = Duration::from_secs(self.config.timeout);
        let mut paths: Vec<String> = {
            let mut entries = self.entries.lock().unwrap();
            let now = Instant::now();
            entries.retain(|_, seen| now.duration_since(*seen) <= ttl);
            entries.keys().cloned().collect()
        };
        paths.sort();
        let body = paths.join("\n");
        if let Err(err) = tokio::fs::write(&self.config.path, body).await {
            warn!(target: "wsftp::adapter", error = %err, path = ?self.config.path, "read-tracking flush failed");
        }
    }
}
