//! Privacy-preserving agent statistics.
//!
//! Tracks how much the agent has measured and synced without retaining any
//! raw measurement data. This backs the non-blocking sync-status indicator:
//! sync failures show up here, never as interruptions to measurement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

/// Counters for the current agent session.
#[derive(Debug)]
pub struct AgentStats {
    /// Landmark frames received from the source
    frames_received: AtomicU64,
    /// Frames dropped (missing landmarks, low confidence, out of order)
    frames_dropped: AtomicU64,
    /// Input lines rejected before decoding (malformed JSON, backpressure)
    lines_rejected: AtomicU64,
    /// Samples folded into daily aggregates
    samples_folded: AtomicU64,
    /// Days successfully synced to the remote store
    days_synced: AtomicU64,
    /// Failed sync attempts
    sync_failures: AtomicU64,
    /// Most recent sync error, if the last attempt failed
    last_sync_error: Mutex<Option<String>>,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            lines_rejected: AtomicU64::new(0),
            samples_folded: AtomicU64::new(0),
            days_synced: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            last_sync_error: Mutex::new(None),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats with persistence, carrying forward prior totals.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::debug!("no previous stats loaded: {e}");
        }

        stats
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold in the frame source's rejection count for this session.
    pub fn record_lines_rejected(&self, count: u64) {
        self.lines_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_sample_folded(&self) {
        self.samples_folded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_day_synced(&self) {
        self.days_synced.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_sync_error.lock() {
            *guard = None;
        }
    }

    pub fn record_sync_failure(&self, error: &str) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_sync_error.lock() {
            *guard = Some(error.to_string());
        }
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            lines_rejected: self.lines_rejected.load(Ordering::Relaxed),
            samples_folded: self.samples_folded.load(Ordering::Relaxed),
            days_synced: self.days_synced.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            last_sync_error: self
                .last_sync_error
                .lock()
                .ok()
                .and_then(|g| g.clone()),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds() as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        let sync_line = match &stats.last_sync_error {
            Some(err) => format!("last sync failed: {err}"),
            None => "ok".to_string(),
        };
        format!(
            "Session Statistics:\n\
             - Frames received: {}\n\
             - Frames dropped: {}\n\
             - Lines rejected: {}\n\
             - Samples folded: {}\n\
             - Days synced: {}\n\
             - Sync failures: {}\n\
             - Sync status: {}\n\
             - Session duration: {} seconds\n\
             \n\
             Privacy Guarantee:\n\
             - Raw landmark frames never stored or transmitted\n\
             - Only daily aggregate totals leave this device",
            stats.frames_received,
            stats.frames_dropped,
            stats.lines_rejected,
            stats.samples_folded,
            stats.days_synced,
            stats.sync_failures,
            sync_line,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.snapshot();
            let persisted = PersistedStats {
                frames_received: stats.frames_received,
                frames_dropped: stats.frames_dropped,
                lines_rejected: stats.lines_rejected,
                samples_folded: stats.samples_folded,
                days_synced: stats.days_synced,
                sync_failures: stats.sync_failures,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.frames_received
                    .store(persisted.frames_received, Ordering::Relaxed);
                self.frames_dropped
                    .store(persisted.frames_dropped, Ordering::Relaxed);
                self.lines_rejected
                    .store(persisted.lines_rejected, Ordering::Relaxed);
                self.samples_folded
                    .store(persisted.samples_folded, Ordering::Relaxed);
                self.days_synced
                    .store(persisted.days_synced, Ordering::Relaxed);
                self.sync_failures
                    .store(persisted.sync_failures, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of agent statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub lines_rejected: u64,
    pub samples_folded: u64,
    pub days_synced: u64,
    pub sync_failures: u64,
    pub last_sync_error: Option<String>,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    frames_received: u64,
    frames_dropped: u64,
    // Older stats files predate this counter.
    #[serde(default)]
    lines_rejected: u64,
    samples_folded: u64,
    days_synced: u64,
    sync_failures: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared stats handle.
pub type SharedStats = Arc<AgentStats>;

/// Create a new shared stats handle with persistence.
pub fn create_shared_stats(path: PathBuf) -> SharedStats {
    Arc::new(AgentStats::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let stats = AgentStats::new();

        stats.record_frame_received();
        stats.record_frame_received();
        stats.record_frame_dropped();
        stats.record_sample_folded();
        stats.record_lines_rejected(3);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.samples_folded, 1);
        assert_eq!(snap.lines_rejected, 3);
    }

    #[test]
    fn test_sync_status_tracks_last_error() {
        let stats = AgentStats::new();

        stats.record_sync_failure("connection refused");
        assert_eq!(
            stats.snapshot().last_sync_error.as_deref(),
            Some("connection refused")
        );

        // A later success clears the indicator.
        stats.record_day_synced();
        assert!(stats.snapshot().last_sync_error.is_none());
        assert_eq!(stats.snapshot().sync_failures, 1);
    }

    #[test]
    fn test_summary_format() {
        let stats = AgentStats::new();
        stats.record_sync_failure("timeout");
        let summary = stats.summary();

        assert!(summary.contains("Frames received"));
        assert!(summary.contains("last sync failed: timeout"));
        assert!(summary.contains("Privacy Guarantee"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let path = std::env::temp_dir().join("posture-agent-stats-test.json");
        let _ = std::fs::remove_file(&path);

        let stats = AgentStats::with_persistence(path.clone());
        stats.record_frame_received();
        stats.record_day_synced();
        stats.record_lines_rejected(2);
        stats.save().unwrap();

        let reloaded = AgentStats::with_persistence(path.clone());
        let snap = reloaded.snapshot();
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.days_synced, 1);
        assert_eq!(snap.lines_rejected, 2);

        let _ = std::fs::remove_file(&path);
    }
}
