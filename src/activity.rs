//! Activity logging collaborator.
//!
//! The event router describes some inbound updates as activity entries. Only
//! [`ActivityCategory::Login`] and [`ActivityCategory::SettingChange`] are
//! forwarded to the logger: the activity feed is itself a subscribed channel,
//! and logging every update would publish a new activity document per update.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::entity::EntityId;

/// Activity categories.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Login,
    SettingChange,
    PortfolioUpdate,
    Transaction,
}

impl ActivityCategory {
    /// Returns true if entries of this category reach the logger.
    #[must_use]
    pub const fn is_forwarded(self) -> bool {
        matches!(self, Self::Login | Self::SettingChange)
    }
}

impl fmt::Display for ActivityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Login => "login",
            Self::SettingChange => "setting_change",
            Self::PortfolioUpdate => "portfolio_update",
            Self::Transaction => "transaction",
        };
        f.write_str(s)
    }
}

/// One activity log entry.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub entity_id: EntityId,
    pub category: ActivityCategory,
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
}

/// Failure reported by an activity logger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Activity log failed: {message}")]
pub struct ActivityError {
    /// Human-readable description.
    pub message: String,
}

/// The activity logging collaborator.
///
/// Called from the dispatch path, so implementations must not block; hand
/// slow work (document writes) to another task.
pub trait ActivityLogger: Send + Sync {
    /// Records one entry.
    fn log(&self, entry: ActivityEntry) -> Result<(), ActivityError>;
}

/// Filters entries to the forwarded categories and swallows logger failures.
pub(crate) fn record(logger: &dyn ActivityLogger, entry: ActivityEntry) {
    if !entry.category.is_forwarded() {
        tracing::trace!(category = %entry.category, "activity category not forwarded");
        return;
    }
    let category = entry.category;
    if let Err(e) = logger.log(entry) {
        tracing::warn!(%category, error = %e, "failed to log activity");
    }
}

/// Writes entries to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLogger;

impl ActivityLogger for TracingActivityLogger {
    fn log(&self, entry: ActivityEntry) -> Result<(), ActivityError> {
        tracing::info!(
            entity_id = %entry.entity_id,
            category = %entry.category,
            platform = %entry.platform,
            "{}",
            entry.description
        );
        Ok(())
    }
}

/// Keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryActivityLogger {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl MemoryActivityLogger {
    /// Creates an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().clone()
    }
}

impl ActivityLogger for MemoryActivityLogger {
    fn log(&self, entry: ActivityEntry) -> Result<(), ActivityError> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

/// Hands entries to a persistence worker through a bounded queue.
///
/// Never blocks: when the queue is full the entry is dropped and counted.
#[derive(Debug)]
pub struct QueueActivityLogger {
    tx: Sender<ActivityEntry>,
    dropped: AtomicU64,
}

impl QueueActivityLogger {
    /// Creates the logger and the receiving end for the worker.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Receiver<ActivityEntry>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Entries dropped because the queue was full or the worker went away.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ActivityLogger for QueueActivityLogger {
    fn log(&self, entry: ActivityEntry) -> Result<(), ActivityError> {
        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ActivityError {
                    message: "activity queue full".to_string(),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ActivityError {
                    message: "activity worker disconnected".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: ActivityCategory) -> ActivityEntry {
        ActivityEntry {
            entity_id: EntityId::new("u1").unwrap(),
            category,
            description: "d".to_string(),
            metadata: Map::new(),
            timestamp: Utc::now(),
            platform: "test".to_string(),
        }
    }

    struct FailingLogger;

    impl ActivityLogger for FailingLogger {
        fn log(&self, _entry: ActivityEntry) -> Result<(), ActivityError> {
            Err(ActivityError {
                message: "down".to_string(),
            })
        }
    }

    #[test]
    fn test_only_login_and_setting_change_forwarded() {
        let logger = MemoryActivityLogger::new();
        for category in [
            ActivityCategory::Login,
            ActivityCategory::SettingChange,
            ActivityCategory::PortfolioUpdate,
            ActivityCategory::Transaction,
        ] {
            record(&logger, entry(category));
        }
        let categories: Vec<_> = logger.entries().into_iter().map(|e| e.category).collect();
        assert_eq!(categories, vec![ActivityCategory::Login, ActivityCategory::SettingChange]);
    }

    #[test]
    fn test_logger_failure_is_swallowed() {
        record(&FailingLogger, entry(ActivityCategory::Login));
    }

    #[test]
    fn test_queue_logger_counts_drops() {
        let (logger, rx) = QueueActivityLogger::new(1);
        logger.log(entry(ActivityCategory::Login)).unwrap();
        assert!(logger.log(entry(ActivityCategory::Login)).is_err());
        assert_eq!(logger.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().category, ActivityCategory::Login);

        drop(rx);
        assert!(logger.log(entry(ActivityCategory::Login)).is_err());
        assert_eq!(logger.dropped(), 2);
    }

    #[test]
    fn test_category_serde_names() {
        assert_eq!(
            serde_json::to_string(&ActivityCategory::SettingChange).unwrap(),
            "\"setting_change\""
        );
        assert_eq!(ActivityCategory::PortfolioUpdate.to_string(), "portfolio_update");
    }
}
