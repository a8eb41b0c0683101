//! Command counters for the status snapshot.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time copy of the channel's command counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Commands that completed successfully.
    pub total: u64,
    /// Successful completions per command name.
    pub by_command: BTreeMap<String, u64>,
    /// Frames that were malformed or could not be correlated.
    pub dropped_replies: u64,
    pub last_command_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct CommandStats {
    inner: Mutex<StatsSnapshot>,
}

impl CommandStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, command: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.total += 1;
        *inner.by_command.entry(command.to_string()).or_insert(0) += 1;
        inner.last_command_at = Some(Utc::now());
    }

    pub fn record_dropped(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped_replies += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
