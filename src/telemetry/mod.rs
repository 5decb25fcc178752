//! Telemetry & Event Relay
//!
//! The VM posts its events, metrics and logs to the runner's ingress
//! endpoint. Events get a per-run sequence number and are persisted in the
//! event store; consumers follow a run either by polling pages or through a
//! realtime subscription with a rewind window.
//!
//! ```text
//!   VM ──POST telemetry──► EventStore::ingest ──► sqlite (events, records)
//!                                │
//!                                └──publish──► RealtimeHub (per-run channel)
//!
//!   RunWatcher
//!     ├─ polling producer  : EventSource::fetch_page / status
//!     └─ realtime producer : RealtimeHub::subscribe
//!              │ both
//!              ▼
//!     merge loop + SequenceTracker ──► WatchEvent stream (until terminal)
//! ```

pub mod realtime;
pub mod source;
pub mod store;
pub mod watcher;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use realtime::{RealtimeHub, RealtimeMessage, Subscription};
pub use source::{CachedEventSource, EventSource, HttpEventSource, PageCache};
pub use store::{EventStore, IngestSummary, TelemetryPayload, TelemetryRecord};
pub use watcher::{RunWatcher, SeqCheck, SequenceTracker, WatchEvent, WatchSettings};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("telemetry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("telemetry server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid telemetry payload: {0}")]
    Invalid(String),

    #[error("store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// One agent event, numbered per run from zero
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub run_id: String,
    pub sequence_number: u64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A slice of a run's event log
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<TelemetryEvent>,
    pub has_more: bool,
}

impl EventPage {
    /// Sequence number to ask for after this page
    pub fn next_since(&self, since: u64) -> u64 {
        self.events
            .last()
            .map(|e| e.sequence_number + 1)
            .unwrap_or(since)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            "timeout" => Ok(RunState::Timeout),
            other => Err(TelemetryError::Invalid(format!("unknown run state {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_round_trip() {
        for state in [RunState::Running, RunState::Completed, RunState::Failed, RunState::Timeout] {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("done".parse::<RunState>().is_err());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Timeout.is_terminal());
    }

    #[test]
    fn test_next_since_of_empty_page() {
        assert_eq!(EventPage::default().next_since(7), 7);
    }
}
