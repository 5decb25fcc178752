//! Per-run realtime channels with a rewind window
//!
//! Every published message is kept for the hub's retention window so a
//! subscriber that connects late can replay what it missed. Replay and live
//! delivery are joined under one lock, so nothing is seen twice or skipped
//! at the seam.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{RunStatus, TelemetryEvent};

/// Live messages buffered per subscriber before it lags
const CHANNEL_CAPACITY: usize = 256;

/// Messages kept per run for rewinding, however young
const MAX_HISTORY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RealtimeMessage {
    Events(Vec<TelemetryEvent>),
    Status(RunStatus),
}

impl RealtimeMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RealtimeMessage::Status(s) if s.is_terminal())
    }
}

struct Channel {
    tx: broadcast::Sender<RealtimeMessage>,
    history: VecDeque<(Instant, RealtimeMessage)>,
}

impl Channel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: VecDeque::new(),
        }
    }

    fn prune(&mut self, retention: Duration, now: Instant) {
        while let Some((at, _)) = self.history.front() {
            if now.saturating_duration_since(*at) <= retention {
                break;
            }
            self.history.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.history.is_empty() && self.tx.receiver_count() == 0
    }
}

#[derive(Clone)]
pub struct RealtimeHub {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
    retention: Duration,
}

impl RealtimeHub {
    /// `retention` bounds how far back any subscriber may rewind
    pub fn new(retention: Duration) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish to the run's channel; returns the live subscriber count
    pub fn publish(&self, run_id: &str, message: RealtimeMessage) -> usize {
        let now = Instant::now();
        let mut channels = self.channels();
        channels.retain(|_, ch| {
            ch.prune(self.retention, now);
            !ch.is_idle()
        });

        let channel = channels.entry(run_id.to_string()).or_insert_with(Channel::new);
        channel.history.push_back((now, message.clone()));
        if channel.history.len() > MAX_HISTORY {
            channel.history.pop_front();
        }
        // No receivers is fine; the history still serves late subscribers
        channel.tx.send(message).unwrap_or(0)
    }

    pub fn publish_events(&self, run_id: &str, events: Vec<TelemetryEvent>) -> usize {
        if events.is_empty() {
            return 0;
        }
        self.publish(run_id, RealtimeMessage::Events(events))
    }

    pub fn publish_status(&self, run_id: &str, status: RunStatus) -> usize {
        self.publish(run_id, RealtimeMessage::Status(status))
    }

    /// Subscribe, replaying what was published in the last `rewind`
    pub fn subscribe(&self, run_id: &str, rewind: Duration) -> Subscription {
        let now = Instant::now();
        let rewind = rewind.min(self.retention);
        let mut channels = self.channels();
        let channel = channels.entry(run_id.to_string()).or_insert_with(Channel::new);
        channel.prune(self.retention, now);

        let replay: VecDeque<RealtimeMessage> = channel
            .history
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= rewind)
            .map(|(_, msg)| msg.clone())
            .collect();
        debug!(run_id, replay = replay.len(), "realtime subscriber attached");

        Subscription {
            replay,
            rx: channel.tx.subscribe(),
        }
    }

    /// Drop a run's channel; live subscribers see the stream end
    pub fn close(&self, run_id: &str) {
        self.channels().remove(run_id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The subscriber fell behind and `n` messages were dropped
    Lagged(u64),
    Closed,
}

pub struct Subscription {
    replay: VecDeque<RealtimeMessage>,
    rx: broadcast::Receiver<RealtimeMessage>,
}

impl Subscription {
    /// Next message: rewound history first, then live
    pub async fn recv(&mut self) -> Result<RealtimeMessage, RecvError> {
        if let Some(msg) = self.replay.pop_front() {
            return Ok(msg);
        }
        match self.rx.recv().await {
            Ok(msg) => Ok(msg),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(RecvError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(RecvError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RunState;
    use chrono::Utc;

    fn event(seq: u64) -> TelemetryEvent {
        TelemetryEvent {
            run_id: "r1".into(),
            sequence_number: seq,
            event_type: "step".into(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    fn status(state: RunState) -> RunStatus {
        RunStatus {
            run_id: "r1".into(),
            state,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewind_replays_recent_history_only() {
        let hub = RealtimeHub::new(Duration::from_secs(120));
        hub.publish_events("r1", vec![event(0)]);
        tokio::time::advance(Duration::from_secs(90)).await;
        let recent = event(1);
        hub.publish_events("r1", vec![recent.clone()]);

        let mut sub = hub.subscribe("r1", Duration::from_secs(60));
        hub.publish_status("r1", status(RunState::Completed));

        assert_eq!(sub.recv().await.unwrap(), RealtimeMessage::Events(vec![recent]));
        assert!(sub.recv().await.unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_expires_after_retention() {
        let hub = RealtimeHub::new(Duration::from_secs(120));
        hub.publish_events("r1", vec![event(0)]);
        tokio::time::advance(Duration::from_secs(121)).await;

        // publishing elsewhere prunes the idle channel
        hub.publish_events("r2", vec![event(0)]);
        assert_eq!(hub.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_live_subscribers() {
        let hub = RealtimeHub::new(Duration::from_secs(120));
        let mut sub = hub.subscribe("r1", Duration::ZERO);
        hub.close("r1");
        assert_eq!(sub.recv().await, Err(RecvError::Closed));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let hub = RealtimeHub::new(Duration::from_secs(1));
        let mut sub = hub.subscribe("r1", Duration::ZERO);
        for i in 0..(CHANNEL_CAPACITY as u64 + 10) {
            hub.publish_events("r1", vec![event(i)]);
        }
        assert!(matches!(sub.recv().await, Err(RecvError::Lagged(_))));
    }
}
