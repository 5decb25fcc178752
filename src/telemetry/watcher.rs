//! Following a run until it reaches a terminal status
//!
//! Two producers feed one merge loop: a polling producer that pages through
//! the event log and checks the run status, and (inside the runner) a
//! realtime producer subscribed to the run's channel. The merge loop drops
//! duplicates by sequence number, warns on gaps and keeps advancing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::realtime::{RealtimeHub, RealtimeMessage, RecvError, Subscription};
use super::source::EventSource;
use super::{Result, RunStatus, TelemetryEvent};
use crate::config::TelemetryConfig;
use crate::metrics::TELEMETRY_GAPS;

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub page_size: usize,
    pub poll_interval: Duration,
    /// Ceiling for the doubling backoff after failed polls
    pub max_backoff: Duration,
    pub rewind: Duration,
}

impl WatchSettings {
    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            rewind: Duration::from_secs(config.rewind_secs),
        }
    }

    /// Delay after `failures` consecutive failed polls
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.poll_interval;
        }
        self.poll_interval
            .saturating_mul(1u32 << failures.min(16))
            .min(self.max_backoff)
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    Fresh,
    Duplicate,
    Gap { expected: u64, got: u64 },
}

/// Next-expected sequence bookkeeping for one run
#[derive(Debug)]
pub struct SequenceTracker {
    run_id: String,
    next_expected: u64,
    gaps: u64,
}

impl SequenceTracker {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            next_expected: 0,
            gaps: 0,
        }
    }

    /// Classify `seq` and advance past it
    ///
    /// A gap is only a warning: the tracker jumps ahead and later arrivals
    /// from the hole count as duplicates.
    pub fn observe(&mut self, seq: u64) -> SeqCheck {
        if seq < self.next_expected {
            return SeqCheck::Duplicate;
        }
        if seq == self.next_expected {
            self.next_expected += 1;
            return SeqCheck::Fresh;
        }

        let expected = self.next_expected;
        self.gaps += 1;
        self.next_expected = seq + 1;
        TELEMETRY_GAPS.inc();
        warn!(run_id = %self.run_id, expected, got = seq, missing = seq - expected, "telemetry sequence gap");
        SeqCheck::Gap { expected, got: seq }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Event(TelemetryEvent),
    Terminal(RunStatus),
}

/// How a watch ended
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchOutcome {
    /// `None` when cancelled (or the consumer went away) first
    pub status: Option<RunStatus>,
    pub delivered: u64,
    pub gaps: u64,
}

enum Produced {
    Events(Vec<TelemetryEvent>),
    Terminal(RunStatus),
}

pub struct RunWatcher {
    run_id: String,
    source: Arc<dyn EventSource>,
    hub: Option<RealtimeHub>,
    settings: WatchSettings,
}

impl RunWatcher {
    pub fn new(run_id: impl Into<String>, source: Arc<dyn EventSource>, settings: WatchSettings) -> Self {
        Self {
            run_id: run_id.into(),
            source,
            hub: None,
            settings,
        }
    }

    /// Also follow the run's realtime channel
    pub fn with_realtime(mut self, hub: RealtimeHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Run in a background task, streaming into the returned receiver
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<WatchEvent>, JoinHandle<WatchOutcome>) {
        let (tx, rx) = mpsc::channel(256);
        let handle = tokio::spawn(self.run(tx, cancel));
        (rx, handle)
    }

    /// Deliver events in sequence order until a terminal status or `cancel`
    pub async fn run(self, out: mpsc::Sender<WatchEvent>, cancel: CancellationToken) -> WatchOutcome {
        let producers = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(64);

        // Subscribe before polling starts so nothing published in between is lost
        if let Some(hub) = &self.hub {
            let subscription = hub.subscribe(&self.run_id, self.settings.rewind);
            tokio::spawn(realtime_producer(
                self.run_id.clone(),
                subscription,
                tx.clone(),
                producers.clone(),
            ));
        }
        tokio::spawn(poll_producer(
            self.run_id.clone(),
            Arc::clone(&self.source),
            self.settings.clone(),
            tx,
            producers.clone(),
        ));

        let mut tracker = SequenceTracker::new(&self.run_id);
        let mut delivered = 0u64;
        let status = 'watch: loop {
            let produced = tokio::select! {
                _ = cancel.cancelled() => break None,
                produced = rx.recv() => match produced {
                    Some(p) => p,
                    None => break None,
                },
            };

            match produced {
                Produced::Events(events) => {
                    for event in events {
                        if tracker.observe(event.sequence_number) == SeqCheck::Duplicate {
                            continue;
                        }
                        if out.send(WatchEvent::Event(event)).await.is_err() {
                            break 'watch None;
                        }
                        delivered += 1;
                    }
                }
                Produced::Terminal(status) => {
                    let _ = out.send(WatchEvent::Terminal(status.clone())).await;
                    break Some(status);
                }
            }
        };
        producers.cancel();

        debug!(
            run_id = %self.run_id,
            delivered,
            gaps = tracker.gaps(),
            terminal = status.as_ref().map(|s| s.state.as_str()).unwrap_or("none"),
            "watch finished"
        );
        WatchOutcome {
            status,
            delivered,
            gaps: tracker.gaps(),
        }
    }
}

async fn realtime_producer(
    run_id: String,
    mut subscription: Subscription,
    tx: mpsc::Sender<Produced>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = subscription.recv() => message,
        };
        let produced = match message {
            Ok(RealtimeMessage::Events(events)) => Produced::Events(events),
            Ok(RealtimeMessage::Status(status)) if status.is_terminal() => Produced::Terminal(status),
            Ok(RealtimeMessage::Status(_)) => continue,
            // the tracker reports the hole once later events arrive
            Err(RecvError::Lagged(skipped)) => {
                warn!(%run_id, skipped, "realtime subscriber lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if tx.send(produced).await.is_err() {
            return;
        }
    }
}

enum Poll {
    Pending,
    Terminal(RunStatus),
    /// The merge loop is gone
    Closed,
}

async fn poll_producer(
    run_id: String,
    source: Arc<dyn EventSource>,
    settings: WatchSettings,
    tx: mpsc::Sender<Produced>,
    cancel: CancellationToken,
) {
    let mut since = 0u64;
    let mut failures = 0u32;

    loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => return,
            step = poll_once(source.as_ref(), &run_id, &mut since, settings.page_size, &tx) => step,
        };
        let delay = match step {
            Ok(Poll::Terminal(status)) => {
                let _ = tx.send(Produced::Terminal(status)).await;
                return;
            }
            Ok(Poll::Closed) => return,
            Ok(Poll::Pending) => {
                failures = 0;
                settings.poll_interval
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = settings.backoff(failures);
                warn!(%run_id, error = %e, failures, retry_ms = delay.as_millis() as u64, "telemetry poll failed");
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn poll_once(
    source: &dyn EventSource,
    run_id: &str,
    since: &mut u64,
    limit: usize,
    tx: &mpsc::Sender<Produced>,
) -> Result<Poll> {
    if !drain(source, run_id, since, limit, tx).await? {
        return Ok(Poll::Closed);
    }
    match source.status(run_id).await? {
        Some(status) if status.is_terminal() => {
            // events stored between the last page and the status change
            if !drain(source, run_id, since, limit, tx).await? {
                return Ok(Poll::Closed);
            }
            Ok(Poll::Terminal(status))
        }
        _ => Ok(Poll::Pending),
    }
}

/// Fetch pages until caught up; `false` once the receiver is gone
async fn drain(
    source: &dyn EventSource,
    run_id: &str,
    since: &mut u64,
    limit: usize,
    tx: &mpsc::Sender<Produced>,
) -> Result<bool> {
    loop {
        let page = source.fetch_page(run_id, *since, limit).await?;
        *since = page.next_since(*since);
        let has_more = page.has_more;
        if !page.events.is_empty() && tx.send(Produced::Events(page.events)).await.is_err() {
            return Ok(false);
        }
        if !has_more {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::telemetry::store::{EventStore, IncomingEvent};
    use crate::telemetry::{EventPage, RunState, TelemetryError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings() -> WatchSettings {
        WatchSettings {
            page_size: 2,
            poll_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            rewind: Duration::from_secs(120),
        }
    }

    fn store_with(n: usize) -> EventStore {
        let store = EventStore::new(Database::open_in_memory().unwrap());
        let events: Vec<_> = (0..n).map(|_| IncomingEvent::new("step", serde_json::Value::Null)).collect();
        store.append("r1", &events).unwrap();
        store
    }

    /// Fails the first `failures` page reads
    struct Flaky {
        store: EventStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl EventSource for Flaky {
        async fn fetch_page(&self, run_id: &str, since: u64, limit: usize) -> Result<EventPage> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(TelemetryError::Invalid("transient".into()));
            }
            EventSource::fetch_page(&self.store, run_id, since, limit).await
        }

        async fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
            EventSource::status(&self.store, run_id).await
        }
    }

    #[test]
    fn test_tracker_classifies() {
        let mut t = SequenceTracker::new("r1");
        assert_eq!(t.observe(0), SeqCheck::Fresh);
        assert_eq!(t.observe(0), SeqCheck::Duplicate);
        assert_eq!(t.observe(1), SeqCheck::Fresh);
        assert_eq!(t.observe(4), SeqCheck::Gap { expected: 2, got: 4 });
        assert_eq!(t.observe(3), SeqCheck::Duplicate);
        assert_eq!(t.observe(5), SeqCheck::Fresh);
        assert_eq!(t.gaps(), 1);
        assert_eq!(t.next_expected(), 6);
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let s = settings();
        assert_eq!(s.backoff(0), Duration::from_millis(100));
        assert_eq!(s.backoff(1), Duration::from_millis(200));
        assert_eq!(s.backoff(2), Duration::from_millis(400));
        assert_eq!(s.backoff(10), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_pages_through_and_stops_on_terminal() {
        let store = store_with(5);
        store.set_status("r1", RunState::Completed, None).unwrap();

        let watcher = RunWatcher::new("r1", Arc::new(store), settings());
        let (mut rx, handle) = watcher.spawn(CancellationToken::new());

        let mut seqs = Vec::new();
        let mut terminal = None;
        while let Some(item) = rx.recv().await {
            match item {
                WatchEvent::Event(e) => seqs.push(e.sequence_number),
                WatchEvent::Terminal(s) => terminal = Some(s.state),
            }
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(terminal, Some(RunState::Completed));
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.delivered, 5);
        assert_eq!(outcome.gaps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_survives_transient_errors() {
        let store = store_with(1);
        store.set_status("r1", RunState::Failed, Some("exit 1")).unwrap();
        let source = Flaky {
            store,
            failures: AtomicU32::new(3),
        };

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = RunWatcher::new("r1", Arc::new(source), settings())
            .run(tx, CancellationToken::new())
            .await;

        assert_eq!(outcome.status.map(|s| s.state), Some(RunState::Failed));
        assert!(matches!(rx.recv().await, Some(WatchEvent::Event(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_unfinished_watch() {
        let store = store_with(0);
        let cancel = CancellationToken::new();
        let (_rx, handle) = RunWatcher::new("r1", Arc::new(store), settings()).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert!(outcome.status.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_and_polling_do_not_duplicate() {
        let store = store_with(3);
        let hub = RealtimeHub::new(Duration::from_secs(120));
        let page = store.fetch_page("r1", 0, 10).unwrap();
        hub.publish_events("r1", page.events);

        let status = store.set_status("r1", RunState::Completed, None).unwrap().unwrap();
        hub.publish_status("r1", status);

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = RunWatcher::new("r1", Arc::new(store), settings())
            .with_realtime(hub)
            .run(tx, CancellationToken::new())
            .await;

        assert_eq!(outcome.delivered, 3);
        assert_eq!(outcome.gaps, 0);
        let mut count = 0;
        while let Ok(WatchEvent::Event(_)) = rx.try_recv() {
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
