//! Durable event log, run status and telemetry records
//!
//! Sequence numbers are assigned here, inside the insert transaction, so
//! they are gapless per run no matter how many ingress requests race.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{EventPage, Result, RunState, RunStatus, TelemetryError, TelemetryEvent};
use crate::db::{dt_to_ms, ms_to_dt, Database};
use crate::metrics::TELEMETRY_EVENTS;
use crate::proxy::log::{NetworkLogEntry, NetworkLogSink};

/// Largest page `fetch_page` hands out
pub const MAX_PAGE_SIZE: usize = 1000;

pub const RECORD_METRICS: &str = "metrics";
pub const RECORD_SYSTEM_LOG: &str = "system_log";
pub const RECORD_NETWORK: &str = "network";

/// Body of `POST /api/webhooks/agent/telemetry`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub run_id: String,
    #[serde(default)]
    pub events: Vec<IncomingEvent>,
    #[serde(default)]
    pub metrics: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_log: Option<String>,
    #[serde(default)]
    pub network_logs: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEvent {
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl IncomingEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    /// Stored events with their assigned sequence numbers
    pub events: Vec<TelemetryEvent>,
    pub records: usize,
}

/// Metrics samples, system log chunks and network log entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub id: i64,
    pub run_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventStore {
    db: Database,
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one ingress payload atomically
    pub fn ingest(&self, payload: &TelemetryPayload) -> Result<IngestSummary> {
        self.ingest_then(payload, |_| {})
    }

    /// [`ingest`](Self::ingest), calling `publish` with the stored events
    /// after commit but before the next writer may number its own
    ///
    /// Whatever `publish` forwards to therefore sees every run's events in
    /// sequence order.
    pub fn ingest_then<F>(&self, payload: &TelemetryPayload, publish: F) -> Result<IngestSummary>
    where
        F: FnOnce(&[TelemetryEvent]),
    {
        if payload.run_id.trim().is_empty() {
            return Err(TelemetryError::Invalid("runId is empty".into()));
        }
        let run_id = payload.run_id.as_str();
        let now = Utc::now();

        let mut records: Vec<(&str, String)> = Vec::new();
        for sample in &payload.metrics {
            records.push((RECORD_METRICS, serde_json::to_string(sample)?));
        }
        if let Some(log) = payload.system_log.as_ref().filter(|l| !l.is_empty()) {
            records.push((RECORD_SYSTEM_LOG, serde_json::to_string(log)?));
        }
        for entry in &payload.network_logs {
            records.push((RECORD_NETWORK, serde_json::to_string(entry)?));
        }

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let events = insert_events(&tx, run_id, &payload.events, now)?;
        for (kind, body) in &records {
            tx.execute(
                "INSERT INTO telemetry_records (run_id, kind, payload, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, kind, body, dt_to_ms(now)],
            )?;
        }
        tx.commit()?;
        publish(&events);
        drop(conn);

        TELEMETRY_EVENTS.inc_by(events.len() as f64);
        debug!(run_id, events = events.len(), records = records.len(), "telemetry ingested");
        Ok(IngestSummary {
            events,
            records: records.len(),
        })
    }

    /// Append events to a run, numbering them after the current tail
    pub fn append(&self, run_id: &str, events: &[IncomingEvent]) -> Result<Vec<TelemetryEvent>> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let stored = insert_events(&tx, run_id, events, Utc::now())?;
        tx.commit()?;
        TELEMETRY_EVENTS.inc_by(stored.len() as f64);
        Ok(stored)
    }

    /// Events with `sequence_number >= since`, oldest first
    pub fn fetch_page(&self, run_id: &str, since: u64, limit: usize) -> Result<EventPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, sequence_number, event_type, payload, created_at_ms
             FROM telemetry_events
             WHERE run_id = ?1 AND sequence_number >= ?2
             ORDER BY sequence_number
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![run_id, since as i64, (limit + 1) as i64], read_event)?;

        let mut events = Vec::with_capacity(limit + 1);
        for row in rows {
            let (event, payload) = row?;
            events.push(TelemetryEvent {
                payload: serde_json::from_str(&payload)?,
                ..event
            });
        }
        let has_more = events.len() > limit;
        events.truncate(limit);
        Ok(EventPage { events, has_more })
    }

    /// Record a state change; terminal states are final
    ///
    /// Returns the stored status, or `None` when the run already reached a
    /// terminal state and the update was ignored.
    pub fn set_status(&self, run_id: &str, state: RunState, detail: Option<&str>) -> Result<Option<RunStatus>> {
        let now = Utc::now();
        let changed = self.db.conn().execute(
            "INSERT INTO run_status (run_id, status, detail, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET
               status = excluded.status,
               detail = excluded.detail,
               updated_at_ms = excluded.updated_at_ms
             WHERE run_status.status = 'running'",
            params![run_id, state.as_str(), detail, dt_to_ms(now)],
        )?;

        if changed == 0 {
            debug!(run_id, state = %state, "run already terminal, status unchanged");
            return Ok(None);
        }
        Ok(Some(RunStatus {
            run_id: run_id.to_string(),
            state,
            detail: detail.map(str::to_string),
            updated_at: ms_to_dt(dt_to_ms(now)),
        }))
    }

    pub fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let raw = self
            .db
            .conn()
            .query_row(
                "SELECT status, detail, updated_at_ms FROM run_status WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(state, detail, updated_at_ms)| {
            Ok(RunStatus {
                run_id: run_id.to_string(),
                state: state.parse()?,
                detail,
                updated_at: ms_to_dt(updated_at_ms),
            })
        })
        .transpose()
    }

    pub fn append_record(&self, run_id: &str, kind: &str, payload: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        self.db.conn().execute(
            "INSERT INTO telemetry_records (run_id, kind, payload, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![run_id, kind, body, dt_to_ms(Utc::now())],
        )?;
        Ok(())
    }

    /// Records of a run in insertion order, optionally of one kind
    pub fn records(&self, run_id: &str, kind: Option<&str>) -> Result<Vec<TelemetryRecord>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, kind, payload, created_at_ms
             FROM telemetry_records
             WHERE run_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id, kind], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, run_id, kind, payload, created_at_ms) = row?;
            out.push(TelemetryRecord {
                id,
                run_id,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at: ms_to_dt(created_at_ms),
            });
        }
        Ok(out)
    }
}

impl NetworkLogSink for EventStore {
    fn record(&self, run_id: &str, entry: &NetworkLogEntry) {
        let stored = serde_json::to_value(entry)
            .map_err(TelemetryError::from)
            .and_then(|value| self.append_record(run_id, RECORD_NETWORK, &value));
        if let Err(e) = stored {
            warn!(run_id, error = %e, "failed to store network log entry");
        }
    }
}

fn insert_events(
    tx: &rusqlite::Transaction<'_>,
    run_id: &str,
    events: &[IncomingEvent],
    now: DateTime<Utc>,
) -> Result<Vec<TelemetryEvent>> {
    if events.is_empty() {
        return Ok(Vec::new());
    }
    let next: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence_number) + 1, 0) FROM telemetry_events WHERE run_id = ?1",
        params![run_id],
        |row| row.get(0),
    )?;

    let mut stored = Vec::with_capacity(events.len());
    for (offset, event) in events.iter().enumerate() {
        let sequence_number = next as u64 + offset as u64;
        tx.execute(
            "INSERT INTO telemetry_events (run_id, sequence_number, event_type, payload, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                sequence_number as i64,
                event.event_type,
                serde_json::to_string(&event.payload)?,
                dt_to_ms(now)
            ],
        )?;
        stored.push(TelemetryEvent {
            run_id: run_id.to_string(),
            sequence_number,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at: ms_to_dt(dt_to_ms(now)),
        });
    }
    Ok(stored)
}

fn read_event(row: &Row<'_>) -> rusqlite::Result<(TelemetryEvent, String)> {
    let event = TelemetryEvent {
        run_id: row.get(0)?,
        sequence_number: row.get::<_, i64>(1)? as u64,
        event_type: row.get(2)?,
        payload: serde_json::Value::Null,
        created_at: ms_to_dt(row.get(4)?),
    };
    Ok((event, row.get(3)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::log::ProxyMode;
    use crate::proxy::policy::{evaluate, Destination};
    use crate::telemetry::realtime::{RealtimeHub, RealtimeMessage};
    use serde_json::json;

    fn store() -> EventStore {
        EventStore::new(Database::open_in_memory().unwrap())
    }

    fn events(n: usize) -> Vec<IncomingEvent> {
        (0..n)
            .map(|i| IncomingEvent::new("step", json!({ "i": i })))
            .collect()
    }

    #[test]
    fn test_sequence_numbers_are_gapless_per_run() {
        let store = store();
        let first = store.append("r1", &events(2)).unwrap();
        let other = store.append("r2", &events(1)).unwrap();
        let second = store.append("r1", &events(2)).unwrap();

        let seqs: Vec<u64> = first.iter().chain(&second).map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(other[0].sequence_number, 0);
    }

    #[test]
    fn test_pages_are_monotonic() {
        let store = store();
        store.append("r1", &events(5)).unwrap();

        let page = store.fetch_page("r1", 0, 2).unwrap();
        assert!(page.has_more);
        assert_eq!(page.events.len(), 2);

        let since = page.next_since(0);
        let page = store.fetch_page("r1", since, 2).unwrap();
        assert_eq!(page.events[0].sequence_number, 2);
        assert!(page.has_more);

        let page = store.fetch_page("r1", page.next_since(since), 2).unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].payload, json!({ "i": 4 }));
        assert!(!page.has_more);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let store = store();
        assert!(store.status("r1").unwrap().is_none());
        store.set_status("r1", RunState::Running, None).unwrap();
        let done = store.set_status("r1", RunState::Timeout, Some("deadline")).unwrap();
        assert_eq!(done.unwrap().state, RunState::Timeout);

        assert!(store.set_status("r1", RunState::Completed, None).unwrap().is_none());
        let status = store.status("r1").unwrap().unwrap();
        assert_eq!(status.state, RunState::Timeout);
        assert_eq!(status.detail.as_deref(), Some("deadline"));
    }

    #[test]
    fn test_ingest_splits_payload() {
        let store = store();
        let payload: TelemetryPayload = serde_json::from_value(json!({
            "runId": "r1",
            "events": [{ "eventType": "start" }, { "eventType": "log", "payload": "hi" }],
            "metrics": [{ "cpu": 0.5 }],
            "systemLog": "boot ok",
            "networkLogs": [{ "host": "example.com" }]
        }))
        .unwrap();

        let summary = store.ingest(&payload).unwrap();
        assert_eq!(summary.events.len(), 2);
        assert_eq!(summary.records, 3);
        assert_eq!(store.records("r1", Some(RECORD_METRICS)).unwrap().len(), 1);
        assert_eq!(store.records("r1", None).unwrap().len(), 3);

        let empty = TelemetryPayload::default();
        assert!(matches!(store.ingest(&empty), Err(TelemetryError::Invalid(_))));
    }

    #[test]
    fn test_network_sink_appends_record() {
        let store = store();
        let dest = Destination::host("api.example.com", 443);
        let decision = evaluate(None, &dest);
        let entry = NetworkLogEntry::new("10.200.0.2".parse().unwrap(), &dest, &decision, ProxyMode::Sni);

        store.record("r1", &entry);
        let records = store.records("r1", Some(RECORD_NETWORK)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["host"], "api.example.com");
    }

    #[tokio::test]
    async fn test_concurrent_ingest_publishes_in_sequence_order() {
        let store = store();
        let hub = RealtimeHub::new(std::time::Duration::from_secs(60));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let (store, hub) = (store.clone(), hub.clone());
                scope.spawn(move || {
                    for _ in 0..10 {
                        let payload = TelemetryPayload {
                            run_id: "r1".into(),
                            events: events(2),
                            ..Default::default()
                        };
                        store
                            .ingest_then(&payload, |stored| {
                                hub.publish_events("r1", stored.to_vec());
                            })
                            .unwrap();
                    }
                });
            }
        });

        let mut subscription = hub.subscribe("r1", hub.retention());
        let mut seqs = Vec::new();
        for _ in 0..40 {
            if let RealtimeMessage::Events(batch) = subscription.recv().await.unwrap() {
                seqs.extend(batch.iter().map(|e| e.sequence_number));
            }
        }
        assert_eq!(seqs, (0..80).collect::<Vec<u64>>());
    }
}
