//! Runner HTTP API
//!
//! Control plane side (server token): job submission, event pages, run
//! status and the realtime stream. VM side (sandbox token): telemetry
//! ingress and job completion. Open: pool status and prometheus metrics.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::network::registry::tokens_match;
use crate::network::{Registration, RegistryError, VmRegistry};
use crate::queue::{JobLease, JobQueue, QueueError};
use crate::telemetry::realtime::{RealtimeMessage, RecvError};
use crate::telemetry::store::TelemetryPayload;
use crate::telemetry::{EventStore, RealtimeHub, RunState, RunStatus, TelemetryError};
use crate::vm::{PoolStats, VmPool};

#[derive(Clone)]
pub struct ApiState {
    pub queue: JobQueue,
    pub store: EventStore,
    pub hub: RealtimeHub,
    pub registry: VmRegistry,
    /// Absent for API-only processes (tests, tooling)
    pub pool: Option<Arc<VmPool>>,
    pub server_token: Arc<str>,
    pub runner_group: String,
    pub lease_ttl: Duration,
    pub page_size: usize,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing or unknown token".to_string()),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => {
                warn!(error = %m, "api request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Duplicate(_) => ApiError::Conflict(e.to_string()),
            QueueError::Invalid(_) => ApiError::BadRequest(e.to_string()),
            QueueError::Contention(_) => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        match e {
            TelemetryError::Invalid(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Create the runner API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/jobs", post(submit_job))
        .route("/api/webhooks/agent/telemetry", post(ingest_telemetry))
        .route("/api/webhooks/agent/complete", post(complete_job))
        .route("/api/runs/:run_id/events", get(run_events))
        .route("/api/runs/:run_id/status", get(run_status))
        .route("/api/runs/:run_id/stream", get(run_stream))
        .route("/api/status", get(runner_status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn serve(listener: TcpListener, state: ApiState, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "runner api listening");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

/// Run a store call off the async workers
async fn blocking<T, E, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("store task failed: {}", e)))?
        .map_err(Into::into)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn require_server(state: &ApiState, headers: &HeaderMap) -> ApiResult<()> {
    match bearer(headers) {
        Some(token) if tokens_match(&state.server_token, token) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// The sandbox token must belong to the VM registered for `run_id`
async fn require_sandbox(state: &ApiState, headers: &HeaderMap, run_id: &str) -> ApiResult<Registration> {
    let token = bearer(headers).ok_or(ApiError::Unauthorized)?.to_string();
    let registry = state.registry.clone();
    let registration = blocking(move || registry.lookup_token(&token))
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if registration.run_id != run_id {
        warn!(
            run_id,
            token_run_id = %registration.run_id,
            address = %registration.address,
            "sandbox token used for another run"
        );
        return Err(ApiError::Forbidden("token does not belong to this run".into()));
    }
    Ok(registration)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJob {
    pub run_id: String,
    #[serde(default)]
    pub runner_group: Option<String>,
    #[serde(default)]
    pub execution_context: serde_json::Value,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

async fn submit_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(job): Json<SubmitJob>,
) -> ApiResult<(StatusCode, Json<JobLease>)> {
    require_server(&state, &headers)?;
    let group = job.runner_group.unwrap_or_else(|| state.runner_group.clone());
    let ttl = job.ttl_secs.map(Duration::from_secs).unwrap_or(state.lease_ttl);

    let queue = state.queue.clone();
    let lease = blocking(move || queue.enqueue(&job.run_id, &group, &job.execution_context, ttl)).await?;
    Ok((StatusCode::CREATED, Json(lease)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    accepted: usize,
    records: usize,
    last_sequence: Option<u64>,
}

async fn ingest_telemetry(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(payload): Json<TelemetryPayload>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    require_sandbox(&state, &headers, &payload.run_id).await?;
    let (store, hub) = (state.store.clone(), state.hub.clone());
    let summary = blocking(move || {
        store.ingest_then(&payload, |events| {
            hub.publish_events(&payload.run_id, events.to_vec());
        })
    })
    .await?;
    let response = IngestResponse {
        accepted: summary.events.len(),
        records: summary.records,
        last_sequence: summary.events.last().map(|e| e.sequence_number),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub run_id: String,
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

impl Completion {
    fn outcome(&self) -> (RunState, Option<String>) {
        match (&self.error, self.exit_code) {
            (None, 0) => (RunState::Completed, None),
            (Some(error), _) => (RunState::Failed, Some(error.clone())),
            (None, code) => (RunState::Failed, Some(format!("exit code {}", code))),
        }
    }
}

async fn complete_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(completion): Json<Completion>,
) -> ApiResult<Json<RunStatus>> {
    require_sandbox(&state, &headers, &completion.run_id).await?;
    let (run_state, detail) = completion.outcome();
    let run_id = completion.run_id.clone();
    info!(run_id = %run_id, exit_code = completion.exit_code, state = %run_state, "agent reported completion");

    let store = state.store.clone();
    let id = run_id.clone();
    let updated = blocking(move || store.set_status(&id, run_state, detail.as_deref())).await?;
    match updated {
        Some(status) => {
            state.hub.publish_status(&run_id, status.clone());
            Ok(Json(status))
        }
        None => {
            // already terminal; report what stuck
            let store = state.store.clone();
            let current = blocking(move || store.status(&run_id)).await?;
            current
                .map(Json)
                .ok_or_else(|| ApiError::Internal("run status vanished".into()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    since: Option<u64>,
    limit: Option<usize>,
}

async fn run_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    require_server(&state, &headers)?;
    let since = query.since.unwrap_or(0);
    let limit = query.limit.unwrap_or(state.page_size);
    let store = state.store.clone();
    let page = blocking(move || store.fetch_page(&run_id, since, limit)).await?;
    Ok(Json(page))
}

async fn run_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunStatus>> {
    require_server(&state, &headers)?;
    let store = state.store.clone();
    let id = run_id.clone();
    blocking(move || store.status(&id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no status for run {}", run_id)))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    rewind_secs: Option<u64>,
}

fn sse_event<T: Serialize>(kind: &str, data: &T) -> Event {
    Event::default()
        .event(kind)
        .json_data(data)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

fn message_event(message: &RealtimeMessage) -> Event {
    match message {
        RealtimeMessage::Events(events) => sse_event("events", events),
        RealtimeMessage::Status(status) => sse_event("status", status),
    }
}

/// Realtime stream of a run as server-sent events
///
/// Ends after the terminal status. A subscriber that falls behind gets a
/// `gap` event and should re-read the missed range with the events API.
async fn run_stream(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    require_server(&state, &headers)?;
    let rewind = query
        .rewind_secs
        .map(Duration::from_secs)
        .unwrap_or(state.hub.retention());

    let mut subscription = state.hub.subscribe(&run_id, rewind);
    let store = state.store.clone();
    let id = run_id.clone();
    let finished = blocking(move || store.status(&id))
        .await?
        .filter(RunStatus::is_terminal);

    let stream = async_stream::stream! {
        if let Some(status) = finished {
            yield Ok::<_, Infallible>(sse_event("status", &status));
        } else {
            loop {
                match subscription.recv().await {
                    Ok(message) => {
                        let terminal = message.is_terminal();
                        yield Ok::<_, Infallible>(message_event(&message));
                        if terminal {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        yield Ok::<_, Infallible>(sse_event("gap", &json!({ "skipped": skipped })));
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        debug!(run_id = %run_id, "realtime stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunnerStatus {
    runner_group: String,
    pending_jobs: usize,
    registered_vms: usize,
    pool: Option<PoolStats>,
}

async fn runner_status(State(state): State<ApiState>) -> ApiResult<Json<RunnerStatus>> {
    let queue = state.queue.clone();
    let group = state.runner_group.clone();
    let pending_jobs = blocking(move || queue.pending_count(&group)).await?;
    let registry = state.registry.clone();
    let registered_vms = blocking(move || registry.list()).await?.len();
    let pool = match &state.pool {
        Some(pool) => Some(pool.stats().await),
        None => None,
    };

    Ok(Json(RunnerStatus {
        runner_group: state.runner_group.clone(),
        pending_jobs,
        registered_vms,
        pool,
    }))
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::network::VmPolicy;
    use std::net::{Ipv4Addr, SocketAddr};

    const SERVER_TOKEN: &str = "srv-token";

    struct TestApi {
        base: String,
        state: ApiState,
        client: reqwest::Client,
        _cancel: tokio_util::sync::DropGuard,
    }

    async fn start() -> TestApi {
        let db = Database::open_in_memory().unwrap();
        let state = ApiState {
            queue: JobQueue::new(db.clone()),
            store: EventStore::new(db.clone()),
            hub: RealtimeHub::new(Duration::from_secs(120)),
            registry: VmRegistry::sqlite(db),
            pool: None,
            server_token: Arc::from(SERVER_TOKEN),
            runner_group: "acme/default".into(),
            lease_ttl: Duration::from_secs(600),
            page_size: 100,
        };
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, state.clone(), cancel.clone()));
        TestApi {
            base,
            state,
            client: reqwest::Client::new(),
            _cancel: cancel.drop_guard(),
        }
    }

    fn register(api: &TestApi, run_id: &str, token: &str, last_octet: u8) {
        api.state
            .registry
            .register(Ipv4Addr::new(10, 200, 0, last_octet), run_id, token, VmPolicy::default())
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_requires_server_token() {
        let api = start().await;
        let body = json!({ "runId": "r1", "executionContext": { "prompt": "hi" } });

        let denied = api
            .client
            .post(format!("{}/api/jobs", api.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 401);

        let created = api
            .client
            .post(format!("{}/api/jobs", api.base))
            .bearer_auth(SERVER_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);
        assert_eq!(api.state.queue.pending_count("acme/default").unwrap(), 1);

        let duplicate = api
            .client
            .post(format!("{}/api/jobs", api.base))
            .bearer_auth(SERVER_TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), 409);
    }

    #[tokio::test]
    async fn test_telemetry_token_must_match_run() {
        let api = start().await;
        register(&api, "r1", "tok-1", 2);
        register(&api, "r2", "tok-2", 6);
        let payload = json!({ "runId": "r1", "events": [{ "eventType": "start" }] });

        let wrong_run = api
            .client
            .post(format!("{}/api/webhooks/agent/telemetry", api.base))
            .bearer_auth("tok-2")
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_run.status(), 403);

        let unknown = api
            .client
            .post(format!("{}/api/webhooks/agent/telemetry", api.base))
            .bearer_auth("nope")
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), 401);

        let accepted = api
            .client
            .post(format!("{}/api/webhooks/agent/telemetry", api.base))
            .bearer_auth("tok-1")
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), 202);
        let body: serde_json::Value = accepted.json().await.unwrap();
        assert_eq!(body["accepted"], 1);
        assert_eq!(body["lastSequence"], 0);
    }

    #[tokio::test]
    async fn test_completion_sets_status_once() {
        let api = start().await;
        register(&api, "r1", "tok-1", 2);

        let done: RunStatus = api
            .client
            .post(format!("{}/api/webhooks/agent/complete", api.base))
            .bearer_auth("tok-1")
            .json(&json!({ "runId": "r1", "exitCode": 2 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(done.state, RunState::Failed);
        assert_eq!(done.detail.as_deref(), Some("exit code 2"));

        let again: RunStatus = api
            .client
            .post(format!("{}/api/webhooks/agent/complete", api.base))
            .bearer_auth("tok-1")
            .json(&json!({ "runId": "r1", "exitCode": 0 }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(again.state, RunState::Failed);

        let status = api
            .client
            .get(format!("{}/api/runs/r1/status", api.base))
            .bearer_auth(SERVER_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(status.status(), 200);
        let missing = api
            .client
            .get(format!("{}/api/runs/r9/status", api.base))
            .bearer_auth(SERVER_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_events_are_paged() {
        let api = start().await;
        register(&api, "r1", "tok-1", 2);
        let events: Vec<_> = (0..3).map(|i| json!({ "eventType": "step", "payload": i })).collect();
        api.client
            .post(format!("{}/api/webhooks/agent/telemetry", api.base))
            .bearer_auth("tok-1")
            .json(&json!({ "runId": "r1", "events": events }))
            .send()
            .await
            .unwrap();

        let page: serde_json::Value = api
            .client
            .get(format!("{}/api/runs/r1/events?since=1&limit=1", api.base))
            .bearer_auth(SERVER_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(page["events"][0]["sequenceNumber"], 1);
        assert_eq!(page["hasMore"], true);
    }

    #[tokio::test]
    async fn test_metrics_and_status_are_open() {
        let api = start().await;
        let metrics = api.client.get(format!("{}/metrics", api.base)).send().await.unwrap();
        assert_eq!(metrics.status(), 200);

        let status: serde_json::Value = api
            .client
            .get(format!("{}/api/status", api.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["runnerGroup"], "acme/default");
        assert!(status["pool"].is_null());
    }
}
