//! Where a watcher reads a run's events from

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::store::EventStore;
use super::{EventPage, Result, RunStatus, TelemetryError};

/// Paged access to a run's event log plus its current status
///
/// Implemented by the local [`EventStore`] (inside the runner) and by
/// [`HttpEventSource`] (from a CLI or another host).
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_page(&self, run_id: &str, since: u64, limit: usize) -> Result<EventPage>;

    async fn status(&self, run_id: &str) -> Result<Option<RunStatus>>;
}

#[async_trait]
impl EventSource for EventStore {
    async fn fetch_page(&self, run_id: &str, since: u64, limit: usize) -> Result<EventPage> {
        let store = self.clone();
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || store.fetch_page(&run_id, since, limit))
            .await
            .map_err(|e| TelemetryError::Task(e.to_string()))?
    }

    async fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let store = self.clone();
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || EventStore::status(&store, &run_id))
            .await
            .map_err(|e| TelemetryError::Task(e.to_string()))?
    }
}

/// Client for a runner's event API
#[derive(Clone)]
pub struct HttpEventSource {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpEventSource {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - The runner API root (e.g., "http://127.0.0.1:9090")
    /// * `token` - Bearer token sent with every request, if the API wants one
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Turn a non-2xx response into [`TelemetryError::Status`]
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TelemetryError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn fetch_page(&self, run_id: &str, since: u64, limit: usize) -> Result<EventPage> {
        let response = self
            .get(&format!("/api/runs/{}/events", run_id))
            .query(&[("since", since.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        let response = self
            .get(&format!("/api/runs/{}/status", run_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }
}

/// Full pages keyed by `(run, since, limit)`
///
/// A full page can never change (events are append-only and numbered), so
/// it is safe to keep. Short pages are the live tail and are never cached.
#[derive(Default)]
pub struct PageCache {
    pages: Mutex<HashMap<(String, u64, usize), EventPage>>,
}

impl PageCache {
    fn pages(&self) -> MutexGuard<'_, HashMap<(String, u64, usize), EventPage>> {
        self.pages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, run_id: &str, since: u64, limit: usize) -> Option<EventPage> {
        self.pages().get(&(run_id.to_string(), since, limit)).cloned()
    }

    /// Keep `page` if it is full; returns whether it was kept
    pub fn insert(&self, run_id: &str, since: u64, limit: usize, page: &EventPage) -> bool {
        if page.events.len() < limit {
            return false;
        }
        self.pages()
            .insert((run_id.to_string(), since, limit), page.clone());
        true
    }

    /// Forget a finished run
    pub fn evict(&self, run_id: &str) {
        self.pages().retain(|(run, _, _), _| run != run_id);
    }

    pub fn len(&self) -> usize {
        self.pages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An [`EventSource`] that answers repeated full-page reads from memory
pub struct CachedEventSource<S> {
    inner: S,
    cache: Arc<PageCache>,
}

impl<S: EventSource> CachedEventSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: Arc::new(PageCache::default()),
        }
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }
}

#[async_trait]
impl<S: EventSource> EventSource for CachedEventSource<S> {
    async fn fetch_page(&self, run_id: &str, since: u64, limit: usize) -> Result<EventPage> {
        if let Some(page) = self.cache.get(run_id, since, limit) {
            return Ok(page);
        }
        let page = self.inner.fetch_page(run_id, since, limit).await?;
        self.cache.insert(run_id, since, limit, &page);
        Ok(page)
    }

    async fn status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        self.inner.status(run_id).await
    }
}
