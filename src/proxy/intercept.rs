//! MITM mode: full HTTP/1 interception
//!
//! The VM's connection is served as an HTTP/1 server. Every request is
//! evaluated against the firewall on its own `Host` (keep-alive connections
//! may switch hosts between requests), forwarded upstream, and logged with
//! method, status, latency and a capped, optionally sealed, body capture.
//! Bodies are buffered up to `proxy.max_body_bytes`; larger requests get
//! 413 and larger responses 502.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tracing::debug;

use super::log::{NetworkLogEntry, ProxyMode};
use super::policy::{evaluate, Destination};
use super::seal::SecretMasker;
use super::ProxyContext;
use crate::network::Registration;

pub(crate) type UpstreamClient = Client<HttpConnector, Full<Bytes>>;

pub(crate) fn upstream_client(ctx: &ProxyContext) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(ctx.connect_timeout));
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Headers that describe one hop and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

struct Conn {
    ctx: Arc<ProxyContext>,
    client: UpstreamClient,
    registration: Registration,
    original: Option<SocketAddr>,
    masker: SecretMasker,
}

/// Serve one VM connection in MITM mode until the client closes it
pub(crate) async fn serve(
    ctx: Arc<ProxyContext>,
    client: UpstreamClient,
    stream: TcpStream,
    registration: Registration,
    original: Option<SocketAddr>,
) {
    let masker = SecretMasker::for_policy(&registration.policy);
    let conn = Arc::new(Conn {
        ctx,
        client,
        registration,
        original,
        masker,
    });

    let service = service_fn(move |req| {
        let conn = Arc::clone(&conn);
        async move { Ok::<_, Infallible>(conn.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "intercepted connection closed with error");
    }
}

enum BodyError {
    TooLarge,
    Read(String),
}

impl Conn {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let dest = self.destination(&req);
        let rules = self.registration.policy.firewall_rules.as_deref();

        let mut decision = evaluate(rules, &dest);
        let mut upstream = None;
        if decision.is_allowed() {
            match self.ctx.pin_upstream(rules, &dest).await {
                Ok((addr, allowed)) => {
                    upstream = Some(addr);
                    decision = allowed;
                }
                Err(denied) => decision = denied,
            }
        }

        let mut entry = NetworkLogEntry::new(self.registration.address, &dest, &decision, ProxyMode::Mitm);
        entry.method = Some(req.method().to_string());
        entry.path = Some(req.uri().path().to_string());

        let upstream = match upstream {
            Some(addr) => addr,
            None => {
                entry.status = Some(StatusCode::FORBIDDEN.as_u16());
                self.emit(entry);
                return plain(StatusCode::FORBIDDEN, format!("blocked by egress policy: {}", decision.matched));
            }
        };
        entry.ip = Some(upstream.ip());

        let response = match self.forward(req, upstream, &mut entry).await {
            Ok(response) => response,
            Err((status, message)) => {
                entry.error = Some(message.clone());
                entry.status = Some(status.as_u16());
                plain(status, message)
            }
        };
        entry.latency_ms = Some(started.elapsed().as_millis() as u64);
        self.emit(entry);
        response
    }

    fn emit(&self, entry: NetworkLogEntry) {
        self.ctx.emit(Some(&self.registration.run_id), &self.masker, entry);
    }

    /// Host from the request, port from the pre-NAT destination when known
    fn destination(&self, req: &Request<Incoming>) -> Destination {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            });

        let (hostname, port) = match authority.as_deref().map(split_authority) {
            Some((host, port)) => (Some(host.to_ascii_lowercase()), port),
            None => (None, None),
        };

        Destination {
            ip: self.original.map(|a| a.ip()),
            port: self.original.map(|a| a.port()).or(port).unwrap_or(80),
            hostname: hostname.filter(|h| !h.is_empty()),
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        upstream: SocketAddr,
        entry: &mut NetworkLogEntry,
    ) -> Result<Response<Full<Bytes>>, (StatusCode, String)> {
        let limit = self.ctx.max_body;
        let (parts, body) = req.into_parts();
        let body = collect_limited(body, limit).await.map_err(|e| match e {
            BodyError::TooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {} bytes", limit),
            ),
            BodyError::Read(e) => (StatusCode::BAD_REQUEST, format!("request body read error: {}", e)),
        })?;
        entry.bytes_sent = body.len() as u64;
        if !body.is_empty() {
            entry.request_body = Some(self.masker.mask_capture(&body, self.ctx.max_logged_body));
        }

        // Host header travels unchanged; only the dialed address is pinned
        let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let uri = format!("http://{}{}", upstream, path);

        let mut request = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(Full::new(body))
            .map_err(|e| (StatusCode::BAD_GATEWAY, format!("request build error: {}", e)))?;
        *request.headers_mut() = strip_hop_by_hop(parts.headers);

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| (StatusCode::BAD_GATEWAY, format!("upstream {} failed: {}", uri, e)))?;

        let (mut parts, body) = response.into_parts();
        entry.status = Some(parts.status.as_u16());
        let body = collect_limited(body, limit).await.map_err(|e| match e {
            BodyError::TooLarge => (StatusCode::BAD_GATEWAY, format!("response body exceeds {} bytes", limit)),
            BodyError::Read(e) => (StatusCode::BAD_GATEWAY, format!("response body read error: {}", e)),
        })?;
        entry.bytes_received = body.len() as u64;
        if !body.is_empty() {
            entry.response_body = Some(self.masker.mask_capture(&body, self.ctx.max_logged_body));
        }

        parts.headers = strip_hop_by_hop(parts.headers);
        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

/// Buffer a body, giving up past `limit` bytes
async fn collect_limited<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers
}

fn split_authority(authority: &str) -> (&str, Option<u16>) {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').unwrap_or((rest, ""));
        return (host, tail.strip_prefix(':').and_then(|p| p.parse().ok()));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    }
}

fn plain(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response
}
