//! Network Security Proxy - egress enforcement for every VM
//!
//! All VM TCP egress is REDIRECTed here by the host plumbing. For each
//! connection the proxy recovers the pre-NAT destination, sniffs the
//! hostname, looks the source up in the registry and evaluates its rules.
//!
//! ```text
//!   VM ──tcp──► iptables REDIRECT ──► accept()
//!                                      │ spawn (one task per connection)
//!                                      ▼
//!             SO_ORIGINAL_DST + SNI/Host sniff ──► registry lookup
//!                                      │
//!                  ┌───────── evaluate(rules, destination) ─────────┐
//!                  ▼                    ▼                            ▼
//!                DENY            ALLOW + mitm + HTTP          ALLOW otherwise
//!            close + log       intercept::serve (hyper)     byte relay (SNI-only)
//! ```
//!
//! Unknown sources and lookup failures deny.

pub mod intercept;
pub mod log;
pub mod policy;
pub mod seal;
pub mod sniff;

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::metrics::{PROXY_CONNECTIONS_ACTIVE, PROXY_DECISIONS};
use crate::network::{Registration, VmRegistry};
use self::log::{NetworkLogEntry, NetworkLogSink, ProxyMode};
use self::policy::{evaluate, evaluate_resolved, Decision, Destination, FirewallRule, MatchedRule};
use self::seal::SecretMasker;
use self::sniff::Sniffed;

/// How long the client gets to send its first bytes
const SNIFF_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to bind proxy on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connect to {target} timed out")]
    ConnectTimeout { target: String },

    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// State shared by all connection tasks
pub struct ProxyContext {
    registry: VmRegistry,
    sink: Option<Arc<dyn NetworkLogSink>>,
    pub(crate) connect_timeout: Duration,
    pub(crate) max_logged_body: usize,
    pub(crate) max_body: usize,
}

impl ProxyContext {
    /// Seal and log an entry everywhere it belongs
    pub(crate) fn emit(&self, run_id: Option<&str>, masker: &SecretMasker, mut entry: NetworkLogEntry) {
        entry.seal(masker);
        PROXY_DECISIONS
            .with_label_values(&[entry.action.as_str(), entry.mode.as_str()])
            .inc();
        entry.trace(run_id);
        if let (Some(sink), Some(run_id)) = (&self.sink, run_id) {
            sink.record(run_id, &entry);
        }
    }

    /// Pick the address an allowed connection to `dest` is made to
    ///
    /// An IP-literal hostname must name the pre-NAT address. Any other
    /// hostname is resolved here and each address faces the rules again,
    /// so the checked address is the one dialed. Without a hostname the
    /// pre-NAT address is used.
    pub(crate) async fn pin_upstream(
        &self,
        rules: Option<&[FirewallRule]>,
        dest: &Destination,
    ) -> Result<(SocketAddr, Decision), Decision> {
        if dest.port == 0 {
            return Err(Decision::deny(MatchedRule::Unresolved));
        }
        let candidates = match (dest.host_ip(), dest.domain_name()) {
            (Some(literal), _) => match dest.ip {
                Some(original) if original != literal => return Err(Decision::deny(MatchedRule::HostMismatch)),
                _ => vec![literal],
            },
            (None, Some(name)) => self.resolve(&name, dest.port).await,
            (None, None) => dest.ip.into_iter().collect(),
        };
        evaluate_resolved(rules, dest, &candidates).map(|(ip, decision)| (SocketAddr::new(ip, dest.port), decision))
    }

    async fn resolve(&self, host: &str, port: u16) -> Vec<IpAddr> {
        match tokio::time::timeout(self.connect_timeout, tokio::net::lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.map(|a| a.ip()).collect(),
            Ok(Err(e)) => {
                debug!(host, error = %e, "hostname lookup failed");
                Vec::new()
            }
            Err(_) => {
                debug!(host, "hostname lookup timed out");
                Vec::new()
            }
        }
    }
}

pub struct NetworkProxy {
    ctx: Arc<ProxyContext>,
    client: intercept::UpstreamClient,
}

impl NetworkProxy {
    pub fn new(registry: VmRegistry, sink: Option<Arc<dyn NetworkLogSink>>, config: &ProxyConfig) -> Self {
        let ctx = Arc::new(ProxyContext {
            registry,
            sink,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_logged_body: config.max_logged_body,
            max_body: config.max_body_bytes,
        });
        let client = intercept::upstream_client(&ctx);
        Self { ctx, client }
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })
    }

    /// Accept loop; every connection runs in its own task
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "egress proxy listening");
        }
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "proxy accept failed");
                        continue;
                    }
                },
            };

            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let original = original_destination(&stream)
                    .ok()
                    .map(SocketAddr::V4)
                    .filter(|orig| stream.local_addr().map(|l| l != *orig).unwrap_or(true));
                proxy.handle_connection(stream, peer, original).await;
            });
        }
        debug!("egress proxy stopped");
    }

    /// Policy decision for `source` reaching `dest`
    ///
    /// Returns the registration alongside so callers know the run and mode.
    pub fn decide(&self, source: IpAddr, dest: &Destination) -> (Decision, Option<Registration>) {
        let registration = match source_v4(source) {
            Some(addr) => match self.ctx.registry.lookup(addr) {
                Ok(found) => found,
                Err(e) => {
                    warn!(%source, error = %e, "registry lookup failed, denying");
                    None
                }
            },
            None => None,
        };

        match registration {
            Some(reg) => {
                let decision = evaluate(reg.policy.firewall_rules.as_deref(), dest);
                (decision, Some(reg))
            }
            None => (Decision::unregistered(), None),
        }
    }

    /// Enforce policy on one VM connection
    ///
    /// `original` is the pre-NAT destination; the sniffed hostname refines
    /// it. Denied connections are closed without a byte sent upstream, and
    /// allowed ones only ever reach an address the rules were checked on.
    pub async fn handle_connection(&self, stream: TcpStream, source: SocketAddr, original: Option<SocketAddr>) {
        PROXY_CONNECTIONS_ACTIVE.inc();
        self.handle_inner(stream, source, original).await;
        PROXY_CONNECTIONS_ACTIVE.dec();
    }

    async fn handle_inner(&self, stream: TcpStream, source: SocketAddr, original: Option<SocketAddr>) {
        let sniffed = sniff::sniff_stream(&stream, SNIFF_TIMEOUT).await;
        let dest = Destination {
            ip: original.map(|a| a.ip()),
            port: original.map(|a| a.port()).unwrap_or(0),
            hostname: sniffed.hostname().map(str::to_string),
        };

        let (decision, registration) = self.decide(source.ip(), &dest);
        let source_v4 = source_v4(source.ip()).unwrap_or(Ipv4Addr::UNSPECIFIED);
        let registration = match registration {
            Some(reg) if decision.is_allowed() => reg,
            other => {
                let (mode, masker) = match &other {
                    Some(reg) => (
                        if reg.policy.mitm_enabled { ProxyMode::Mitm } else { ProxyMode::Sni },
                        SecretMasker::for_policy(&reg.policy),
                    ),
                    None => (ProxyMode::Sni, SecretMasker::default()),
                };
                let entry = NetworkLogEntry::new(source_v4, &dest, &decision, mode);
                self.ctx.emit(other.as_ref().map(|r| r.run_id.as_str()), &masker, entry);
                return;
            }
        };

        if registration.policy.mitm_enabled && matches!(sniffed, Sniffed::Http { .. }) {
            intercept::serve(
                Arc::clone(&self.ctx),
                self.client.clone(),
                stream,
                registration,
                original,
            )
            .await;
            return;
        }

        let masker = SecretMasker::for_policy(&registration.policy);
        let run_id = Some(registration.run_id.as_str());
        let rules = registration.policy.firewall_rules.as_deref();
        let (upstream, decision) = match self.ctx.pin_upstream(rules, &dest).await {
            Ok(pinned) => pinned,
            Err(denied) => {
                let entry = NetworkLogEntry::new(source_v4, &dest, &denied, ProxyMode::Sni);
                self.ctx.emit(run_id, &masker, entry);
                return;
            }
        };

        let mut entry = NetworkLogEntry::new(source_v4, &dest, &decision, ProxyMode::Sni);
        entry.ip = Some(upstream.ip());
        let started = std::time::Instant::now();
        match self.relay(stream, upstream).await {
            Ok((sent, received)) => {
                entry.bytes_sent = sent;
                entry.bytes_received = received;
            }
            Err(e) => entry.error = Some(e.to_string()),
        }
        entry.latency_ms = Some(started.elapsed().as_millis() as u64);
        self.ctx.emit(run_id, &masker, entry);
    }

    /// Connect upstream and copy bytes both ways until either side closes
    async fn relay(&self, mut client: TcpStream, upstream: SocketAddr) -> Result<(u64, u64), ProxyError> {
        let target = upstream.to_string();
        let mut upstream = match tokio::time::timeout(self.ctx.connect_timeout, TcpStream::connect(upstream)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => return Err(ProxyError::Connect { target, source }),
            Err(_) => return Err(ProxyError::ConnectTimeout { target }),
        };

        Ok(tokio::io::copy_bidirectional(&mut client, &mut upstream).await?)
    }
}

fn source_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Pre-NAT destination of a REDIRECTed connection
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddrV4> {
    let fd = stream.as_raw_fd();
    // SAFETY: sockaddr_in is plain data; getsockopt writes at most `len`
    // bytes into it and `fd` is a live socket owned by `stream`.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut libc::sockaddr_in as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::network::VmPolicy;
    use crate::proxy::policy::{Action, FirewallRule, MatchedRule};
    use http_body_util::{BodyExt, Full};
    use hyper::body::{Bytes, Incoming};
    use hyper::client::conn::http1::SendRequest;
    use hyper::header::HOST;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct MemorySink {
        entries: Mutex<Vec<(String, NetworkLogEntry)>>,
    }

    impl NetworkLogSink for MemorySink {
        fn record(&self, run_id: &str, entry: &NetworkLogEntry) {
            self.entries.lock().unwrap().push((run_id.to_string(), entry.clone()));
        }
    }

    fn proxy(registry: VmRegistry, sink: Arc<MemorySink>) -> NetworkProxy {
        NetworkProxy::new(registry, Some(sink as Arc<dyn NetworkLogSink>), &ProxyConfig::default())
    }

    fn registry() -> VmRegistry {
        VmRegistry::sqlite(Database::open_in_memory().unwrap())
    }

    fn loopback_vm(policy: VmPolicy) -> VmRegistry {
        let registry = registry();
        registry.register(Ipv4Addr::LOCALHOST, "r1", "t", policy).unwrap();
        registry
    }

    fn deny_loopback_rules() -> Vec<FirewallRule> {
        vec![
            FirewallRule::Cidr {
                ip: "127.0.0.0/8".parse().unwrap(),
                action: Action::Deny,
            },
            FirewallRule::Cidr {
                ip: "::1/128".parse().unwrap(),
                action: Action::Deny,
            },
            FirewallRule::final_rule(Action::Allow),
        ]
    }

    /// Accept one VM connection and hand it to the proxy as if it was
    /// REDIRECTed from `original`
    async fn front(proxy: Arc<NetworkProxy>, original: SocketAddr) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            proxy.handle_connection(stream, peer, Some(original)).await;
        });
        (addr, server)
    }

    /// HTTP server answering `echo: <body>`, counting requests
    async fn echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            let body = req.into_body().collect().await?.to_bytes();
                            let mut reply = b"echo: ".to_vec();
                            reply.extend_from_slice(&body);
                            Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(reply))))
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, hits)
    }

    async fn http_client(addr: SocketAddr) -> SendRequest<Full<Bytes>> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await.unwrap();
        tokio::spawn(conn);
        sender
    }

    fn request(method: &str, path: &str, host: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, host)
            .body(Full::new(Bytes::from_static(body)))
            .unwrap()
    }

    #[test]
    fn test_unregistered_source_denied() {
        let proxy = proxy(registry(), Arc::default());
        let (decision, reg) = proxy.decide("10.200.0.2".parse().unwrap(), &Destination::host("example.com", 443));
        assert_eq!(decision.action, Action::Deny);
        assert_eq!(decision.matched, MatchedRule::UnregisteredSource);
        assert!(reg.is_none());
    }

    #[test]
    fn test_mapped_v6_source_is_looked_up() {
        let registry = registry();
        registry
            .register(Ipv4Addr::new(10, 200, 0, 2), "r1", "t", VmPolicy::default())
            .unwrap();
        let proxy = proxy(registry, Arc::default());
        let (decision, reg) = proxy.decide("::ffff:10.200.0.2".parse().unwrap(), &Destination::host("a.com", 443));
        assert!(decision.is_allowed());
        assert_eq!(reg.unwrap().run_id, "r1");
    }

    #[tokio::test]
    async fn test_loopback_relay_allowed_and_logged() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(b"pong!").await.unwrap();
        });

        let registry = registry();
        registry
            .register(
                Ipv4Addr::LOCALHOST,
                "r1",
                "t",
                VmPolicy {
                    firewall_rules: Some(vec![FirewallRule::Cidr {
                        ip: "127.0.0.0/8".parse().unwrap(),
                        action: Action::Allow,
                    }]),
                    ..Default::default()
                },
            )
            .unwrap();
        let sink = Arc::new(MemorySink::default());
        let proxy = Arc::new(proxy(registry, sink.clone()));

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let p = Arc::clone(&proxy);
        let server = tokio::spawn(async move {
            let (stream, peer) = front.accept().await.unwrap();
            p.handle_connection(stream, peer, Some(upstream_addr)).await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"ping!").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong!");
        drop(client);
        server.await.unwrap();

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "r1");
        assert_eq!(entries[0].1.action, Action::Allow);
        assert_eq!(entries[0].1.bytes_sent, 5);
    }

    #[tokio::test]
    async fn test_denied_connection_closed_without_upstream() {
        let registry = registry();
        registry
            .register(
                Ipv4Addr::LOCALHOST,
                "r1",
                "t",
                VmPolicy {
                    firewall_rules: Some(vec![
                        FirewallRule::allow_domain("*.example.com"),
                        FirewallRule::final_rule(Action::Deny),
                    ]),
                    ..Default::default()
                },
            )
            .unwrap();
        let sink = Arc::new(MemorySink::default());
        let proxy = Arc::new(proxy(registry, sink.clone()));

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let p = Arc::clone(&proxy);
        let server = tokio::spawn(async move {
            let (stream, peer) = front.accept().await.unwrap();
            p.handle_connection(stream, peer, Some("203.0.113.9:80".parse().unwrap())).await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: evil.test\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        server.await.unwrap();

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.action, Action::Deny);
        assert_eq!(entries[0].1.host, "evil.test");
        assert_eq!(entries[0].1.rule, "#1 final DENY");
    }

    #[tokio::test]
    async fn test_ip_literal_host_cannot_redirect_relay() {
        let (upstream, hits) = echo_upstream().await;
        let registry = loopback_vm(VmPolicy {
            firewall_rules: Some(deny_loopback_rules()),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::default());
        let proxy = Arc::new(proxy(registry, sink.clone()));
        let (front_addr, server) = front(proxy, "203.0.113.9:80".parse().unwrap()).await;

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let head = format!("GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n", upstream.port());
        client.write_all(head.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap_or(0), 0);
        server.await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.action, Action::Deny);
        assert_eq!(entries[0].1.rule, MatchedRule::HostMismatch.to_string());
    }

    #[tokio::test]
    async fn test_hostname_resolving_into_denied_range_is_refused() {
        let (upstream, hits) = echo_upstream().await;
        let registry = loopback_vm(VmPolicy {
            firewall_rules: Some(deny_loopback_rules()),
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::default());
        let proxy = Arc::new(proxy(registry, sink.clone()));
        let original = SocketAddr::from(([203, 0, 113, 9], upstream.port()));
        let (front_addr, server) = front(proxy, original).await;

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap_or(0), 0);
        server.await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.action, Action::Deny);
        assert!(entries[0].1.rule.contains("DENY"), "rule was {}", entries[0].1.rule);
    }

    #[tokio::test]
    async fn test_ip_literal_host_cannot_redirect_intercepted_request() {
        let (upstream, hits) = echo_upstream().await;
        let registry = loopback_vm(VmPolicy {
            firewall_rules: Some(deny_loopback_rules()),
            mitm_enabled: true,
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::default());
        let proxy = Arc::new(proxy(registry, sink.clone()));
        let (front_addr, server) = front(proxy, "203.0.113.9:80".parse().unwrap()).await;

        let mut client = http_client(front_addr).await;
        let host = format!("127.0.0.1:{}", upstream.port());
        let response = client.send_request(request("GET", "/", &host, b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        drop(client);
        server.await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.mode, ProxyMode::Mitm);
        assert_eq!(entries[0].1.status, Some(403));
        assert_eq!(entries[0].1.rule, MatchedRule::HostMismatch.to_string());
    }

    #[tokio::test]
    async fn test_intercepted_requests_are_logged_and_sealed() {
        let (upstream, hits) = echo_upstream().await;
        let registry = loopback_vm(VmPolicy {
            firewall_rules: Some(vec![
                FirewallRule::allow_domain("localhost"),
                FirewallRule::final_rule(Action::Deny),
            ]),
            mitm_enabled: true,
            seal_secrets_enabled: true,
            sealed_secrets: vec!["supersecret-token".into()],
        });
        let sink = Arc::new(MemorySink::default());
        let proxy = Arc::new(proxy(registry, sink.clone()));
        let (front_addr, server) = front(proxy, upstream).await;

        let mut client = http_client(front_addr).await;
        let host = format!("localhost:{}", upstream.port());
        let response = client
            .send_request(request("POST", "/bot/supersecret-token/send", &host, b"key=supersecret-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"echo: key=supersecret-token");

        // same connection, another host
        let response = client.send_request(request("GET", "/", "evil.test", b"")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        drop(client);
        server.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        let allowed = &entries[0].1;
        assert_eq!(entries[0].0, "r1");
        assert_eq!(allowed.mode, ProxyMode::Mitm);
        assert_eq!(allowed.action, Action::Allow);
        assert_eq!(allowed.method.as_deref(), Some("POST"));
        assert_eq!(allowed.path.as_deref(), Some("/bot/[SEALED]/send"));
        assert_eq!(allowed.status, Some(200));
        assert!(allowed.latency_ms.is_some());
        assert_eq!(allowed.ip, Some(upstream.ip()));
        assert_eq!(allowed.bytes_sent, 21);
        assert_eq!(allowed.bytes_received, 27);
        assert_eq!(allowed.request_body.as_deref(), Some("key=[SEALED]"));
        assert_eq!(allowed.response_body.as_deref(), Some("echo: key=[SEALED]"));

        let denied = &entries[1].1;
        assert_eq!(denied.action, Action::Deny);
        assert_eq!(denied.host, "evil.test");
        assert_eq!(denied.status, Some(403));
        assert_eq!(denied.rule, "#1 final DENY");
    }

    const OVERSIZED: &[u8] = &[b'x'; 64];

    #[tokio::test]
    async fn test_intercepted_bodies_are_capped() {
        let (upstream, hits) = echo_upstream().await;
        let registry = loopback_vm(VmPolicy {
            mitm_enabled: true,
            ..Default::default()
        });
        let sink = Arc::new(MemorySink::default());
        let config = ProxyConfig {
            max_body_bytes: 16,
            ..ProxyConfig::default()
        };
        let proxy = Arc::new(NetworkProxy::new(
            registry,
            Some(sink.clone() as Arc<dyn NetworkLogSink>),
            &config,
        ));
        let host = format!("127.0.0.1:{}", upstream.port());

        let (front_addr, server) = front(Arc::clone(&proxy), upstream).await;
        let mut client = http_client(front_addr).await;
        let response = client
            .send_request(request("POST", "/", &host, OVERSIZED))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        drop(client);
        server.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // 12 bytes fit going up; the 18-byte echo does not fit coming back
        let (front_addr, server) = front(proxy, upstream).await;
        let mut client = http_client(front_addr).await;
        let response = client
            .send_request(request("POST", "/", &host, b"0123456789ab"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        drop(client);
        server.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.status, Some(413));
        assert!(entries[0].1.error.as_deref().unwrap().contains("exceeds 16 bytes"));
        assert_eq!(entries[1].1.status, Some(502));
        assert!(entries[1].1.error.as_deref().unwrap().contains("response body exceeds"));
    }
}
