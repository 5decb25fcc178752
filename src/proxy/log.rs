//! Network activity records
//!
//! One entry per decided connection (SNI-only and denied flows) or per
//! intercepted HTTP request (MITM). Entries go to the tracing log and to
//! the owning run's telemetry records.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::policy::{Action, Decision, Destination};
use super::seal::SecretMasker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Mitm,
    Sni,
}

impl ProxyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyMode::Mitm => "mitm",
            ProxyMode::Sni => "sni",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: Ipv4Addr,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub action: Action,
    pub rule: String,
    pub mode: ProxyMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkLogEntry {
    pub fn new(source: Ipv4Addr, dest: &Destination, decision: &Decision, mode: ProxyMode) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            host: dest.display_host(),
            ip: dest.ip,
            port: dest.port,
            action: decision.action,
            rule: decision.matched.to_string(),
            mode,
            method: None,
            path: None,
            status: None,
            latency_ms: None,
            bytes_sent: 0,
            bytes_received: 0,
            request_body: None,
            response_body: None,
            error: None,
        }
    }

    /// Mask sealed secrets in every free-text field
    ///
    /// Bodies are masked when captured; this covers what the VM put into
    /// the hostname and request line, and errors quoting them.
    pub fn seal(&mut self, masker: &SecretMasker) {
        if masker.is_empty() {
            return;
        }
        self.host = masker.mask(&self.host);
        for field in [&mut self.path, &mut self.error] {
            if let Some(text) = field.as_mut() {
                *text = masker.mask(text);
            }
        }
    }

    /// Emit to the tracing log
    pub fn trace(&self, run_id: Option<&str>) {
        let run_id = run_id.unwrap_or("-");
        match self.action {
            Action::Allow => info!(
                run_id,
                source = %self.source,
                host = %self.host,
                port = self.port,
                mode = self.mode.as_str(),
                method = self.method.as_deref().unwrap_or(""),
                status = self.status.unwrap_or(0),
                latency_ms = self.latency_ms.unwrap_or(0),
                sent = self.bytes_sent,
                received = self.bytes_received,
                rule = %self.rule,
                "egress allowed"
            ),
            Action::Deny => warn!(
                run_id,
                source = %self.source,
                host = %self.host,
                port = self.port,
                rule = %self.rule,
                "egress denied"
            ),
        }
    }
}

/// Destination for network log entries of registered runs
pub trait NetworkLogSink: Send + Sync {
    fn record(&self, run_id: &str, entry: &NetworkLogEntry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::policy::{evaluate, FirewallRule};

    #[test]
    fn test_entry_records_matched_rule() {
        let rules = vec![FirewallRule::final_rule(Action::Deny)];
        let dest = Destination::host("evil.test", 443);
        let decision = evaluate(Some(&rules), &dest);
        let entry = NetworkLogEntry::new(Ipv4Addr::new(10, 200, 0, 2), &dest, &decision, ProxyMode::Sni);

        assert_eq!(entry.action, Action::Deny);
        assert_eq!(entry.rule, "#0 final DENY");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["host"], "evil.test");
        assert_eq!(json["mode"], "sni");
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_seal_masks_request_line_and_error() {
        let dest = Destination::host("api.telegram.org", 443);
        let decision = evaluate(None, &dest);
        let mut entry = NetworkLogEntry::new(Ipv4Addr::new(10, 200, 0, 2), &dest, &decision, ProxyMode::Mitm);
        entry.path = Some("/bot/supersecret-token/send".into());
        entry.error = Some("upstream http://1.2.3.4/bot/supersecret-token/send failed".into());

        entry.seal(&SecretMasker::new(["supersecret-token"]));
        assert_eq!(entry.path.as_deref(), Some("/bot/[SEALED]/send"));
        assert_eq!(
            entry.error.as_deref(),
            Some("upstream http://1.2.3.4/bot/[SEALED]/send failed")
        );
        assert_eq!(entry.host, "api.telegram.org");
    }
}
