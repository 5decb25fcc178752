//! Firewall policy evaluation
//!
//! A policy is an ordered rule list evaluated top-down. The first rule that
//! matches decides; a `final` rule matches everything. A list that runs out
//! without a `final` entry denies.
//!
//! ```yaml
//! - domain: "*.example.com"
//!   action: ALLOW
//! - ip: "10.0.0.0/8"
//!   action: DENY
//! - final: DENY
//! ```

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Deny => "DENY",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a firewall rule list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FirewallRule {
    Domain { domain: String, action: Action },
    Cidr { ip: Cidr, action: Action },
    Final {
        #[serde(rename = "final")]
        verdict: Action,
    },
}

impl FirewallRule {
    pub fn allow_domain(pattern: impl Into<String>) -> Self {
        FirewallRule::Domain {
            domain: pattern.into(),
            action: Action::Allow,
        }
    }

    pub fn deny_domain(pattern: impl Into<String>) -> Self {
        FirewallRule::Domain {
            domain: pattern.into(),
            action: Action::Deny,
        }
    }

    pub fn final_rule(verdict: Action) -> Self {
        FirewallRule::Final { verdict }
    }

    fn matches(&self, dest: &Destination) -> bool {
        match self {
            FirewallRule::Domain { domain, .. } => dest
                .domain_name()
                .map(|host| domain_matches(domain, &host))
                .unwrap_or(false),
            FirewallRule::Cidr { ip, .. } => dest.ip.map(|addr| ip.contains(addr)).unwrap_or(false),
            FirewallRule::Final { .. } => true,
        }
    }

    fn action(&self) -> Action {
        match self {
            FirewallRule::Domain { action, .. } | FirewallRule::Cidr { action, .. } => *action,
            FirewallRule::Final { verdict } => *verdict,
        }
    }

    fn is_final(&self) -> bool {
        matches!(self, FirewallRule::Final { .. })
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallRule::Domain { domain, action } => write!(f, "domain:{} {}", domain, action),
            FirewallRule::Cidr { ip, action } => write!(f, "ip:{} {}", ip, action),
            FirewallRule::Final { verdict } => write!(f, "final {}", verdict),
        }
    }
}

/// Where a VM is trying to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Pre-NAT destination address, when known
    pub ip: Option<IpAddr>,
    pub port: u16,
    /// SNI or Host header
    pub hostname: Option<String>,
}

impl Destination {
    pub fn host(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            ip: None,
            port,
            hostname: Some(hostname.into()),
        }
    }

    pub fn addr(ip: IpAddr, port: u16) -> Self {
        Self {
            ip: Some(ip),
            port,
            hostname: None,
        }
    }

    /// Hostname that is itself an IP literal, brackets allowed
    pub fn host_ip(&self) -> Option<IpAddr> {
        let host = self.hostname.as_deref()?.trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        host.parse().ok()
    }

    /// Normalized hostname usable for domain rules; IP literals don't count
    pub(crate) fn domain_name(&self) -> Option<String> {
        let host = self.hostname.as_deref()?.trim().trim_end_matches('.');
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }
        Some(host.to_ascii_lowercase())
    }

    /// Label used in logs: hostname when sniffed, else the IP
    pub fn display_host(&self) -> String {
        match (&self.hostname, self.ip) {
            (Some(h), _) => h.clone(),
            (None, Some(ip)) => ip.to_string(),
            (None, None) => "unknown".to_string(),
        }
    }
}

/// Which rule produced a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchedRule {
    /// Index into the rule list plus its rendering
    Rule { index: usize, rule: String },
    /// List ended without a `final` entry
    ImplicitFinal,
    /// VM registered without a rule list
    NoPolicy,
    /// Source address not in the registry
    UnregisteredSource,
    /// IP-literal hostname naming another address than the one dialed
    HostMismatch,
    /// Hostname gave no address to connect to
    Unresolved,
}

impl fmt::Display for MatchedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchedRule::Rule { index, rule } => write!(f, "#{} {}", index, rule),
            MatchedRule::ImplicitFinal => f.write_str("implicit final DENY"),
            MatchedRule::NoPolicy => f.write_str("no policy"),
            MatchedRule::UnregisteredSource => f.write_str("unregistered source"),
            MatchedRule::HostMismatch => f.write_str("host does not match destination"),
            MatchedRule::Unresolved => f.write_str("host did not resolve"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub matched: MatchedRule,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.action == Action::Allow
    }

    pub fn unregistered() -> Self {
        Self::deny(MatchedRule::UnregisteredSource)
    }

    pub fn deny(matched: MatchedRule) -> Self {
        Self {
            action: Action::Deny,
            matched,
        }
    }
}

/// Evaluate an optional rule list against a destination
///
/// `None` means the job asked for no firewall and egress is unrestricted.
/// An explicit list always ends in a decision: the first matching rule, or
/// DENY when the list has no `final` entry.
pub fn evaluate(rules: Option<&[FirewallRule]>, dest: &Destination) -> Decision {
    let rules = match rules {
        Some(rules) => rules,
        None => {
            return Decision {
                action: Action::Allow,
                matched: MatchedRule::NoPolicy,
            }
        }
    };

    for (index, rule) in rules.iter().enumerate() {
        if rule.matches(dest) {
            return Decision {
                action: rule.action(),
                matched: MatchedRule::Rule {
                    index,
                    rule: rule.to_string(),
                },
            };
        }
        if rule.is_final() {
            break;
        }
    }

    Decision {
        action: Action::Deny,
        matched: MatchedRule::ImplicitFinal,
    }
}

/// Evaluate `dest` once per address it may be connected to
///
/// Each candidate stands in for the destination IP, so CIDR rules see the
/// address that will actually be dialed. The pre-NAT address is tried
/// first when it is among the candidates. Returns the first allowed
/// address with its decision, else the first denial.
pub fn evaluate_resolved(
    rules: Option<&[FirewallRule]>,
    dest: &Destination,
    candidates: &[IpAddr],
) -> Result<(IpAddr, Decision), Decision> {
    let mut ordered: Vec<IpAddr> = candidates.to_vec();
    if let Some(original) = dest.ip {
        ordered.sort_by_key(|ip| *ip != original);
    }

    let mut denied = None;
    for ip in ordered {
        let pinned = Destination {
            ip: Some(ip),
            ..dest.clone()
        };
        let decision = evaluate(rules, &pinned);
        if decision.is_allowed() {
            return Ok((ip, decision));
        }
        denied.get_or_insert(decision);
    }
    Err(denied.unwrap_or_else(|| Decision::deny(MatchedRule::Unresolved)))
}

/// Case-insensitive glob: `*` matches all, `*.x.com` matches any subdomain
/// of `x.com` (not `x.com` itself), anything else is an exact match.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();

    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
    }
    pattern == host
}

/// IPv4 or IPv6 network in prefix notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(network: IpAddr, prefix: u8) -> Result<Self, String> {
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format!("prefix /{} too long for {}", prefix, network));
        }
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let network: IpAddr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
        let prefix = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|e| format!("invalid prefix '{}': {}", p, e))?,
            None if network.is_ipv4() => 32,
            None => 128,
        };
        Cidr::new(network, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
