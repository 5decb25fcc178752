//! Host-side network plumbing for one address slot
//!
//! ```text
//!  ┌──────────── netns rv{i} ─────────────┐
//!  │ guest 172.16.0.2 ── rvtap{i} (.1/30) │
//!  │        SNAT → slot address           │
//!  │                  rvg{i} ─────────────┼── rvh{i} (host, .1)
//!  └──────────────────────────────────────┘        │
//!                                    iptables REDIRECT tcp → proxy port
//! ```
//!
//! Every VM sits behind its own namespace, so all guests can share the same
//! in-guest address while the host only ever sees the slot address. That
//! address is the source the proxy looks up in the registry.
//!
//! Apart from TCP, which the proxy terminates, a slot may only send DNS to
//! the configured resolver. Everything else it tries to forward is dropped.

use std::net::Ipv4Addr;

use tokio::process::Command;
use tracing::{debug, warn};

use super::{NetworkSlot, RegistryError};

/// Gateway address the guest routes through, inside its namespace
const GUEST_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);

pub const DEFAULT_DNS_RESOLVER: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

/// One external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl HostCommand {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn in_netns(namespace: &str, program: &str, args: &[&str]) -> Self {
        let mut full = vec!["netns", "exec", namespace, program];
        full.extend_from_slice(args);
        Self::new("ip", &full)
    }
}

impl std::fmt::Display for HostCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Commands that create the namespace, devices and NAT rules for a slot
///
/// With `api_port`, VM traffic to the runner API on the slot's host address
/// is exempt from the proxy redirect.
pub fn setup_commands(
    slot: &NetworkSlot,
    guest_address: Ipv4Addr,
    dns_resolver: Ipv4Addr,
    proxy_port: u16,
    api_port: Option<u16>,
) -> Vec<HostCommand> {
    let ns = slot.namespace.as_str();
    let host_cidr = format!("{}/30", slot.host_address);
    let slot_cidr = format!("{}/30", slot.address);
    let gateway_cidr = format!("{}/30", GUEST_GATEWAY);
    let guest = guest_address.to_string();
    let host_gw = slot.host_address.to_string();
    let slot_addr = slot.address.to_string();
    let port = proxy_port.to_string();

    let mut cmds = vec![
        HostCommand::new("ip", &["netns", "add", ns]),
        // guest-facing TAP
        HostCommand::in_netns(ns, "ip", &["tuntap", "add", "dev", &slot.tap_name, "mode", "tap"]),
        HostCommand::in_netns(ns, "ip", &["addr", "add", &gateway_cidr, "dev", &slot.tap_name]),
        HostCommand::in_netns(ns, "ip", &["link", "set", &slot.tap_name, "up"]),
        // veth to the host
        HostCommand::new(
            "ip",
            &["link", "add", &slot.host_veth, "type", "veth", "peer", "name", &slot.ns_veth],
        ),
        HostCommand::new("ip", &["link", "set", &slot.ns_veth, "netns", ns]),
        HostCommand::new("ip", &["addr", "add", &host_cidr, "dev", &slot.host_veth]),
        HostCommand::new("ip", &["link", "set", &slot.host_veth, "up"]),
        HostCommand::in_netns(ns, "ip", &["addr", "add", &slot_cidr, "dev", &slot.ns_veth]),
        HostCommand::in_netns(ns, "ip", &["link", "set", &slot.ns_veth, "up"]),
        HostCommand::in_netns(ns, "ip", &["link", "set", "lo", "up"]),
        HostCommand::in_netns(ns, "ip", &["route", "add", "default", "via", &host_gw]),
        HostCommand::in_netns(ns, "sysctl", &["-qw", "net.ipv4.ip_forward=1"]),
        // guest → slot address
        HostCommand::in_netns(
            ns,
            "iptables",
            &[
                "-t", "nat", "-A", "POSTROUTING", "-s", &guest, "-o", &slot.ns_veth, "-j", "SNAT",
                "--to-source", &slot_addr,
            ],
        ),
    ];
    if let Some(api_port) = api_port {
        cmds.push(api_exemption(slot, api_port, "-A"));
    }
    cmds.extend([
        // all VM TCP egress lands on the proxy
        HostCommand::new(
            "iptables",
            &[
                "-t", "nat", "-A", "PREROUTING", "-i", &slot.host_veth, "-p", "tcp", "-j",
                "REDIRECT", "--to-ports", &port,
            ],
        ),
    ]);
    cmds.extend(egress_filter(slot, dns_resolver, "-I"));
    cmds
}

/// Forwarding rules for what the proxy cannot see
///
/// DNS to `resolver` is masqueraded and forwarded; any other packet the
/// slot tries to forward is dropped. With `-I` the DROP goes in first so
/// the ACCEPT lands above it, ahead of rules other tools appended.
fn egress_filter(slot: &NetworkSlot, resolver: Ipv4Addr, op: &str) -> Vec<HostCommand> {
    let slot_host = format!("{}/32", slot.address);
    let resolver = format!("{}/32", resolver);
    let dns = |table: &'static str, chain: &'static str, target: &'static str| {
        HostCommand::new(
            "iptables",
            &[
                "-t", table, op, chain, "-s", &slot_host, "-d", &resolver, "-p", "udp", "--dport", "53", "-j",
                target,
            ],
        )
    };
    vec![
        dns("nat", "POSTROUTING", "MASQUERADE"),
        HostCommand::new(
            "iptables",
            &["-t", "filter", op, "FORWARD", "-i", &slot.host_veth, "-j", "DROP"],
        ),
        dns("filter", "FORWARD", "ACCEPT"),
    ]
}

fn api_exemption(slot: &NetworkSlot, api_port: u16, op: &str) -> HostCommand {
    let host_addr = slot.host_address.to_string();
    let api_port = api_port.to_string();
    HostCommand::new(
        "iptables",
        &[
            "-t", "nat", op, "PREROUTING", "-i", &slot.host_veth, "-p", "tcp", "-d", &host_addr,
            "--dport", &api_port, "-j", "RETURN",
        ],
    )
}

/// Commands that undo [`setup_commands`]; deleting the namespace removes
/// the TAP and the namespace end of the veth pair
pub fn teardown_commands(
    slot: &NetworkSlot,
    dns_resolver: Ipv4Addr,
    proxy_port: u16,
    api_port: Option<u16>,
) -> Vec<HostCommand> {
    let port = proxy_port.to_string();
    let mut cmds: Vec<HostCommand> = api_port
        .map(|p| api_exemption(slot, p, "-D"))
        .into_iter()
        .collect();
    cmds.push(HostCommand::new(
        "iptables",
        &[
            "-t", "nat", "-D", "PREROUTING", "-i", &slot.host_veth, "-p", "tcp", "-j", "REDIRECT",
            "--to-ports", &port,
        ],
    ));
    cmds.extend(egress_filter(slot, dns_resolver, "-D"));
    cmds.extend([
        HostCommand::new("ip", &["link", "del", &slot.host_veth]),
        HostCommand::new("ip", &["netns", "del", &slot.namespace]),
    ]);
    cmds
}

/// Executes slot plumbing on the host
///
/// With `enabled = false` (hosts where networking is provisioned out of
/// band, and tests) every operation is a logged no-op.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    guest_address: Ipv4Addr,
    dns_resolver: Ipv4Addr,
    proxy_port: u16,
    api_port: Option<u16>,
    enabled: bool,
}

impl HostNetwork {
    pub fn new(guest_address: Ipv4Addr, dns_resolver: Ipv4Addr, proxy_port: u16, enabled: bool) -> Self {
        Self {
            guest_address,
            dns_resolver,
            proxy_port,
            api_port: None,
            enabled,
        }
    }

    /// Let VMs reach the runner API on their slot's host address
    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = Some(port);
        self
    }

    pub fn disabled() -> Self {
        Self::new(Ipv4Addr::new(172, 16, 0, 2), DEFAULT_DNS_RESOLVER, 0, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn guest_address(&self) -> Ipv4Addr {
        self.guest_address
    }

    /// The only address a guest may send DNS to
    pub fn dns_resolver(&self) -> Ipv4Addr {
        self.dns_resolver
    }

    /// Gateway the guest should be configured with
    pub fn guest_gateway(&self) -> Ipv4Addr {
        GUEST_GATEWAY
    }

    /// Namespace the hypervisor process must run in, if any
    pub fn namespace_for<'a>(&self, slot: &'a NetworkSlot) -> Option<&'a str> {
        self.enabled.then_some(slot.namespace.as_str())
    }

    /// Create the slot's plumbing
    ///
    /// Leftovers from a crashed previous run are cleared first. On failure
    /// whatever was created is torn down again before the error is returned.
    pub async fn setup(&self, slot: &NetworkSlot) -> Result<(), RegistryError> {
        if !self.enabled {
            debug!(slot = slot.index, "host network management disabled");
            return Ok(());
        }

        self.teardown(slot).await;
        for cmd in setup_commands(slot, self.guest_address, self.dns_resolver, self.proxy_port, self.api_port) {
            if let Err(e) = run(&cmd).await {
                warn!(slot = slot.index, error = %e, "slot network setup failed");
                self.teardown(slot).await;
                return Err(e);
            }
        }
        debug!(slot = slot.index, address = %slot.address, "slot network ready");
        Ok(())
    }

    /// Remove the slot's plumbing; failures are logged, never returned
    pub async fn teardown(&self, slot: &NetworkSlot) {
        if !self.enabled {
            return;
        }
        for cmd in teardown_commands(slot, self.dns_resolver, self.proxy_port, self.api_port) {
            if let Err(e) = run(&cmd).await {
                debug!(slot = slot.index, error = %e, "teardown step skipped");
            }
        }
    }
}

async fn run(cmd: &HostCommand) -> Result<(), RegistryError> {
    let output = Command::new(cmd.program).args(&cmd.args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(RegistryError::Command {
        command: cmd.to_string(),
        status: output.status.code(),
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::allocator::AddressAllocator;
    use crate::network::VmRegistry;
    use crate::db::Database;

    const GUEST: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);
    const RESOLVER: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

    fn slot() -> NetworkSlot {
        let registry = VmRegistry::sqlite(Database::open_in_memory().unwrap());
        let alloc = AddressAllocator::new(Ipv4Addr::new(10, 200, 0, 0), 4, registry).unwrap();
        alloc.slot_for(Ipv4Addr::new(10, 200, 0, 6)).unwrap().clone()
    }

    #[test]
    fn test_setup_creates_namespace_first() {
        let cmds = setup_commands(&slot(), GUEST, RESOLVER, 8080, None);
        assert_eq!(cmds[0].to_string(), "ip netns add rv1");
    }

    #[test]
    fn test_setup_snats_guest_to_slot_address() {
        let cmds = setup_commands(&slot(), GUEST, RESOLVER, 8080, None);
        let snat = cmds
            .iter()
            .find(|c| c.args.iter().any(|a| a == "SNAT"))
            .unwrap();
        let line = snat.to_string();
        assert!(line.starts_with("ip netns exec rv1 iptables"));
        assert!(line.contains("-s 172.16.0.2"));
        assert!(line.ends_with("--to-source 10.200.0.6"));
    }

    #[test]
    fn test_setup_redirects_tcp_to_proxy() {
        let cmds = setup_commands(&slot(), GUEST, RESOLVER, 8080, None);
        assert!(cmds.iter().any(|c| c.to_string()
            == "iptables -t nat -A PREROUTING -i rvh1 -p tcp -j REDIRECT --to-ports 8080"));
    }

    #[test]
    fn test_api_exemption_precedes_redirect() {
        let cmds: Vec<String> = setup_commands(&slot(), GUEST, RESOLVER, 8080, Some(9090))
            .iter()
            .map(|c| c.to_string())
            .collect();
        let exempt = cmds
            .iter()
            .position(|c| c == "iptables -t nat -A PREROUTING -i rvh1 -p tcp -d 10.200.0.5 --dport 9090 -j RETURN")
            .unwrap();
        let redirect = cmds.iter().position(|c| c.contains("REDIRECT")).unwrap();
        assert!(exempt < redirect);
    }

    #[test]
    fn test_only_dns_to_resolver_leaves_untouched() {
        let cmds: Vec<String> = setup_commands(&slot(), GUEST, RESOLVER, 8080, None)
            .iter()
            .map(|c| c.to_string())
            .collect();
        let masquerade: Vec<&String> = cmds.iter().filter(|c| c.contains("MASQUERADE")).collect();
        assert_eq!(
            masquerade,
            vec!["iptables -t nat -I POSTROUTING -s 10.200.0.6/32 -d 9.9.9.9/32 -p udp --dport 53 -j MASQUERADE"]
        );

        let drop = cmds
            .iter()
            .position(|c| c == "iptables -t filter -I FORWARD -i rvh1 -j DROP")
            .unwrap();
        let accept = cmds
            .iter()
            .position(|c| {
                c == "iptables -t filter -I FORWARD -s 10.200.0.6/32 -d 9.9.9.9/32 -p udp --dport 53 -j ACCEPT"
            })
            .unwrap();
        // inserted later, so evaluated first
        assert!(drop < accept);
        assert!(!cmds.iter().any(|c| c.contains("-p udp -j")));
    }

    #[test]
    fn test_teardown_mirrors_setup_rules() {
        let cmds = teardown_commands(&slot(), RESOLVER, 8080, Some(9090));
        assert!(cmds[0].to_string().contains("-D PREROUTING"));
        assert!(cmds.iter().any(|c| c.to_string()
            == "iptables -t nat -D PREROUTING -i rvh1 -p tcp -j REDIRECT --to-ports 8080"));

        let rules: Vec<String> = setup_commands(&slot(), GUEST, RESOLVER, 8080, Some(9090))
            .iter()
            .filter(|c| c.program == "iptables" && c.args.iter().any(|a| a == "-I"))
            .map(|c| c.to_string().replace(" -I ", " -D "))
            .collect();
        assert_eq!(rules.len(), 3);
        for rule in rules {
            assert!(cmds.iter().any(|c| c.to_string() == rule), "{} not torn down", rule);
        }
        assert_eq!(cmds.last().unwrap().to_string(), "ip netns del rv1");
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let host = HostNetwork::disabled();
        host.setup(&slot()).await.unwrap();
        host.teardown(&slot()).await;
        assert!(host.namespace_for(&slot()).is_none());
    }
}
