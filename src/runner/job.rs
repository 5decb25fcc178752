//! What the runner reads out of a lease's execution context
//!
//! The context is opaque to the queue; the runner only looks at the
//! `network` section (firewall and interception policy) and at the values
//! of `secrets`, which are sealed in captured traffic when asked to.
//!
//! ```json
//! {
//!   "network": {
//!     "firewallRules": [{ "domain": "*.example.com", "action": "ALLOW" }, { "final": "DENY" }],
//!     "mitmEnabled": true,
//!     "sealSecretsEnabled": true
//!   },
//!   "secrets": { "API_KEY": "sk-live-..." }
//! }
//! ```

use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;

use crate::network::VmPolicy;
use crate::proxy::policy::FirewallRule;

const SANDBOX_TOKEN_LEN: usize = 40;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkSection {
    #[serde(default)]
    firewall_rules: Option<Vec<FirewallRule>>,
    #[serde(default)]
    mitm_enabled: bool,
    #[serde(default)]
    seal_secrets_enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ContextView {
    #[serde(default)]
    network: NetworkSection,
    #[serde(default)]
    secrets: BTreeMap<String, serde_json::Value>,
}

/// Network policy for the VM that will run this context
pub fn policy_from_context(context: &serde_json::Value) -> Result<VmPolicy, serde_json::Error> {
    let view: ContextView = if context.is_null() {
        ContextView::default()
    } else {
        ContextView::deserialize(context)?
    };

    let sealed_secrets = if view.network.seal_secrets_enabled {
        view.secrets
            .into_values()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(VmPolicy {
        firewall_rules: view.network.firewall_rules,
        mitm_enabled: view.network.mitm_enabled,
        seal_secrets_enabled: view.network.seal_secrets_enabled,
        sealed_secrets,
    })
}

/// Fresh bearer token the VM uses for ingress and completion
pub fn sandbox_token() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SANDBOX_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("sbx_{}", suffix)
}
