//! VM Registry - address → run identity and firewall policy
//!
//! The proxy consults this table on every connection. One registration
//! exists per live VM; the owning job supervisor is its only writer, so
//! single-key atomic replace is all the store has to provide.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RegistryError;
use crate::db::{dt_to_ms, Database};
use crate::proxy::policy::FirewallRule;

/// Per-job network policy handed to the pool on acquire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmPolicy {
    pub firewall_rules: Option<Vec<FirewallRule>>,
    #[serde(default)]
    pub mitm_enabled: bool,
    #[serde(default)]
    pub seal_secrets_enabled: bool,
    /// Secret values to mask in captured traffic
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sealed_secrets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub address: Ipv4Addr,
    pub run_id: String,
    pub sandbox_token: String,
    #[serde(flatten)]
    pub policy: VmPolicy,
    pub registered_at: DateTime<Utc>,
}

/// Durable single-key storage behind the registry
pub trait RegistryStore: Send + Sync {
    fn get(&self, address: Ipv4Addr) -> Result<Option<Registration>, RegistryError>;
    fn get_by_token(&self, sandbox_token: &str) -> Result<Option<Registration>, RegistryError>;
    /// Insert or overwrite
    fn put(&self, registration: &Registration) -> Result<(), RegistryError>;
    /// Returns whether a row existed
    fn delete(&self, address: Ipv4Addr) -> Result<bool, RegistryError>;
    fn list(&self) -> Result<Vec<Registration>, RegistryError>;
}

/// `vm_registrations` table, one JSON record per address
pub struct SqliteRegistryStore {
    db: Database,
}

impl SqliteRegistryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RegistryStore for SqliteRegistryStore {
    fn get(&self, address: Ipv4Addr) -> Result<Option<Registration>, RegistryError> {
        let record: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT record FROM vm_registrations WHERE address = ?1",
                params![address.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(RegistryError::from))
            .transpose()
    }

    fn get_by_token(&self, sandbox_token: &str) -> Result<Option<Registration>, RegistryError> {
        let record: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT record FROM vm_registrations WHERE sandbox_token = ?1",
                params![sandbox_token],
                |row| row.get(0),
            )
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(RegistryError::from))
            .transpose()
    }

    fn put(&self, registration: &Registration) -> Result<(), RegistryError> {
        let record = serde_json::to_string(registration)?;
        self.db.conn().execute(
            "INSERT OR REPLACE INTO vm_registrations (address, run_id, sandbox_token, record, registered_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                registration.address.to_string(),
                registration.run_id,
                registration.sandbox_token,
                record,
                dt_to_ms(registration.registered_at)
            ],
        )?;
        Ok(())
    }

    fn delete(&self, address: Ipv4Addr) -> Result<bool, RegistryError> {
        let deleted = self.db.conn().execute(
            "DELETE FROM vm_registrations WHERE address = ?1",
            params![address.to_string()],
        )?;
        Ok(deleted > 0)
    }

    fn list(&self) -> Result<Vec<Registration>, RegistryError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT record FROM vm_registrations ORDER BY address")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

/// Registry facade used by the pool, the proxy and the API
#[derive(Clone)]
pub struct VmRegistry {
    store: Arc<dyn RegistryStore>,
}

impl VmRegistry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub fn sqlite(db: Database) -> Self {
        Self::new(Arc::new(SqliteRegistryStore::new(db)))
    }

    /// Register (or overwrite, for restart-in-place) the VM at `address`
    pub fn register(
        &self,
        address: Ipv4Addr,
        run_id: &str,
        sandbox_token: &str,
        policy: VmPolicy,
    ) -> Result<Registration, RegistryError> {
        let registration = Registration {
            address,
            run_id: run_id.to_string(),
            sandbox_token: sandbox_token.to_string(),
            policy,
            registered_at: Utc::now(),
        };
        self.store.put(&registration)?;
        info!(
            %address,
            run_id,
            mitm = registration.policy.mitm_enabled,
            rules = registration.policy.firewall_rules.as_ref().map(|r| r.len()).unwrap_or(0),
            "vm registered"
        );
        Ok(registration)
    }

    /// Remove a registration; unknown addresses are a no-op
    pub fn unregister(&self, address: Ipv4Addr) -> Result<(), RegistryError> {
        if self.store.delete(address)? {
            info!(%address, "vm unregistered");
        } else {
            debug!(%address, "unregister of unknown address ignored");
        }
        Ok(())
    }

    pub fn lookup(&self, address: Ipv4Addr) -> Result<Option<Registration>, RegistryError> {
        self.store.get(address)
    }

    pub fn list(&self) -> Result<Vec<Registration>, RegistryError> {
        self.store.list()
    }

    /// Find the live registration a sandbox token belongs to
    pub fn lookup_token(&self, sandbox_token: &str) -> Result<Option<Registration>, RegistryError> {
        if sandbox_token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .store
            .get_by_token(sandbox_token)?
            .filter(|r| tokens_match(&r.sandbox_token, sandbox_token)))
    }
}

/// Byte comparison that takes as long for a near miss as for a match
pub(crate) fn tokens_match(stored: &str, presented: &str) -> bool {
    let (stored, presented) = (stored.as_bytes(), presented.as_bytes());
    stored.len() == presented.len()
        && stored
            .iter()
            .zip(presented)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}
