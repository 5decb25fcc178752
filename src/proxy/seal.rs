//! Secret sealing for captured traffic
//!
//! When a job enables sealing, every registered secret value is replaced
//! before a captured payload reaches any log.

use crate::network::VmPolicy;

/// Replacement text for a sealed value
pub const SEALED: &str = "[SEALED]";

/// Values shorter than this are not masked; they would match noise
const MIN_SECRET_LEN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    /// Longest first so a secret containing another is masked whole
    secrets: Vec<String>,
}

impl SecretMasker {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| s.len() >= MIN_SECRET_LEN)
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Masker for a VM's policy; empty unless sealing is enabled
    pub fn for_policy(policy: &VmPolicy) -> Self {
        if policy.seal_secrets_enabled {
            Self::new(policy.sealed_secrets.iter().cloned())
        } else {
            Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), SEALED))
    }

    /// Mask a captured body, then truncate it to about `limit` bytes
    ///
    /// Masking runs on the whole body so a secret cut by the limit never
    /// leaks its prefix.
    pub fn mask_capture(&self, body: &[u8], limit: usize) -> String {
        let mut text = self.mask(&String::from_utf8_lossy(body));
        if text.len() > limit {
            let mut cut = limit;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push('…');
        }
        text
    }
}
