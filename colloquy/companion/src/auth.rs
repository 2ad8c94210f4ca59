//! Auth gatekeeper: the per-instance secret and the pre-authorization grant
//!
//! The server's own enforcement is the token check alone. The grant exists
//! to suppress the CLI's separate interactive-consent layer and is injected
//! into the CLI's configuration by the launcher, never stored server-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::discovery::DiscoveryRecord;

/// Tool names a grant may pre-authorize. This is the single bypass of
/// interactive consent, so the set is fixed; extending it is a protocol
/// version bump, not a runtime registration.
pub const ALLOWED_TOOLS: [&str; 3] = ["openDiff", "closeDiff", "navigateTo"];

/// High-entropy bearer secret, minted once per server instance. A new bind
/// invalidates every token issued before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    /// 32 hex characters from the process CSPRNG.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validates inbound credentials for one server instance.
pub struct Gatekeeper {
    token: AuthToken,
}

impl Gatekeeper {
    pub fn new() -> Self {
        Self {
            token: AuthToken::generate(),
        }
    }

    pub fn token(&self) -> &AuthToken {
        &self.token
    }

    /// Timing-safe comparison; tokens are secrets, not identifiers.
    pub fn verify(&self, presented: &str) -> bool {
        bool::from(self.token.0.as_bytes().ct_eq(presented.as_bytes()))
    }
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped capability: "these tools may run against this instance without
/// interactive confirmation." Regenerated on every launch so it always
/// matches the current token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationGrant {
    pub instance_id: Uuid,
    pub allowed_tools: Vec<String>,
    pub issued_at: DateTime<Utc>,
}

impl AuthorizationGrant {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            allowed_tools: ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            issued_at: Utc::now(),
        }
    }

    /// Render the settings artifact the CLI loads: enables IDE mode, trusts
    /// the fixed tool set, and points at the authenticated endpoint.
    pub fn to_settings_value(&self, record: &DiscoveryRecord) -> serde_json::Value {
        serde_json::json!({
            "ide": {
                "enabled": true,
                "instanceId": self.instance_id,
            },
            "tools": {
                "allowed": self.allowed_tools,
            },
            "servers": {
                "colloquy": {
                    "url": format!("tcp://127.0.0.1:{}", record.port),
                    "headers": { "Authorization": record.token },
                    "trust": true,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_fixed_length_and_unique() {
        let a = AuthToken::generate();
        let b = AuthToken::generate();
        assert_eq!(a.as_str().len(), 32);
        assert_eq!(b.as_str().len(), 32);
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn verify_accepts_only_the_issued_token() {
        let gatekeeper = Gatekeeper::new();
        let token = gatekeeper.token().as_str().to_string();

        assert!(gatekeeper.verify(&token));
        assert!(!gatekeeper.verify(""));
        assert!(!gatekeeper.verify("not-a-token"));
        assert!(!gatekeeper.verify(&token[..16]));
    }

    #[test]
    fn restart_invalidates_previous_tokens() {
        let first = Gatekeeper::new();
        let old_token = first.token().as_str().to_string();

        // New instance for the same editor process mints a new secret.
        let second = Gatekeeper::new();
        assert!(!second.verify(&old_token));
        assert!(second.verify(second.token().as_str()));
    }

    #[test]
    fn grant_covers_exactly_the_fixed_tool_set() {
        let grant = AuthorizationGrant::new(Uuid::new_v4());
        assert_eq!(grant.allowed_tools, vec!["openDiff", "closeDiff", "navigateTo"]);
    }
}
