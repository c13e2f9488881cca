//! Per-agent bearer credentials.
//!
//! Tokens are opaque 128-bit randoms, stored in their own durable table and
//! verified with a constant-time compare so timing never reveals how much of
//! a candidate token matched. Tokens do not expire; revocation is explicit.

use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::models::now_ms;
use crate::store::Table;
use crate::{HubError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub agent_id: String,
    pub token: String,
    pub created_at: i64,
}

/// Listing entry; never exposes the token value itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub agent_id: String,
    pub created_at: i64,
}

pub struct TokenRegistry {
    table: Arc<Table<TokenRecord>>,
}

impl TokenRegistry {
    pub fn new(table: Arc<Table<TokenRecord>>) -> Self {
        Self { table }
    }

    /// Issues a fresh token for `agent_id`. Fails if one is already
    /// registered; revoke first to rotate.
    pub async fn generate(&self, agent_id: &str) -> Result<String> {
        if self.table.lookup(agent_id).await.is_some() {
            return Err(HubError::Validation(format!(
                "agent {agent_id} already has a token"
            )));
        }

        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        let record = TokenRecord {
            agent_id: agent_id.to_string(),
            token: token.clone(),
            created_at: now_ms(),
        };
        self.table.insert(agent_id, &record).await?;
        info!(%agent_id, "issued agent token");
        Ok(token)
    }

    /// Resolves a presented token to its agent id.
    ///
    /// Every stored token is compared in constant time and the walk never
    /// exits early on a match, so verification cost is independent of both
    /// the candidate and where (or whether) it matches.
    pub async fn verify(&self, token: &str) -> Option<String> {
        let mut matched: Option<String> = None;
        for (_, record) in self.table.scan().await {
            let equal: bool = record
                .token
                .as_bytes()
                .ct_eq(token.as_bytes())
                .into();
            if equal {
                matched = Some(record.agent_id);
            }
        }
        matched
    }

    /// Removes the agent's token. Idempotent.
    pub async fn revoke(&self, agent_id: &str) -> Result<bool> {
        let existed = self.table.delete(agent_id).await?;
        if existed {
            info!(%agent_id, "revoked agent token");
        }
        Ok(existed)
    }

    pub async fn list(&self) -> Vec<TokenInfo> {
        self.table
            .scan()
            .await
            .into_iter()
            .map(|(_, r)| TokenInfo {
                agent_id: r.agent_id,
                created_at: r.created_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Store;

    fn registry(dir: &std::path::Path) -> TokenRegistry {
        let mut store = Store::open(Config::for_testing(dir).store);
        TokenRegistry::new(store.table("tokens").unwrap())
    }

    #[tokio::test]
    async fn generate_then_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let token = registry.generate("agent-1").await.unwrap();
        assert_eq!(token.len(), 32);
        assert_eq!(registry.verify(&token).await, Some("agent-1".to_string()));
        assert_eq!(registry.verify("not-a-token").await, None);
    }

    #[tokio::test]
    async fn revoked_token_no_longer_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        let token = registry.generate("agent-1").await.unwrap();
        assert!(registry.revoke("agent-1").await.unwrap());
        assert_eq!(registry.verify(&token).await, None);
        // Second revoke is a no-op.
        assert!(!registry.revoke("agent-1").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_generate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.generate("agent-1").await.unwrap();
        assert!(registry.generate("agent-1").await.is_err());
    }

    #[tokio::test]
    async fn list_hides_token_values() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.generate("agent-1").await.unwrap();
        registry.generate("agent-2").await.unwrap();

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("token"));
    }
}
