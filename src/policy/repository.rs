use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::policy::types::SecurityPolicy;

/// Durable policy storage.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn load_all(&self) -> Result<Vec<SecurityPolicy>>;

    async fn save(&self, policy: SecurityPolicy) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<String, SecurityPolicy>>,
}

impl InMemoryPolicyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: impl IntoIterator<Item = SecurityPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies.into_iter().map(|p| (p.id.clone(), p)).collect()),
        }
    }
}

#[async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn load_all(&self) -> Result<Vec<SecurityPolicy>> {
        let mut all: Vec<_> = self.policies.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn save(&self, policy: SecurityPolicy) -> Result<()> {
        self.policies.write().await.insert(policy.id.clone(), policy);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.policies.write().await.remove(id).is_some())
    }
}

/// Read a JSON array of policies from disk.
pub fn load_policies_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<SecurityPolicy>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading policy file {}", path.display()))?;
    let policies: Vec<SecurityPolicy> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing policy file {}", path.display()))?;
    for policy in &policies {
        policy
            .validate()
            .with_context(|| format!("invalid policy in {}", path.display()))?;
    }
    Ok(policies)
}
