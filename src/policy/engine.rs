use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::audit::{ActorProfile, AuditEvent, AuditOutcome, AuditTrail, RiskLevel};
use crate::error::{Result, SecurityError};
use crate::policy::expr::Scope;
use crate::policy::repository::{load_policies_file, PolicyRepository};
use crate::policy::types::{EnforcementLevel, PolicyAction, PolicyDecision, SecurityPolicy};

/// Reason handed to callers for any blocking denial. Details stay in the logs.
pub const DENIAL_REASON: &str = "denied by security policy";

/// Evaluates security policies against requests. Every `enforce` call produces
/// exactly one audit event.
pub struct PolicyEngine {
    repository: Arc<dyn PolicyRepository>,
    policies: RwLock<Vec<Arc<SecurityPolicy>>>,
    audit: AuditTrail,
}

impl PolicyEngine {
    /// Build the engine and load the current policy set from the repository.
    pub async fn new(repository: Arc<dyn PolicyRepository>, audit: AuditTrail) -> Result<Self> {
        let engine = Self {
            repository,
            policies: RwLock::new(Vec::new()),
            audit,
        };
        engine.reload().await?;
        Ok(engine)
    }

    fn prepare(mut policy: SecurityPolicy) -> SecurityPolicy {
        let broken = policy.prepare();
        if !broken.is_empty() {
            warn!(policy_id = %policy.id, rules = ?broken, "policy rules with invalid conditions will never match");
        }
        policy
    }

    /// Replace the in-memory policy set with the repository's contents.
    pub async fn reload(&self) -> Result<usize> {
        let mut loaded: Vec<Arc<SecurityPolicy>> = self
            .repository
            .load_all()
            .await?
            .into_iter()
            .map(|p| Arc::new(Self::prepare(p)))
            .collect();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        let count = loaded.len();
        *self.policies.write().await = loaded;
        info!(count, "policies loaded");
        Ok(count)
    }

    pub async fn policies(&self) -> Vec<SecurityPolicy> {
        self.policies
            .read()
            .await
            .iter()
            .map(|p| SecurityPolicy::clone(p))
            .collect()
    }

    pub async fn upsert_policy(&self, policy: SecurityPolicy) -> Result<()> {
        policy.validate()?;
        let policy = Self::prepare(policy);
        self.repository.save(policy.clone()).await?;

        let id = policy.id.clone();
        {
            let mut policies = self.policies.write().await;
            policies.retain(|p| p.id != id);
            policies.push(Arc::new(policy));
            policies.sort_by(|a, b| a.id.cmp(&b.id));
        }
        self.audit.record(AuditEvent::new(
            &ActorProfile::system(),
            "policy.upsert",
            format!("policy:{id}"),
            AuditOutcome::Success,
        ));
        Ok(())
    }

    pub async fn remove_policy(&self, id: &str) -> Result<bool> {
        let removed = self.repository.remove(id).await?;
        self.policies.write().await.retain(|p| p.id != id);
        if removed {
            self.audit.record(AuditEvent::new(
                &ActorProfile::system(),
                "policy.remove",
                format!("policy:{id}"),
                AuditOutcome::Success,
            ));
        }
        Ok(removed)
    }

    pub async fn set_policy_active(&self, id: &str, active: bool) -> Result<()> {
        let current = self
            .policies
            .read()
            .await
            .iter()
            .find(|p| p.id == id)
            .map(|p| SecurityPolicy::clone(p))
            .ok_or_else(|| SecurityError::Validation(format!("unknown policy {id}")))?;
        self.upsert_policy(SecurityPolicy { active, ..current }).await
    }

    /// Upsert every policy in a JSON policy file.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let policies = load_policies_file(path)?;
        let count = policies.len();
        for policy in policies {
            self.upsert_policy(policy).await?;
        }
        Ok(count)
    }

    pub async fn enforce(
        &self,
        action: &str,
        resource: &str,
        user: &ActorProfile,
        context: &Value,
    ) -> PolicyDecision {
        self.enforce_with_data(action, resource, user, context, &Value::Null)
            .await
    }

    /// Like `enforce`, with an extra `data` payload visible to conditions.
    pub async fn enforce_with_data(
        &self,
        action: &str,
        resource: &str,
        user: &ActorProfile,
        context: &Value,
        data: &Value,
    ) -> PolicyDecision {
        let user_value = serde_json::to_value(user).unwrap_or(Value::Null);
        let scope = Scope::new(action, resource, user_value, context.clone(), data.clone());
        let role = user.role.as_deref().unwrap_or_default();

        let snapshot = self.policies.read().await.clone();
        let mut decision = PolicyDecision::allow();
        let mut advisories = Vec::new();

        for policy in snapshot.iter().filter(|p| p.applies_to(role)) {
            let matched = policy.rules.iter().find(|rule| {
                rule.compiled()
                    .map(|condition| condition.matches(&scope))
                    .unwrap_or(false)
            });
            let Some(rule) = matched else {
                continue;
            };
            decision.matched_policies.push(policy.id.clone());
            debug!(policy_id = %policy.id, rule_id = %rule.id, action = rule.action.as_str(), "policy rule matched");

            if rule.action.is_denial() {
                if policy.enforcement == EnforcementLevel::Blocking {
                    warn!(policy_id = %policy.id, rule_id = %rule.id, action, resource, actor = %user.id, "request denied by blocking policy");
                    decision.allowed = false;
                    decision.reason = Some(DENIAL_REASON.to_string());
                    if rule.action == PolicyAction::Quarantine {
                        decision.side_effects.push(PolicyAction::Quarantine);
                    }
                    break;
                }
                warn!(policy_id = %policy.id, rule_id = %rule.id, level = ?policy.enforcement, action, resource, "non-blocking policy would deny");
                advisories.push(policy.id.clone());
                continue;
            }
            if rule.action != PolicyAction::Allow && !decision.side_effects.contains(&rule.action) {
                decision.side_effects.push(rule.action);
            }
        }

        self.record(action, resource, user, &decision, &advisories);
        decision
    }

    /// `enforce`, with a denial surfaced as `PolicyDenied`.
    pub async fn authorize(
        &self,
        action: &str,
        resource: &str,
        user: &ActorProfile,
        context: &Value,
    ) -> Result<PolicyDecision> {
        let decision = self.enforce(action, resource, user, context).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(SecurityError::PolicyDenied(
                decision.reason.unwrap_or_else(|| DENIAL_REASON.to_string()),
            ))
        }
    }

    fn record(
        &self,
        action: &str,
        resource: &str,
        user: &ActorProfile,
        decision: &PolicyDecision,
        advisories: &[String],
    ) {
        let outcome = if decision.allowed {
            AuditOutcome::Success
        } else {
            AuditOutcome::Denied
        };
        let effects: Vec<&str> = decision.side_effects.iter().map(|e| e.as_str()).collect();
        let mut event = AuditEvent::new(user, action, resource, outcome)
            .with_metadata("matched_policies", json!(decision.matched_policies))
            .with_metadata("side_effects", json!(effects));
        if !advisories.is_empty() {
            event = event.with_metadata("advisory_denials", json!(advisories));
        }
        if decision.side_effects.contains(&PolicyAction::Quarantine) {
            event = event.with_min_risk(RiskLevel::Critical);
        } else if decision.side_effects.contains(&PolicyAction::Alert) {
            event = event.with_min_risk(RiskLevel::High);
        }
        self.audit.record(event);
    }
}
