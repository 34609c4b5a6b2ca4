use serde::{Deserialize, Serialize};

use crate::error::{Result, SecurityError};
use crate::policy::expr::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementLevel {
    Advisory,
    Warning,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
    Log,
    Encrypt,
    Alert,
    Quarantine,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Deny => "deny",
            PolicyAction::Log => "log",
            PolicyAction::Encrypt => "encrypt",
            PolicyAction::Alert => "alert",
            PolicyAction::Quarantine => "quarantine",
        }
    }

    pub fn is_denial(&self) -> bool {
        matches!(self, PolicyAction::Deny | PolicyAction::Quarantine)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Lower runs first.
    pub priority: i32,
    pub condition: String,
    pub action: PolicyAction,
    #[serde(skip)]
    compiled: Option<Condition>,
}

impl PolicyRule {
    pub fn new(id: impl Into<String>, priority: i32, condition: impl Into<String>, action: PolicyAction) -> Self {
        let condition = condition.into();
        Self {
            id: id.into(),
            priority,
            compiled: Some(Condition::compile(&condition)),
            condition,
            action,
        }
    }

    pub(crate) fn compile(&mut self) -> &Condition {
        self.compiled.get_or_insert_with(|| Condition::compile(&self.condition))
    }

    pub(crate) fn compiled(&self) -> Option<&Condition> {
        self.compiled.as_ref()
    }
}

impl PartialEq for PolicyRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.priority == other.priority
            && self.condition == other.condition
            && self.action == other.action
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub rules: Vec<PolicyRule>,
    pub enforcement: EnforcementLevel,
    /// Roles the policy applies to; `"all"` matches every caller.
    pub roles: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl SecurityPolicy {
    pub fn applies_to(&self, role: &str) -> bool {
        self.active && self.roles.iter().any(|r| r == "all" || r == role)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SecurityError::Validation("policy id is required".into()));
        }
        if self.roles.is_empty() {
            return Err(SecurityError::Validation(format!(
                "policy {} applies to no roles",
                self.id
            )));
        }
        Ok(())
    }

    /// Sort rules by priority and compile their conditions. Returns the ids of
    /// rules whose condition failed to compile.
    pub(crate) fn prepare(&mut self) -> Vec<String> {
        self.rules.sort_by_key(|r| r.priority);
        let mut broken = Vec::new();
        for rule in &mut self.rules {
            if rule.compile().error().is_some() {
                broken.push(rule.id.clone());
            }
        }
        broken
    }
}

/// Outcome of `PolicyEngine::enforce`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<PolicyAction>,
    /// Policies whose rules matched, in evaluation order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub matched_policies: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            side_effects: Vec::new(),
            matched_policies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_json_roundtrip_compiles_rules() {
        let raw = r#"{
            "id": "p1",
            "rules": [
                {"id": "late", "priority": 20, "condition": "true", "action": "log"},
                {"id": "early", "priority": 5, "condition": "action == 'x'", "action": "deny"},
                {"id": "broken", "priority": 9, "condition": "eval(1)", "action": "alert"}
            ],
            "enforcement": "blocking",
            "roles": ["all"]
        }"#;
        let mut policy: SecurityPolicy = serde_json::from_str(raw).unwrap();
        assert!(policy.active);
        assert!(policy.rules[0].compiled().is_none());
        let broken = policy.prepare();
        assert_eq!(broken, vec!["broken".to_string()]);
        let order: Vec<&str> = policy.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["early", "broken", "late"]);
        assert!(policy.applies_to("viewer"));
    }

    #[test]
    fn role_filter() {
        let mut policy = SecurityPolicy {
            id: "p".into(),
            name: String::new(),
            rules: vec![],
            enforcement: EnforcementLevel::Advisory,
            roles: vec!["admin".into()],
            active: true,
        };
        assert!(policy.applies_to("admin"));
        assert!(!policy.applies_to("viewer"));
        policy.active = false;
        assert!(!policy.applies_to("admin"));
    }
}
