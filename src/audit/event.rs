use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Computed severity of an audited outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    Blocked,
}

/// Who performed an action, as far as the caller knows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorProfile {
    pub id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub ip: Option<String>,
}

impl ActorProfile {
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            ..Default::default()
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            authenticated: true,
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self {
            id: "system".to_string(),
            role: Some("system".to_string()),
            authenticated: true,
            ip: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// Immutable record of one security-relevant outcome.
///
/// `seal` is filled in by the trail when the event is appended; an event is never
/// modified after that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource: String,
    pub outcome: AuditOutcome,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seal: Option<String>,
}

impl AuditEvent {
    /// Build an event whose risk level is assessed from the action, outcome and actor.
    pub fn new(
        actor: &ActorProfile,
        action: impl Into<String>,
        resource: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        let action = action.into();
        let risk_level = assess_risk(&action, outcome, actor);
        let mut metadata = Map::new();
        if let Some(role) = &actor.role {
            metadata.insert("actor_role".to_string(), Value::String(role.clone()));
        }
        if let Some(ip) = &actor.ip {
            metadata.insert("actor_ip".to_string(), Value::String(ip.clone()));
        }
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.id.clone(),
            action,
            resource: resource.into(),
            outcome,
            risk_level,
            metadata,
            seal: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Raise the risk level to at least `floor`.
    pub fn with_min_risk(mut self, floor: RiskLevel) -> Self {
        self.risk_level = self.risk_level.max(floor);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.risk_level == RiskLevel::Critical
    }
}

const CRITICAL_ACTION_MARKERS: &[&str] = &["key", "admin", "policy", "export", "purge"];
const ELEVATED_ACTION_MARKERS: &[&str] = &[
    "delete",
    "disable",
    "credential",
    "register",
    "decrypt",
    "rotate",
    "blacklist",
];

fn action_sensitivity(action: &str) -> u8 {
    let action = action.to_ascii_lowercase();
    if CRITICAL_ACTION_MARKERS.iter().any(|m| action.contains(m)) {
        2
    } else if ELEVATED_ACTION_MARKERS.iter().any(|m| action.contains(m)) {
        1
    } else {
        0
    }
}

/// Risk = outcome weight + action sensitivity + actor weight.
///
/// 0-1 low, 2 medium, 3-4 high, 5+ critical.
pub fn assess_risk(action: &str, outcome: AuditOutcome, actor: &ActorProfile) -> RiskLevel {
    let outcome_weight = match outcome {
        AuditOutcome::Success => 0u8,
        AuditOutcome::Failure | AuditOutcome::Denied => 2,
        AuditOutcome::Blocked => 3,
    };

    let mut actor_weight = 0u8;
    if !actor.authenticated {
        actor_weight += 1;
    }
    if matches!(actor.role.as_deref(), Some("admin") | Some("owner")) {
        actor_weight += 1;
    }

    match outcome_weight + action_sensitivity(action) + actor_weight {
        0..=1 => RiskLevel::Low,
        2 => RiskLevel::Medium,
        3..=4 => RiskLevel::High,
        _ => RiskLevel::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_success_is_low_risk() {
        let actor = ActorProfile::user("u-1").with_role("viewer");
        assert_eq!(assess_risk("report:read", AuditOutcome::Success, &actor), RiskLevel::Low);
    }

    #[test]
    fn failed_admin_action_by_anonymous_is_critical() {
        let actor = ActorProfile::anonymous();
        assert_eq!(
            assess_risk("admin:policy:update", AuditOutcome::Denied, &actor),
            RiskLevel::Critical
        );
    }

    #[test]
    fn credential_failure_is_high() {
        let actor = ActorProfile::user("u-1");
        assert_eq!(
            assess_risk("webauthn.register", AuditOutcome::Failure, &actor),
            RiskLevel::High
        );
    }

    #[test]
    fn min_risk_only_raises() {
        let actor = ActorProfile::user("u-1");
        let event = AuditEvent::new(&actor, "read", "doc", AuditOutcome::Success)
            .with_min_risk(RiskLevel::Critical);
        assert!(event.is_critical());

        let event = AuditEvent::new(&ActorProfile::anonymous(), "admin:delete", "x", AuditOutcome::Blocked)
            .with_min_risk(RiskLevel::Low);
        assert_eq!(event.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn actor_attributes_land_in_metadata() {
        let mut actor = ActorProfile::user("u-9").with_role("admin");
        actor.ip = Some("10.0.0.1".into());
        let event = AuditEvent::new(&actor, "login", "session", AuditOutcome::Success);
        assert_eq!(event.metadata["actor_role"], "admin");
        assert_eq!(event.metadata["actor_ip"], "10.0.0.1");
        assert!(event.seal.is_none());
    }
}
