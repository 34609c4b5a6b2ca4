mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{audit_trail, authenticator, SoftKey, AUDIT_KEY};
use serde_json::json;
use trustgate::audit::{verify_chain, ActorProfile, AuditOutcome};
use trustgate::policy::{
    EnforcementLevel, InMemoryPolicyRepository, PolicyAction, PolicyEngine, PolicyRule,
    SecurityPolicy, DENIAL_REASON,
};
use trustgate::security::ddos::CONNECTION_LIMIT_REASON;
use trustgate::security::{
    DdosConfig, DdosGuard, GateDecision, InboundRequest, RateLimitRule, RateLimiter, RequestGate,
};
use trustgate::webauthn::WebAuthnSettings;
use trustgate::SecurityError;

const BROWSER: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) Safari/605.1.15";

fn login(ip: &str) -> InboundRequest {
    InboundRequest::new(ip, "POST", "/webauthn/authenticate").with_user_agent(BROWSER)
}

fn export_policy() -> SecurityPolicy {
    SecurityPolicy {
        id: "data-export".into(),
        name: "Exports need an analyst with MFA".into(),
        rules: vec![
            PolicyRule::new(
                "analyst-export",
                1,
                "action == 'data:export' && user.role == 'analyst' && context.mfa",
                PolicyAction::Log,
            ),
            PolicyRule::new("deny-export", 2, "action == 'data:export'", PolicyAction::Deny),
        ],
        enforcement: EnforcementLevel::Blocking,
        roles: vec!["all".into()],
        active: true,
    }
}

#[tokio::test]
async fn gated_login_then_policy_checked_export() {
    let (audit, sink) = audit_trail();
    let limiter = RateLimiter::with_rules([RateLimitRule::new("default", 100, 60_000, 100)]);
    let guard = DdosGuard::new(DdosConfig::default()).unwrap();
    let gate = RequestGate::new(guard, limiter, "default", audit.clone());
    let auth = authenticator(WebAuthnSettings::default(), &audit);
    let engine = PolicyEngine::new(
        Arc::new(InMemoryPolicyRepository::with_policies([export_policy()])),
        audit.clone(),
    )
    .await
    .unwrap();

    let key = SoftKey::new("cred-A");
    let opts = auth
        .begin_registration("alice", "alice@example.com", "Alice", Default::default())
        .await
        .unwrap();
    assert!(auth
        .complete_registration("alice", "laptop", &key.register(&opts.challenge))
        .await
        .unwrap()
        .verified);

    let decision = gate.screen(&login("192.0.2.10")).await.unwrap();
    assert!(decision.is_admitted(), "{decision:?}");

    let opts = auth.begin_authentication(Some("alice")).await.unwrap();
    let result = auth
        .complete_authentication(&key.assert(&opts.challenge, 1), Some("alice"))
        .await
        .unwrap();
    assert!(result.verified);

    let mut actor = ActorProfile::user(result.user_id.unwrap())
        .with_role("analyst")
        .with_ip("192.0.2.10");
    actor.authenticated = true;

    let allowed = engine
        .authorize("data:export", "report-7", &actor, &json!({"mfa": true}))
        .await
        .unwrap();
    assert_eq!(allowed.side_effects, vec![PolicyAction::Log]);
    assert_eq!(allowed.matched_policies, vec!["data-export".to_string()]);

    let denied = engine
        .enforce("data:export", "report-7", &actor, &json!({"mfa": false}))
        .await;
    assert!(!denied.allowed);
    assert_eq!(denied.reason.as_deref(), Some(DENIAL_REASON));
    assert!(matches!(
        engine
            .authorize("data:export", "report-7", &actor, &json!({}))
            .await,
        Err(SecurityError::PolicyDenied(_))
    ));

    audit.flush().await.unwrap();
    let events = sink.events().await;
    assert!(verify_chain(AUDIT_KEY, &events).is_ok());
    let exports = sink.events_for_action("data:export").await;
    assert_eq!(exports.len(), 3);
    assert_eq!(exports[0].outcome, AuditOutcome::Success);
    assert_eq!(exports[1].outcome, AuditOutcome::Denied);
}

#[tokio::test(start_paused = true)]
async fn flood_from_one_address_is_blocked_and_audited() {
    let (audit, sink) = audit_trail();
    let limiter = RateLimiter::with_rules([RateLimitRule::new("default", 1000, 60_000, 1000)]);
    let guard = DdosGuard::new(DdosConfig::default()).unwrap();
    let gate = RequestGate::new(guard, limiter, "default", audit.clone());

    for i in 0..100 {
        let decision = gate.screen(&login("198.51.100.23")).await.unwrap();
        assert!(decision.is_admitted(), "request {i}: {decision:?}");
        tokio::time::advance(Duration::from_millis(500)).await;
    }
    match gate.screen(&login("198.51.100.23")).await.unwrap() {
        GateDecision::Blocked { verdict } => {
            assert_eq!(verdict.reason.as_deref(), Some(CONNECTION_LIMIT_REASON));
        }
        other => panic!("expected block, got {other:?}"),
    }
    assert!(gate.screen(&login("198.51.100.24")).await.unwrap().is_admitted());

    audit.flush().await.unwrap();
    let blocked = sink.events_for_action("request.blocked").await;
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].outcome, AuditOutcome::Blocked);
}

#[tokio::test(start_paused = true)]
async fn throttled_client_recovers_after_refill() {
    let (audit, sink) = audit_trail();
    let limiter = RateLimiter::with_rules([RateLimitRule::new("default", 1, 1000, 1)]);
    let guard = DdosGuard::new(DdosConfig::default()).unwrap();
    let gate = RequestGate::new(guard, limiter, "default", audit.clone());

    assert!(gate.screen(&login("203.0.113.50")).await.unwrap().is_admitted());
    assert!(matches!(
        gate.screen(&login("203.0.113.50")).await.unwrap(),
        GateDecision::Throttled { .. }
    ));
    tokio::time::advance(Duration::from_millis(1100)).await;
    assert!(gate.screen(&login("203.0.113.50")).await.unwrap().is_admitted());

    audit.flush().await.unwrap();
    assert_eq!(sink.events_for_action("request.throttled").await.len(), 1);
}
