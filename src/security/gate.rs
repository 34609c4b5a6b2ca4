use serde::Serialize;
use tracing::debug;

use crate::audit::{ActorProfile, AuditEvent, AuditOutcome, AuditTrail};
use crate::error::Result;
use crate::security::ddos::{DdosGuard, DdosVerdict, InboundRequest};
use crate::security::rate_limit::{RateLimitDecision, RateLimiter};

/// Result of screening one inbound request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateDecision {
    Admitted { limit: RateLimitDecision },
    Blocked { verdict: DdosVerdict },
    Throttled { limit: RateLimitDecision },
}

impl GateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateDecision::Admitted { .. })
    }
}

/// First two stages of a gated request: DDoS screening, then rate limiting keyed
/// by source address. Blocks and throttles are audited; admissions are not.
#[derive(Debug, Clone)]
pub struct RequestGate {
    guard: DdosGuard,
    limiter: RateLimiter,
    rule: String,
    audit: AuditTrail,
}

impl RequestGate {
    pub fn new(guard: DdosGuard, limiter: RateLimiter, rule: impl Into<String>, audit: AuditTrail) -> Self {
        Self {
            guard,
            limiter,
            rule: rule.into(),
            audit,
        }
    }

    pub fn guard(&self) -> &DdosGuard {
        &self.guard
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn screen(&self, req: &InboundRequest) -> Result<GateDecision> {
        let actor = ActorProfile::anonymous().with_ip(req.ip.clone());

        let verdict = self.guard.should_block(req).await;
        if verdict.blocked {
            self.audit.record(
                AuditEvent::new(&actor, "request.blocked", req.path.clone(), AuditOutcome::Blocked)
                    .with_metadata("reason", verdict.reason.clone().unwrap_or_default())
                    .with_metadata("score", verdict.score),
            );
            return Ok(GateDecision::Blocked { verdict });
        }

        let limit = self.limiter.check(&req.ip, &self.rule).await?;
        if !limit.allowed {
            self.audit.record(
                AuditEvent::new(&actor, "request.throttled", req.path.clone(), AuditOutcome::Denied)
                    .with_metadata("rule", self.rule.clone())
                    .with_metadata("retry_after", limit.retry_after.unwrap_or_default()),
            );
            return Ok(GateDecision::Throttled { limit });
        }

        debug!(ip = %req.ip, path = %req.path, remaining = limit.remaining, "request admitted");
        Ok(GateDecision::Admitted { limit })
    }
}
