//! Append-only audit stream, risk scoring and incident escalation.

pub mod event;
pub mod incident;
pub mod seal;
pub mod sink;
pub mod trail;

pub use event::{assess_risk, ActorProfile, AuditEvent, AuditOutcome, RiskLevel};
pub use incident::{Incident, IncidentManager, IncidentStatus, LogNotifier, Notifier, WebhookNotifier};
pub use seal::{verify_chain, AuditSealer};
pub use sink::{AuditSink, FanoutSink, JsonLinesAuditSink, MemoryAuditSink, TracingAuditSink};
pub use trail::{AuditConfig, AuditTrail};
