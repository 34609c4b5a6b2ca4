//! Request admission: DDoS screening, token-bucket rate limiting and the
//! signature-counter replay guard used by the authenticator.
pub mod ddos;
pub mod gate;
pub mod rate_limit;
pub mod replay;

pub use ddos::{DdosConfig, DdosGuard, DdosVerdict, HttpThreatFeed, InboundRequest, ThreatFeed};
pub use gate::{GateDecision, RequestGate};
pub use rate_limit::{RateLimitDecision, RateLimitRule, RateLimiter};
pub use replay::CounterGuard;
