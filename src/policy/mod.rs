//! Policy-driven authorization over an allow-listed condition language.
pub mod engine;
pub mod expr;
pub mod repository;
pub mod types;

pub use engine::{PolicyEngine, DENIAL_REASON};
pub use expr::{Condition, ExprError, Scope};
pub use repository::{load_policies_file, InMemoryPolicyRepository, PolicyRepository};
pub use types::{EnforcementLevel, PolicyAction, PolicyDecision, PolicyRule, SecurityPolicy};
