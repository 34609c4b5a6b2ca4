pub mod agent;
pub mod audit;
pub mod crypto;
pub mod error;
pub mod policy;
pub mod security;
pub mod utils;
pub mod webauthn;

pub use error::{Result, SecurityError};

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
