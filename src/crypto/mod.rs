//! Envelope encryption: AES-256-GCM payloads under per-context data keys, wrapped
//! by a versioned master key held in a local keyring or a Vault transit engine.
pub mod aead;
pub mod envelope;
pub mod keys;
pub mod kms;
pub mod provider;
pub mod rotation;

pub use envelope::{EncryptionEnvelope, EnvelopeEncryptionService};
pub use keys::{DataKey, EncryptionContext};
pub use kms::TransitKeyProvider;
pub use provider::{KeyProvider, LocalKeyProvider};
pub use rotation::spawn_key_rotation;
