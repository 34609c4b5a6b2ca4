use base64::{engine::general_purpose, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::audit::event::AuditEvent;
use crate::error::{Result, SecurityError};

// seal_n = HMAC-SHA256(key, seal_{n-1} || canonical_json(event_n without seal)), base64

type HmacSha256 = Hmac<Sha256>;

const GENESIS: &str = "genesis";

/// Chains HMAC seals over appended audit events so that modification,
/// deletion or reordering of a stored sequence is detectable.
#[derive(Clone)]
pub struct AuditSealer {
    mac: HmacSha256,
    last_seal: String,
}

impl std::fmt::Debug for AuditSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSealer")
            .field("mac", &"[REDACTED]")
            .field("last_seal", &self.last_seal)
            .finish()
    }
}

fn keyed(key: &[u8]) -> Result<HmacSha256> {
    if key.is_empty() {
        return Err(SecurityError::Validation("audit seal key must not be empty".into()));
    }
    HmacSha256::new_from_slice(key)
        .map_err(|e| SecurityError::Validation(format!("audit seal key rejected: {e}")))
}

impl AuditSealer {
    /// Fails with `Validation` for an empty key.
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            mac: keyed(key.as_ref())?,
            last_seal: GENESIS.to_string(),
        })
    }

    /// Key from `TRUSTGATE_AUDIT_KEY`, or a random per-process key when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var("TRUSTGATE_AUDIT_KEY") {
            Ok(key) if !key.is_empty() => Self::new(key.into_bytes()),
            _ => {
                use rand::RngCore;
                let mut key = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                tracing::warn!("TRUSTGATE_AUDIT_KEY not set; audit seals use an ephemeral key");
                Self::new(key)
            }
        }
    }

    /// Seal `event` in place and advance the chain.
    pub fn seal(&mut self, event: &mut AuditEvent) {
        event.seal = None;
        let seal = compute_seal(&self.mac, &self.last_seal, event);
        event.seal = Some(seal.clone());
        self.last_seal = seal;
    }
}

fn canonical_bytes(event: &AuditEvent) -> Vec<u8> {
    let mut unsealed = event.clone();
    unsealed.seal = None;
    // serde_json maps are sorted, so this is stable for a given event
    serde_json::to_vec(&unsealed).unwrap_or_default()
}

fn compute_seal(keyed: &HmacSha256, previous: &str, event: &AuditEvent) -> String {
    let mut mac = keyed.clone();
    mac.update(previous.as_bytes());
    mac.update(&canonical_bytes(event));
    general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify a contiguous chain starting at genesis. Returns the index of the first
/// event whose seal does not verify; nothing verifies under an unusable key.
pub fn verify_chain(key: &[u8], events: &[AuditEvent]) -> Result<(), usize> {
    let Ok(mac) = keyed(key) else {
        return Err(0);
    };
    let mut previous = GENESIS.to_string();
    for (idx, event) in events.iter().enumerate() {
        let Some(seal) = event.seal.as_deref() else {
            return Err(idx);
        };
        let expected = compute_seal(&mac, &previous, event);
        if expected.as_bytes().ct_eq(seal.as_bytes()).unwrap_u8() != 1 {
            return Err(idx);
        }
        previous = seal.to_string();
    }
    Ok(())
}
