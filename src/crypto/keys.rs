use std::collections::BTreeMap;
use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecurityError};

pub const KEY_LEN: usize = 32;

/// Logical scope an envelope is bound to. Sorted, so its JSON form is canonical.
pub type EncryptionContext = BTreeMap<String, String>;

/// 256-bit symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| SecurityError::KeyUnavailable("system randomness unavailable".into()))?;
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SecurityError::KeyUnavailable("key material has the wrong length".into()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        use subtle::ConstantTimeEq;
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

/// Canonical byte form of an optional context; `None` and an empty map are equal.
pub fn canonical_context(context: Option<&EncryptionContext>) -> Vec<u8> {
    match context {
        Some(ctx) => serde_json::to_vec(ctx).unwrap_or_default(),
        None => b"{}".to_vec(),
    }
}

pub fn context_digest(context: Option<&EncryptionContext>) -> [u8; 32] {
    Sha256::digest(canonical_context(context)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(DataKey::generate().unwrap(), DataKey::generate().unwrap());
    }

    #[test]
    fn debug_never_prints_material() {
        let key = DataKey::from_slice(&[0xAB; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "DataKey([REDACTED])");
    }

    #[test]
    fn from_slice_checks_length() {
        assert!(DataKey::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn context_is_order_independent() {
        let mut a = EncryptionContext::new();
        a.insert("tenant".into(), "t1".into());
        a.insert("purpose".into(), "backup".into());
        let mut b = EncryptionContext::new();
        b.insert("purpose".into(), "backup".into());
        b.insert("tenant".into(), "t1".into());
        assert_eq!(canonical_context(Some(&a)), canonical_context(Some(&b)));
        assert_eq!(canonical_context(None), canonical_context(Some(&EncryptionContext::new())));
        assert_ne!(context_digest(Some(&a)), context_digest(None));
    }
}
