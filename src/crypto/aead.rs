use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Result, SecurityError};

/// Algorithm identifier written into envelopes.
pub const ALGORITHM: &str = "AES-256-GCM";

fn less_safe_key(key: &[u8]) -> Option<LessSafeKey> {
    UnboundKey::new(&AES_256_GCM, key).ok().map(LessSafeKey::new)
}

/// Encrypt and authenticate `plaintext`. Output is `nonce || ciphertext || tag`
/// with a fresh random nonce on every call.
pub fn seal(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = less_safe_key(key)
        .ok_or_else(|| SecurityError::KeyUnavailable("data key has the wrong length".into()))?;

    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| SecurityError::KeyUnavailable("system randomness unavailable".into()))?;

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(aad),
        &mut in_out,
    )
    .map_err(|_| SecurityError::KeyUnavailable("cipher rejected the data key".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Reverse of [`seal`]. Any failure, including a truncated input, is
/// `DecryptionFailed`; no partial plaintext is ever returned.
pub fn open(key: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(SecurityError::DecryptionFailed);
    }
    let key = less_safe_key(key).ok_or(SecurityError::DecryptionFailed)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce =
        Nonce::try_assume_unique_for_key(nonce).map_err(|_| SecurityError::DecryptionFailed)?;

    let mut in_out = ciphertext.to_vec();
    let len = key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| SecurityError::DecryptionFailed)?
        .len();
    in_out.truncate(len);
    Ok(in_out)
}
