use ring::signature::{self, UnparsedPublicKey};
use sha2::{Digest, Sha256};

use crate::error::{Result, SecurityError};
use crate::webauthn::client_data::{b64url_decode, AuthenticatorData};
use crate::webauthn::types::RegistrationResponse;

/// COSE algorithm identifiers.
pub const COSE_ES256: i64 = -7;
pub const COSE_EDDSA: i64 = -8;

// DER prefixes of SubjectPublicKeyInfo for the fixed-size key types.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Attestation statement verification. Pluggable so deployments that require
/// attested authenticators can enforce their own trust roots.
pub trait AttestationVerifier: Send + Sync {
    fn verify(&self, response: &RegistrationResponse, auth_data: &AuthenticatorData) -> Result<()>;
}

/// Accepts `none` attestation, which is what most consumer authenticators send.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneAttestationVerifier;

impl AttestationVerifier for NoneAttestationVerifier {
    fn verify(&self, _response: &RegistrationResponse, _auth_data: &AuthenticatorData) -> Result<()> {
        Ok(())
    }
}

/// Signature verification over `authenticatorData || SHA-256(clientDataJSON)`.
pub trait AssertionVerifier: Send + Sync {
    fn supported_algorithms(&self) -> Vec<i64>;

    /// Validate a public key at registration time.
    fn check_public_key(&self, algorithm: i64, spki_der: &[u8]) -> Result<()>;

    fn verify(
        &self,
        algorithm: i64,
        spki_der: &[u8],
        auth_data: &[u8],
        client_data_json: &[u8],
        signature: &[u8],
    ) -> Result<()>;
}

/// ES256 and EdDSA verification backed by `ring`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RingAssertionVerifier;

impl RingAssertionVerifier {
    fn raw_key<'a>(algorithm: i64, spki_der: &'a [u8]) -> Result<&'a [u8]> {
        let (prefix, key_len): (&[u8], usize) = match algorithm {
            COSE_ES256 => (&P256_SPKI_PREFIX[..], 65),
            COSE_EDDSA => (&ED25519_SPKI_PREFIX[..], 32),
            other => {
                return Err(SecurityError::Validation(format!(
                    "unsupported credential algorithm {other}"
                )))
            }
        };
        match spki_der.strip_prefix(prefix) {
            Some(key) if key.len() == key_len => Ok(key),
            _ => Err(SecurityError::Validation(
                "public key does not match its algorithm".into(),
            )),
        }
    }
}

impl AssertionVerifier for RingAssertionVerifier {
    fn supported_algorithms(&self) -> Vec<i64> {
        vec![COSE_ES256, COSE_EDDSA]
    }

    fn check_public_key(&self, algorithm: i64, spki_der: &[u8]) -> Result<()> {
        let key = Self::raw_key(algorithm, spki_der)?;
        // Uncompressed SEC1 point marker.
        if algorithm == COSE_ES256 && key[0] != 0x04 {
            return Err(SecurityError::Validation("P-256 key must be uncompressed".into()));
        }
        Ok(())
    }

    fn verify(
        &self,
        algorithm: i64,
        spki_der: &[u8],
        auth_data: &[u8],
        client_data_json: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let key = Self::raw_key(algorithm, spki_der).map_err(|_| SecurityError::SignatureInvalid)?;
        let mut message = auth_data.to_vec();
        message.extend_from_slice(&Sha256::digest(client_data_json));

        let algorithm: &'static dyn signature::VerificationAlgorithm = match algorithm {
            COSE_ES256 => &signature::ECDSA_P256_SHA256_ASN1,
            _ => &signature::ED25519,
        };
        UnparsedPublicKey::new(algorithm, key)
            .verify(&message, signature)
            .map_err(|_| SecurityError::SignatureInvalid)
    }
}

/// Decode a stored base64url SPKI key.
pub fn decode_public_key(encoded: &str) -> Result<Vec<u8>> {
    b64url_decode(encoded, "publicKey")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

    fn p256_pair() -> (EcdsaKeyPair, Vec<u8>) {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        let mut spki = P256_SPKI_PREFIX.to_vec();
        spki.extend_from_slice(pair.public_key().as_ref());
        (pair, spki)
    }

    fn signed_message(auth_data: &[u8], client_data: &[u8]) -> Vec<u8> {
        let mut msg = auth_data.to_vec();
        msg.extend_from_slice(&Sha256::digest(client_data));
        msg
    }

    #[test]
    fn verifies_es256_assertion() {
        let (pair, spki) = p256_pair();
        let auth_data = [7u8; 37];
        let client_data = br#"{"type":"webauthn.get"}"#;
        let sig = pair
            .sign(&SystemRandom::new(), &signed_message(&auth_data, client_data))
            .unwrap();

        let verifier = RingAssertionVerifier;
        verifier.check_public_key(COSE_ES256, &spki).unwrap();
        verifier
            .verify(COSE_ES256, &spki, &auth_data, client_data, sig.as_ref())
            .unwrap();
        assert_eq!(
            verifier.verify(COSE_ES256, &spki, &[8u8; 37], client_data, sig.as_ref()),
            Err(SecurityError::SignatureInvalid)
        );
    }

    #[test]
    fn verifies_eddsa_assertion() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let mut spki = ED25519_SPKI_PREFIX.to_vec();
        spki.extend_from_slice(pair.public_key().as_ref());

        let auth_data = [1u8; 37];
        let client_data = b"{}";
        let sig = pair.sign(&signed_message(&auth_data, client_data));
        RingAssertionVerifier
            .verify(COSE_EDDSA, &spki, &auth_data, client_data, sig.as_ref())
            .unwrap();
    }

    #[test]
    fn rejects_key_algorithm_mismatch() {
        let (_, spki) = p256_pair();
        assert!(RingAssertionVerifier.check_public_key(COSE_EDDSA, &spki).is_err());
        assert!(RingAssertionVerifier.check_public_key(-257, &spki).is_err());
        assert_eq!(
            RingAssertionVerifier.verify(COSE_EDDSA, &spki, b"", b"", b""),
            Err(SecurityError::SignatureInvalid)
        );
    }
}
