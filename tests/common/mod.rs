#![allow(dead_code)]

use std::sync::Arc;

use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use sha2::{Digest, Sha256};

use trustgate::audit::{AuditConfig, AuditSealer, AuditTrail, MemoryAuditSink};
use trustgate::webauthn::client_data::{
    b64url_decode, b64url_encode, FLAG_ATTESTED_DATA, FLAG_USER_PRESENT,
};
use trustgate::webauthn::types::{AssertionResponse, AttestationResponse};
use trustgate::webauthn::{
    AuthenticationResponse, CredentialAuthenticator, InMemoryChallengeRepository,
    InMemoryCredentialRepository, RegistrationResponse, RelyingPartyConfig, WebAuthnSettings,
};

pub const RP_ID: &str = "trust.example.com";
pub const ORIGIN: &str = "https://trust.example.com";
pub const AUDIT_KEY: &[u8] = b"integration-audit-key";

const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

pub fn relying_party() -> RelyingPartyConfig {
    RelyingPartyConfig {
        id: RP_ID.into(),
        name: "Trust".into(),
        origin: ORIGIN.into(),
    }
}

pub fn audit_trail() -> (AuditTrail, MemoryAuditSink) {
    let sink = MemoryAuditSink::new();
    let trail = AuditTrail::new(
        AuditConfig::default(),
        Arc::new(sink.clone()),
        AuditSealer::new(AUDIT_KEY).unwrap(),
    );
    (trail, sink)
}

pub fn authenticator(settings: WebAuthnSettings, audit: &AuditTrail) -> CredentialAuthenticator {
    CredentialAuthenticator::new(
        relying_party(),
        settings,
        Arc::new(InMemoryCredentialRepository::new()),
        Arc::new(InMemoryChallengeRepository::new()),
        audit.clone(),
    )
    .unwrap()
}

/// Software P-256 authenticator producing "none" attestation registrations and
/// signed assertions.
pub struct SoftKey {
    pair: EcdsaKeyPair,
    pub id: String,
}

impl SoftKey {
    pub fn new(id: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng).unwrap();
        Self {
            pair,
            id: b64url_encode(id.as_bytes()),
        }
    }

    fn spki(&self) -> Vec<u8> {
        let mut spki = P256_SPKI_PREFIX.to_vec();
        spki.extend_from_slice(self.pair.public_key().as_ref());
        spki
    }

    fn auth_data(&self, counter: u32, attested: bool) -> Vec<u8> {
        let mut raw = Sha256::digest(RP_ID.as_bytes()).to_vec();
        let mut flags = FLAG_USER_PRESENT;
        if attested {
            flags |= FLAG_ATTESTED_DATA;
        }
        raw.push(flags);
        raw.extend_from_slice(&counter.to_be_bytes());
        if attested {
            let id = b64url_decode(&self.id, "id").unwrap();
            raw.extend_from_slice(&[0u8; 16]);
            raw.extend_from_slice(&(id.len() as u16).to_be_bytes());
            raw.extend_from_slice(&id);
        }
        raw
    }

    pub fn register(&self, challenge: &str) -> RegistrationResponse {
        self.register_from(challenge, ORIGIN)
    }

    pub fn register_from(&self, challenge: &str, origin: &str) -> RegistrationResponse {
        let client = format!(
            r#"{{"type":"webauthn.create","challenge":"{challenge}","origin":"{origin}"}}"#
        );
        RegistrationResponse {
            id: self.id.clone(),
            raw_id: self.id.clone(),
            kind: "public-key".into(),
            response: AttestationResponse {
                client_data_json: b64url_encode(client.as_bytes()),
                attestation_object: None,
                authenticator_data: b64url_encode(&self.auth_data(0, true)),
                public_key: b64url_encode(&self.spki()),
                public_key_algorithm: -7,
                transports: vec!["internal".into()],
            },
            authenticator_attachment: Some("platform".into()),
        }
    }

    pub fn assert(&self, challenge: &str, counter: u32) -> AuthenticationResponse {
        let client =
            format!(r#"{{"type":"webauthn.get","challenge":"{challenge}","origin":"{ORIGIN}"}}"#);
        let auth_data = self.auth_data(counter, false);
        let mut msg = auth_data.clone();
        msg.extend_from_slice(&Sha256::digest(client.as_bytes()));
        let sig = self.pair.sign(&SystemRandom::new(), &msg).unwrap();
        AuthenticationResponse {
            id: self.id.clone(),
            raw_id: self.id.clone(),
            kind: "public-key".into(),
            response: AssertionResponse {
                client_data_json: b64url_encode(client.as_bytes()),
                authenticator_data: b64url_encode(&auth_data),
                signature: b64url_encode(sig.as_ref()),
                user_handle: None,
            },
        }
    }
}
