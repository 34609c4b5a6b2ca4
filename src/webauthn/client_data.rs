use base64::{engine::general_purpose, Engine};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Result, SecurityError};

pub const TYPE_CREATE: &str = "webauthn.create";
pub const TYPE_GET: &str = "webauthn.get";

pub const FLAG_USER_PRESENT: u8 = 0x01;
pub const FLAG_USER_VERIFIED: u8 = 0x04;
pub const FLAG_ATTESTED_DATA: u8 = 0x40;

/// Decode base64url, tolerating padding.
pub fn b64url_decode(input: &str, field: &str) -> Result<Vec<u8>> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(input.trim_end_matches('='))
        .or_else(|_| general_purpose::URL_SAFE.decode(input))
        .map_err(|_| SecurityError::Validation(format!("{field} is not valid base64url")))
}

pub fn b64url_encode(bytes: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// `CollectedClientData` as serialized by the browser.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedClientData {
    #[serde(rename = "type")]
    pub kind: String,
    pub challenge: String,
    pub origin: String,
    #[serde(default)]
    pub cross_origin: bool,
}

impl CollectedClientData {
    /// Parse the base64url `clientDataJSON`; also returns the raw bytes, which
    /// are hashed into the signed message.
    pub fn parse(encoded: &str) -> Result<(Self, Vec<u8>)> {
        let raw = b64url_decode(encoded, "clientDataJSON")?;
        let parsed = serde_json::from_slice(&raw)
            .map_err(|_| SecurityError::Validation("clientDataJSON is malformed".into()))?;
        Ok((parsed, raw))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttestedCredential {
    pub aaguid: Uuid,
    pub credential_id: Vec<u8>,
}

/// Authenticator data: `rpIdHash(32) || flags(1) || signCount(4) || [attested data]`.
#[derive(Debug, Clone)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub flags: u8,
    pub sign_count: u32,
    pub attested: Option<AttestedCredential>,
    pub raw: Vec<u8>,
}

impl AuthenticatorData {
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 37 {
            return Err(SecurityError::Validation("authenticator data is truncated".into()));
        }
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&raw[..32]);
        let flags = raw[32];
        let sign_count = u32::from_be_bytes([raw[33], raw[34], raw[35], raw[36]]);

        let attested = if flags & FLAG_ATTESTED_DATA != 0 {
            // aaguid(16) || credIdLen(2) || credId || COSE key
            let rest = &raw[37..];
            if rest.len() < 18 {
                return Err(SecurityError::Validation(
                    "attested credential data is truncated".into(),
                ));
            }
            let mut aaguid = [0u8; 16];
            aaguid.copy_from_slice(&rest[..16]);
            let id_len = u16::from_be_bytes([rest[16], rest[17]]) as usize;
            let id = rest
                .get(18..18 + id_len)
                .ok_or_else(|| SecurityError::Validation("credential id is truncated".into()))?;
            Some(AttestedCredential {
                aaguid: Uuid::from_bytes(aaguid),
                credential_id: id.to_vec(),
            })
        } else {
            None
        };

        Ok(Self {
            rp_id_hash,
            flags,
            sign_count,
            attested,
            raw,
        })
    }

    pub fn from_b64url(encoded: &str) -> Result<Self> {
        Self::parse(b64url_decode(encoded, "authenticatorData")?)
    }

    pub fn user_present(&self) -> bool {
        self.flags & FLAG_USER_PRESENT != 0
    }

    pub fn user_verified(&self) -> bool {
        self.flags & FLAG_USER_VERIFIED != 0
    }

    pub fn aaguid(&self) -> Option<Uuid> {
        self.attested.as_ref().map(|a| a.aaguid).filter(|id| !id.is_nil())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_data(flags: u8, count: u32, attested: Option<(&[u8; 16], &[u8])>) -> Vec<u8> {
        let mut raw = vec![0xAA; 32];
        raw.push(flags);
        raw.extend_from_slice(&count.to_be_bytes());
        if let Some((aaguid, id)) = attested {
            raw.extend_from_slice(aaguid);
            raw.extend_from_slice(&(id.len() as u16).to_be_bytes());
            raw.extend_from_slice(id);
            raw.extend_from_slice(&[0xA5, 0x01, 0x02]);
        }
        raw
    }

    #[test]
    fn parses_assertion_data() {
        let data = AuthenticatorData::parse(auth_data(FLAG_USER_PRESENT, 42, None)).unwrap();
        assert_eq!(data.sign_count, 42);
        assert!(data.user_present());
        assert!(!data.user_verified());
        assert!(data.attested.is_none());
    }

    #[test]
    fn parses_attested_credential() {
        let aaguid = [0x11u8; 16];
        let raw = auth_data(FLAG_USER_PRESENT | FLAG_ATTESTED_DATA, 0, Some((&aaguid, b"cred-A")));
        let data = AuthenticatorData::parse(raw).unwrap();
        let attested = data.attested.clone().unwrap();
        assert_eq!(attested.credential_id, b"cred-A");
        assert_eq!(data.aaguid(), Some(Uuid::from_bytes(aaguid)));
    }

    #[test]
    fn nil_aaguid_is_none() {
        let raw = auth_data(FLAG_USER_PRESENT | FLAG_ATTESTED_DATA, 0, Some((&[0u8; 16], b"x")));
        assert_eq!(AuthenticatorData::parse(raw).unwrap().aaguid(), None);
    }

    #[test]
    fn rejects_truncated_data() {
        assert!(AuthenticatorData::parse(vec![0u8; 20]).is_err());
        let mut raw = auth_data(FLAG_ATTESTED_DATA, 0, Some((&[1u8; 16], b"abcdef")));
        raw.truncate(37 + 18 + 2);
        assert!(AuthenticatorData::parse(raw).is_err());
    }

    #[test]
    fn client_data_roundtrip() {
        let json = r#"{"type":"webauthn.get","challenge":"abc","origin":"https://example.com"}"#;
        let (parsed, raw) = CollectedClientData::parse(&b64url_encode(json.as_bytes())).unwrap();
        assert_eq!(parsed.kind, TYPE_GET);
        assert!(!parsed.cross_origin);
        assert_eq!(raw, json.as_bytes());
    }

    #[test]
    fn b64url_accepts_padding() {
        assert_eq!(b64url_decode("YQ==", "f").unwrap(), b"a");
        assert_eq!(b64url_decode("YQ", "f").unwrap(), b"a");
        assert!(b64url_decode("***", "f").is_err());
    }
}
