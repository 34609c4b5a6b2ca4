use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Result, SecurityError};

/// Relying party identity; `origin` is the exact origin clients must report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelyingPartyConfig {
    pub id: String,
    pub name: String,
    pub origin: String,
}

impl RelyingPartyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(SecurityError::Validation(
                "relying party id and name are required".into(),
            ));
        }
        let local = self.origin.starts_with("http://localhost")
            || self.origin.starts_with("http://127.0.0.1");
        if !self.origin.starts_with("https://") && !local {
            return Err(SecurityError::Validation(
                "relying party origin must be https (or localhost)".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZeroCounterSettings {
    /// Accept repeated zero counters from any authenticator.
    #[serde(default)]
    pub permissive: bool,
    /// AAGUIDs of authenticator models known never to increment.
    #[serde(default)]
    pub allowlisted_aaguids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnSettings {
    #[serde(default = "default_challenge_ttl_secs")]
    pub challenge_ttl_secs: u64,
    #[serde(default = "default_max_credentials")]
    pub max_credentials_per_user: usize,
    /// `required`, `preferred` or `discouraged`.
    #[serde(default = "default_user_verification")]
    pub user_verification: String,
    /// Rate-limit rule applied per user to ceremony starts.
    #[serde(default)]
    pub rate_limit_rule: Option<String>,
    #[serde(default)]
    pub zero_counter: ZeroCounterSettings,
    /// Read-through cache TTL for credential lookups; 0 disables the cache.
    #[serde(default = "default_credential_cache_secs")]
    pub credential_cache_secs: u64,
}

fn default_challenge_ttl_secs() -> u64 {
    300
}
fn default_max_credentials() -> usize {
    10
}
fn default_user_verification() -> String {
    "preferred".to_string()
}
fn default_credential_cache_secs() -> u64 {
    30
}

impl Default for WebAuthnSettings {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: default_challenge_ttl_secs(),
            max_credentials_per_user: default_max_credentials(),
            user_verification: default_user_verification(),
            rate_limit_rule: None,
            zero_counter: ZeroCounterSettings::default(),
            credential_cache_secs: default_credential_cache_secs(),
        }
    }
}

impl WebAuthnSettings {
    pub fn validate(&self) -> Result<()> {
        if self.challenge_ttl_secs == 0 || self.max_credentials_per_user == 0 {
            return Err(SecurityError::Validation(
                "challenge ttl and credential limit must be positive".into(),
            ));
        }
        if !matches!(
            self.user_verification.as_str(),
            "required" | "preferred" | "discouraged"
        ) {
            return Err(SecurityError::Validation(format!(
                "unknown user verification requirement '{}'",
                self.user_verification
            )));
        }
        self.zero_counter_aaguids()?;
        Ok(())
    }

    pub fn zero_counter_aaguids(&self) -> Result<Vec<Uuid>> {
        self.zero_counter
            .allowlisted_aaguids
            .iter()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| SecurityError::Validation(format!("invalid aaguid '{s}'")))
            })
            .collect()
    }

    pub fn requires_user_verification(&self) -> bool {
        self.user_verification == "required"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePurpose {
    Registration,
    Authentication,
}

/// Single-use challenge. Consumed exactly once, whether verification succeeds or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: Uuid,
    /// base64url of at least 16 random bytes.
    pub value: String,
    pub user_id: Option<String>,
    pub purpose: ChallengePurpose,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Platform,
    CrossPlatform,
    Unknown,
}

impl DeviceClass {
    pub fn from_attachment(attachment: Option<&str>) -> Self {
        match attachment {
            Some("platform") => DeviceClass::Platform,
            Some("cross-platform") => DeviceClass::CrossPlatform,
            _ => DeviceClass::Unknown,
        }
    }
}

/// A registered public-key credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// base64url credential id.
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// base64url SubjectPublicKeyInfo DER.
    pub public_key: String,
    /// COSE algorithm identifier.
    pub algorithm: i64,
    pub counter: u32,
    #[serde(default)]
    pub aaguid: Option<Uuid>,
    pub device_class: DeviceClass,
    #[serde(default)]
    pub transports: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelyingPartyEntity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntity {
    /// base64url of the user id bytes.
    pub id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubKeyCredParam {
    #[serde(rename = "type")]
    pub kind: String,
    pub alg: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transports: Vec<String>,
}

impl From<&Credential> for CredentialDescriptor {
    fn from(cred: &Credential) -> Self {
        Self {
            kind: "public-key".to_string(),
            id: cred.id.clone(),
            transports: cred.transports.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorSelection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticator_attachment: Option<String>,
    pub resident_key: String,
    pub user_verification: String,
}

/// Caller preferences for a registration ceremony.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequestOptions {
    #[serde(default)]
    pub authenticator_attachment: Option<String>,
    #[serde(default)]
    pub resident_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredentialCreationOptions {
    pub challenge: String,
    pub rp: RelyingPartyEntity,
    pub user: UserEntity,
    pub pub_key_cred_params: Vec<PubKeyCredParam>,
    /// Milliseconds.
    pub timeout: u64,
    pub exclude_credentials: Vec<CredentialDescriptor>,
    pub authenticator_selection: AuthenticatorSelection,
    pub attestation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyCredentialRequestOptions {
    pub challenge: String,
    pub rp_id: String,
    pub timeout: u64,
    pub allow_credentials: Vec<CredentialDescriptor>,
    pub user_verification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    #[serde(default)]
    pub attestation_object: Option<String>,
    pub authenticator_data: String,
    /// base64url SubjectPublicKeyInfo DER.
    pub public_key: String,
    pub public_key_algorithm: i64,
    #[serde(default)]
    pub transports: Vec<String>,
}

/// `PublicKeyCredential` JSON returned by `navigator.credentials.create()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: String,
    pub raw_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub response: AttestationResponse,
    #[serde(default)]
    pub authenticator_attachment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResponse {
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub authenticator_data: String,
    pub signature: String,
    #[serde(default)]
    pub user_handle: Option<String>,
}

/// `PublicKeyCredential` JSON returned by `navigator.credentials.get()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationResponse {
    pub id: String,
    pub raw_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub response: AssertionResponse,
}

fn serialize_error_code<S: Serializer>(
    error: &Option<SecurityError>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(e.code()),
        None => serializer.serialize_none(),
    }
}

/// Outcome of a registration or authentication ceremony.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub verified: bool,
    #[serde(serialize_with = "serialize_error_code", skip_serializing_if = "Option::is_none")]
    pub error: Option<SecurityError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u32>,
}

impl VerificationResult {
    pub fn success(credential: &Credential) -> Self {
        Self {
            verified: true,
            error: None,
            credential_id: Some(credential.id.clone()),
            user_id: Some(credential.user_id.clone()),
            counter: Some(credential.counter),
        }
    }

    pub fn failure(error: SecurityError) -> Self {
        Self {
            verified: false,
            error: Some(error),
            credential_id: None,
            user_id: None,
            counter: None,
        }
    }
}
