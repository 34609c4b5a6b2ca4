use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{ActorProfile, AuditEvent, AuditOutcome, AuditTrail, RiskLevel};
use crate::error::{Result, SecurityError};
use crate::security::rate_limit::RateLimiter;
use crate::security::replay::CounterGuard;
use crate::webauthn::client_data::{
    b64url_decode, b64url_encode, AuthenticatorData, CollectedClientData, TYPE_CREATE, TYPE_GET,
};
use crate::webauthn::repository::{ChallengeRepository, CredentialRepository};
use crate::webauthn::types::{
    AuthenticationResponse, AuthenticatorSelection, Challenge, ChallengePurpose, Credential,
    CredentialDescriptor, DeviceClass, PubKeyCredParam, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialRequestOptions, RegistrationRequestOptions, RegistrationResponse,
    RelyingPartyConfig, RelyingPartyEntity, UserEntity, VerificationResult, WebAuthnSettings,
};
use crate::webauthn::verifier::{
    decode_public_key, AssertionVerifier, AttestationVerifier, NoneAttestationVerifier,
    RingAssertionVerifier,
};

const CHALLENGE_BYTES: usize = 32;
const MAX_NAME_LEN: usize = 64;

/// WebAuthn relying-party engine.
///
/// Ceremony failures come back as `Ok(VerificationResult { verified: false, .. })`;
/// only infrastructure faults (storage, key backends) are returned as `Err`.
/// Every completed ceremony emits exactly one audit event.
pub struct CredentialAuthenticator {
    rp: RelyingPartyConfig,
    rp_id_hash: [u8; 32],
    settings: WebAuthnSettings,
    credentials: Arc<dyn CredentialRepository>,
    challenges: Arc<dyn ChallengeRepository>,
    audit: AuditTrail,
    counter_guard: CounterGuard,
    limiter: Option<RateLimiter>,
    attestation: Arc<dyn AttestationVerifier>,
    assertion: Arc<dyn AssertionVerifier>,
    rng: SystemRandom,
}

impl CredentialAuthenticator {
    pub fn new(
        rp: RelyingPartyConfig,
        settings: WebAuthnSettings,
        credentials: Arc<dyn CredentialRepository>,
        challenges: Arc<dyn ChallengeRepository>,
        audit: AuditTrail,
    ) -> Result<Self> {
        rp.validate()?;
        settings.validate()?;
        let counter_guard =
            CounterGuard::new(settings.zero_counter.permissive, settings.zero_counter_aaguids()?);
        let rp_id_hash: [u8; 32] = Sha256::digest(rp.id.as_bytes()).into();
        Ok(Self {
            rp,
            rp_id_hash,
            settings,
            credentials,
            challenges,
            audit,
            counter_guard,
            limiter: None,
            attestation: Arc::new(NoneAttestationVerifier),
            assertion: Arc::new(RingAssertionVerifier),
            rng: SystemRandom::new(),
        })
    }

    /// Rate-limit ceremony starts per user with the configured rule.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_attestation_verifier(mut self, verifier: Arc<dyn AttestationVerifier>) -> Self {
        self.attestation = verifier;
        self
    }

    pub fn with_assertion_verifier(mut self, verifier: Arc<dyn AssertionVerifier>) -> Self {
        self.assertion = verifier;
        self
    }

    pub fn relying_party(&self) -> &RelyingPartyConfig {
        &self.rp
    }

    async fn throttle(&self, user_id: &str) -> Result<()> {
        if let (Some(limiter), Some(rule)) = (&self.limiter, &self.settings.rate_limit_rule) {
            limiter.enforce(&format!("webauthn:{user_id}"), rule).await?;
        }
        Ok(())
    }

    fn new_challenge(&self, user_id: Option<&str>, purpose: ChallengePurpose) -> Result<Challenge> {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| SecurityError::KeyUnavailable("system randomness unavailable".into()))?;
        let now = Utc::now();
        Ok(Challenge {
            id: Uuid::new_v4(),
            value: b64url_encode(&bytes),
            user_id: user_id.map(String::from),
            purpose,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(self.settings.challenge_ttl_secs as i64),
        })
    }

    fn timeout_ms(&self) -> u64 {
        self.settings.challenge_ttl_secs * 1000
    }

    fn pub_key_cred_params(&self) -> Vec<PubKeyCredParam> {
        self.assertion
            .supported_algorithms()
            .into_iter()
            .map(|alg| PubKeyCredParam {
                kind: "public-key".to_string(),
                alg,
            })
            .collect()
    }

    pub async fn begin_registration(
        &self,
        user_id: &str,
        email: &str,
        display_name: &str,
        opts: RegistrationRequestOptions,
    ) -> Result<PublicKeyCredentialCreationOptions> {
        if user_id.trim().is_empty() || email.trim().is_empty() {
            return Err(SecurityError::Validation("user id and name are required".into()));
        }
        self.throttle(user_id).await?;

        let exclude_credentials: Vec<CredentialDescriptor> = self
            .credentials
            .list_for_user(user_id)
            .await?
            .iter()
            .filter(|c| c.active)
            .map(CredentialDescriptor::from)
            .collect();

        let challenge = self.new_challenge(Some(user_id), ChallengePurpose::Registration)?;
        let value = challenge.value.clone();
        self.challenges.put(challenge).await?;
        debug!(user_id, "registration challenge issued");

        let display_name = if display_name.trim().is_empty() {
            email
        } else {
            display_name
        };
        Ok(PublicKeyCredentialCreationOptions {
            challenge: value,
            rp: RelyingPartyEntity {
                id: self.rp.id.clone(),
                name: self.rp.name.clone(),
            },
            user: UserEntity {
                id: b64url_encode(user_id.as_bytes()),
                name: email.to_string(),
                display_name: display_name.to_string(),
            },
            pub_key_cred_params: self.pub_key_cred_params(),
            timeout: self.timeout_ms(),
            exclude_credentials,
            authenticator_selection: AuthenticatorSelection {
                authenticator_attachment: opts.authenticator_attachment,
                resident_key: opts.resident_key.unwrap_or_else(|| "preferred".to_string()),
                user_verification: self.settings.user_verification.clone(),
            },
            attestation: "none".to_string(),
        })
    }

    pub async fn complete_registration(
        &self,
        user_id: &str,
        name: &str,
        response: &RegistrationResponse,
    ) -> Result<VerificationResult> {
        let outcome = self.verify_registration(user_id, name, response).await;
        let actor = ActorProfile::user(user_id);
        let resource = format!("credential:{}", response.id);
        self.conclude("webauthn.register", &actor, resource, outcome)
    }

    async fn verify_registration(
        &self,
        user_id: &str,
        name: &str,
        response: &RegistrationResponse,
    ) -> Result<Credential> {
        let challenge = self
            .challenges
            .take_registration(user_id)
            .await?
            .ok_or(SecurityError::ChallengeExpired)?;
        if challenge.is_expired(Utc::now()) {
            return Err(SecurityError::ChallengeExpired);
        }

        let (client, _) = CollectedClientData::parse(&response.response.client_data_json)?;
        self.check_client_data(&client, &challenge, TYPE_CREATE)?;

        let auth_data = AuthenticatorData::from_b64url(&response.response.authenticator_data)?;
        self.check_authenticator_data(&auth_data)?;
        self.attestation.verify(response, &auth_data)?;

        if response.id.is_empty() || response.id != response.raw_id {
            return Err(SecurityError::Validation("credential id and raw id differ".into()));
        }
        if let Some(attested) = &auth_data.attested {
            if b64url_encode(&attested.credential_id) != response.id {
                return Err(SecurityError::Validation(
                    "credential id does not match authenticator data".into(),
                ));
            }
        }

        let algorithm = response.response.public_key_algorithm;
        let public_key = decode_public_key(&response.response.public_key)?;
        self.assertion.check_public_key(algorithm, &public_key)?;

        if self.credentials.get(&response.id).await?.is_some() {
            return Err(SecurityError::DuplicateCredential);
        }
        let held = self.credentials.list_for_user(user_id).await?.len();
        if held >= self.settings.max_credentials_per_user {
            return Err(SecurityError::CredentialLimitExceeded);
        }

        let name = name.trim();
        let credential = Credential {
            id: response.id.clone(),
            user_id: user_id.to_string(),
            name: if name.is_empty() {
                "Security key".to_string()
            } else {
                name.chars().take(MAX_NAME_LEN).collect()
            },
            public_key: b64url_encode(&public_key),
            algorithm,
            counter: 0,
            aaguid: auth_data.aaguid(),
            device_class: DeviceClass::from_attachment(response.authenticator_attachment.as_deref()),
            transports: response.response.transports.clone(),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.credentials.insert(credential.clone()).await?;
        Ok(credential)
    }

    pub async fn begin_authentication(
        &self,
        user_id: Option<&str>,
    ) -> Result<PublicKeyCredentialRequestOptions> {
        let allow_credentials: Vec<CredentialDescriptor> = match user_id {
            Some(user) => {
                self.throttle(user).await?;
                self.credentials
                    .list_for_user(user)
                    .await?
                    .iter()
                    .filter(|c| c.active)
                    .map(CredentialDescriptor::from)
                    .collect()
            }
            None => Vec::new(),
        };

        let challenge = self.new_challenge(user_id, ChallengePurpose::Authentication)?;
        let value = challenge.value.clone();
        self.challenges.put(challenge).await?;
        debug!(user_id = ?user_id, "authentication challenge issued");

        Ok(PublicKeyCredentialRequestOptions {
            challenge: value,
            rp_id: self.rp.id.clone(),
            timeout: self.timeout_ms(),
            allow_credentials,
            user_verification: self.settings.user_verification.clone(),
        })
    }

    pub async fn complete_authentication(
        &self,
        response: &AuthenticationResponse,
        user_id: Option<&str>,
    ) -> Result<VerificationResult> {
        let outcome = self.verify_authentication(response, user_id).await;
        let actor = match (&outcome, user_id) {
            (Ok(cred), _) => ActorProfile::user(cred.user_id.clone()),
            (Err(_), Some(user)) => ActorProfile::user(user),
            (Err(_), None) => ActorProfile::anonymous(),
        };
        let resource = format!("credential:{}", response.id);
        self.conclude("webauthn.authenticate", &actor, resource, outcome)
    }

    async fn verify_authentication(
        &self,
        response: &AuthenticationResponse,
        user_id: Option<&str>,
    ) -> Result<Credential> {
        let (client, client_raw) = CollectedClientData::parse(&response.response.client_data_json)?;

        // Consumed before any further check; never retried. A challenge issued
        // for registration is left for the registration it belongs to.
        let challenge = self
            .challenges
            .take_by_value(&client.challenge, ChallengePurpose::Authentication)
            .await?
            .ok_or(SecurityError::ChallengeExpired)?;
        if challenge.is_expired(Utc::now()) {
            return Err(SecurityError::ChallengeExpired);
        }
        if let (Some(bound), Some(user)) = (&challenge.user_id, user_id) {
            if bound != user {
                return Err(SecurityError::ChallengeMismatch);
            }
        }
        self.check_client_data(&client, &challenge, TYPE_GET)?;

        let credential = self
            .credentials
            .get(&response.id)
            .await?
            .ok_or(SecurityError::CredentialNotFound)?;
        let expected_owner = user_id.or(challenge.user_id.as_deref());
        if expected_owner.is_some_and(|owner| owner != credential.user_id) {
            return Err(SecurityError::CredentialNotFound);
        }
        if let Some(handle) = &response.response.user_handle {
            if b64url_decode(handle, "userHandle")? != credential.user_id.as_bytes() {
                return Err(SecurityError::Validation("user handle does not match".into()));
            }
        }
        if !credential.active {
            return Err(SecurityError::CredentialInactive);
        }

        let auth_data = AuthenticatorData::from_b64url(&response.response.authenticator_data)?;
        self.check_authenticator_data(&auth_data)?;

        let presented = auth_data.sign_count;
        let first_use = credential.last_used_at.is_none();
        self.counter_guard
            .check(credential.counter, presented, first_use, credential.aaguid)?;

        let public_key = decode_public_key(&credential.public_key)?;
        let signature = b64url_decode(&response.response.signature, "signature")?;
        self.assertion.verify(
            credential.algorithm,
            &public_key,
            &auth_data.raw,
            &client_raw,
            &signature,
        )?;

        let now = Utc::now();
        let swapped = self
            .credentials
            .update_counter(
                &credential.id,
                credential.counter,
                credential.last_used_at,
                presented,
                now,
            )
            .await?;
        if !swapped {
            warn!(credential_id = %credential.id, "concurrent assertion lost counter race");
            return Err(SecurityError::ReplayDetected);
        }

        Ok(Credential {
            counter: presented,
            last_used_at: Some(now),
            ..credential
        })
    }

    fn check_client_data(
        &self,
        client: &CollectedClientData,
        challenge: &Challenge,
        expected_type: &str,
    ) -> Result<()> {
        let matches: bool = client
            .challenge
            .as_bytes()
            .ct_eq(challenge.value.as_bytes())
            .into();
        if !matches {
            return Err(SecurityError::ChallengeMismatch);
        }
        if client.kind != expected_type {
            return Err(SecurityError::Validation(format!(
                "client data type must be {expected_type}"
            )));
        }
        if client.origin != self.rp.origin || client.cross_origin {
            return Err(SecurityError::OriginMismatch);
        }
        Ok(())
    }

    fn check_authenticator_data(&self, auth_data: &AuthenticatorData) -> Result<()> {
        let same_rp: bool = auth_data.rp_id_hash[..].ct_eq(&self.rp_id_hash[..]).into();
        if !same_rp {
            return Err(SecurityError::OriginMismatch);
        }
        if !auth_data.user_present() {
            return Err(SecurityError::Validation("user presence flag not set".into()));
        }
        if self.settings.requires_user_verification() && !auth_data.user_verified() {
            return Err(SecurityError::Validation("user verification required".into()));
        }
        Ok(())
    }

    /// Turn a ceremony outcome into one audit event plus the caller-facing result.
    fn conclude(
        &self,
        action: &str,
        actor: &ActorProfile,
        resource: String,
        outcome: Result<Credential>,
    ) -> Result<VerificationResult> {
        match outcome {
            Ok(credential) => {
                self.audit.record(
                    AuditEvent::new(actor, action, resource, AuditOutcome::Success)
                        .with_metadata("counter", credential.counter),
                );
                info!(action, user_id = %credential.user_id, credential_id = %credential.id, "ceremony verified");
                Ok(VerificationResult::success(&credential))
            }
            Err(err) if err.is_infrastructure() => {
                error!(severity = "critical", action, error = %err, "ceremony aborted by infrastructure fault");
                self.audit.record(
                    AuditEvent::new(actor, action, resource, AuditOutcome::Failure)
                        .with_metadata("error", err.code()),
                );
                Err(err)
            }
            Err(err) => {
                let mut event = AuditEvent::new(actor, action, resource, AuditOutcome::Failure)
                    .with_metadata("error", err.code());
                if err == SecurityError::ReplayDetected {
                    event = event.with_min_risk(RiskLevel::Critical);
                }
                self.audit.record(event);
                warn!(action, actor = %actor.id, error = %err, "ceremony rejected");
                Ok(VerificationResult::failure(err))
            }
        }
    }

    pub async fn list_credentials(&self, user_id: &str) -> Result<Vec<Credential>> {
        self.credentials.list_for_user(user_id).await
    }

    async fn owned(&self, user_id: &str, credential_id: &str) -> Result<Credential> {
        match self.credentials.get(credential_id).await? {
            Some(cred) if cred.user_id == user_id => Ok(cred),
            _ => Err(SecurityError::CredentialNotFound),
        }
    }

    fn audit_lifecycle(&self, user_id: &str, action: &str, credential_id: &str, result: &Result<()>) {
        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        let mut event = AuditEvent::new(
            &ActorProfile::user(user_id),
            action,
            format!("credential:{credential_id}"),
            outcome,
        );
        if let Err(err) = result {
            event = event.with_metadata("error", err.code());
        }
        self.audit.record(event);
    }

    async fn set_active(&self, user_id: &str, credential_id: &str, active: bool) -> Result<()> {
        let mut cred = self.owned(user_id, credential_id).await?;
        cred.active = active;
        self.credentials.update(cred).await
    }

    pub async fn disable_credential(&self, user_id: &str, credential_id: &str) -> Result<()> {
        let result = self.set_active(user_id, credential_id, false).await;
        self.audit_lifecycle(user_id, "webauthn.credential.disable", credential_id, &result);
        result
    }

    pub async fn enable_credential(&self, user_id: &str, credential_id: &str) -> Result<()> {
        let result = self.set_active(user_id, credential_id, true).await;
        self.audit_lifecycle(user_id, "webauthn.credential.enable", credential_id, &result);
        result
    }

    pub async fn rename_credential(&self, user_id: &str, credential_id: &str, name: &str) -> Result<()> {
        let result = async {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
                return Err(SecurityError::Validation("credential name length".into()));
            }
            let mut cred = self.owned(user_id, credential_id).await?;
            cred.name = name.to_string();
            self.credentials.update(cred).await
        }
        .await;
        self.audit_lifecycle(user_id, "webauthn.credential.rename", credential_id, &result);
        result
    }

    pub async fn delete_credential(&self, user_id: &str, credential_id: &str) -> Result<()> {
        let result = async {
            self.owned(user_id, credential_id).await?;
            if self.credentials.delete(credential_id).await? {
                Ok(())
            } else {
                Err(SecurityError::CredentialNotFound)
            }
        }
        .await;
        self.audit_lifecycle(user_id, "webauthn.credential.delete", credential_id, &result);
        result
    }

    pub async fn purge_expired_challenges(&self) -> Result<usize> {
        let purged = self.challenges.purge_expired(Utc::now()).await?;
        if purged > 0 {
            debug!(purged, "expired challenges purged");
        }
        Ok(purged)
    }
}
