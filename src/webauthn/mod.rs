//! Passwordless credential authentication (WebAuthn relying party).
pub mod authenticator;
pub mod client_data;
pub mod repository;
pub mod sealed;
pub mod types;
pub mod verifier;

pub use authenticator::CredentialAuthenticator;
pub use repository::{
    CachedCredentialRepository, ChallengeRepository, CredentialRepository,
    InMemoryChallengeRepository, InMemoryCredentialRepository,
};
pub use sealed::{open_credential, seal_credential};
pub use types::{
    AuthenticationResponse, Challenge, ChallengePurpose, Credential, RegistrationRequestOptions,
    RegistrationResponse, RelyingPartyConfig, VerificationResult, WebAuthnSettings,
};
pub use verifier::{
    AssertionVerifier, AttestationVerifier, NoneAttestationVerifier, RingAssertionVerifier,
    COSE_EDDSA, COSE_ES256,
};
