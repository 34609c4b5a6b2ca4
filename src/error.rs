use thiserror::Error;

/// Error taxonomy shared by every trust component.
///
/// Display strings are safe to hand back to callers: they never carry plaintext,
/// key material or internal identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("challenge expired or not found")]
    ChallengeExpired,

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("origin mismatch")]
    OriginMismatch,

    #[error("replay detected")]
    ReplayDetected,

    #[error("credential inactive")]
    CredentialInactive,

    #[error("credential limit exceeded")]
    CredentialLimitExceeded,

    #[error("duplicate credential")]
    DuplicateCredential,

    #[error("credential not found")]
    CredentialNotFound,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("rate limit rule not found: {0}")]
    RuleNotFound(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl SecurityError {
    /// Stable machine-readable code, used in audit metadata.
    pub fn code(&self) -> &'static str {
        match self {
            SecurityError::Validation(_) => "validation_error",
            SecurityError::ChallengeExpired => "challenge_expired",
            SecurityError::ChallengeMismatch => "challenge_mismatch",
            SecurityError::OriginMismatch => "origin_mismatch",
            SecurityError::ReplayDetected => "replay_detected",
            SecurityError::CredentialInactive => "credential_inactive",
            SecurityError::CredentialLimitExceeded => "credential_limit_exceeded",
            SecurityError::DuplicateCredential => "duplicate_credential",
            SecurityError::CredentialNotFound => "credential_not_found",
            SecurityError::SignatureInvalid => "signature_invalid",
            SecurityError::RuleNotFound(_) => "rule_not_found",
            SecurityError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            SecurityError::KeyUnavailable(_) => "key_unavailable",
            SecurityError::DecryptionFailed => "decryption_failed",
            SecurityError::PolicyDenied(_) => "policy_denied",
            SecurityError::StorageUnavailable(_) => "storage_unavailable",
        }
    }

    /// Only transient storage faults may be retried, and only for reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SecurityError::StorageUnavailable(_))
    }

    /// Infrastructure faults abort the request instead of producing a verdict.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SecurityError::StorageUnavailable(_) | SecurityError::KeyUnavailable(_)
        )
    }
}

pub type Result<T, E = SecurityError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_faults_are_retryable() {
        assert!(SecurityError::StorageUnavailable("db down".into()).is_retryable());
        assert!(!SecurityError::ReplayDetected.is_retryable());
        assert!(!SecurityError::KeyUnavailable("kms".into()).is_retryable());
    }

    #[test]
    fn codes_are_snake_case() {
        let err = SecurityError::RateLimitExceeded { retry_after_secs: 3 };
        assert_eq!(err.code(), "rate_limit_exceeded");
        assert_eq!(err.to_string(), "rate limit exceeded, retry after 3s");
        assert_eq!(SecurityError::DecryptionFailed.to_string(), "decryption failed");
    }
}
