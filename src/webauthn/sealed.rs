use crate::crypto::{EncryptionContext, EncryptionEnvelope, EnvelopeEncryptionService};
use crate::error::{Result, SecurityError};
use crate::webauthn::types::Credential;

const PURPOSE: &str = "webauthn-credential";

fn credential_scope(credential_id: &str) -> EncryptionContext {
    EncryptionContext::from([
        ("purpose".to_string(), PURPOSE.to_string()),
        ("credential_id".to_string(), credential_id.to_string()),
    ])
}

/// Encrypt a credential record for a durable backend. The envelope only opens
/// for the same credential id.
pub async fn seal_credential(
    service: &EnvelopeEncryptionService,
    credential: &Credential,
) -> Result<EncryptionEnvelope> {
    let plaintext = serde_json::to_vec(credential)
        .map_err(|e| SecurityError::Validation(format!("credential not serializable: {e}")))?;
    service
        .encrypt(&plaintext, Some(credential_scope(&credential.id)))
        .await
}

pub async fn open_credential(
    service: &EnvelopeEncryptionService,
    credential_id: &str,
    envelope: &EncryptionEnvelope,
) -> Result<Credential> {
    let plaintext = service
        .decrypt_in_context(envelope, &credential_scope(credential_id))
        .await?;
    let credential: Credential =
        serde_json::from_slice(&plaintext).map_err(|_| SecurityError::DecryptionFailed)?;
    if credential.id != credential_id {
        return Err(SecurityError::DecryptionFailed);
    }
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalKeyProvider;
    use crate::webauthn::types::DeviceClass;
    use chrono::Utc;
    use std::sync::Arc;

    fn credential(id: &str) -> Credential {
        Credential {
            id: id.into(),
            user_id: "u1".into(),
            name: "phone".into(),
            public_key: "MFkwEwYHKoZIzj0CAQ".into(),
            algorithm: -7,
            counter: 12,
            aaguid: None,
            device_class: DeviceClass::Platform,
            transports: vec!["internal".into()],
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn sealed_record_opens_for_its_own_id_only() {
        let service = EnvelopeEncryptionService::new(Arc::new(LocalKeyProvider::in_memory().unwrap()));
        let cred = credential("cred-A");
        let envelope = seal_credential(&service, &cred).await.unwrap();
        assert!(!envelope.ciphertext.contains("phone"));

        assert_eq!(open_credential(&service, "cred-A", &envelope).await.unwrap(), cred);
        assert_eq!(
            open_credential(&service, "cred-B", &envelope).await,
            Err(SecurityError::DecryptionFailed)
        );
    }
}
