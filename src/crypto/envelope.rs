use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::crypto::aead::{self, ALGORITHM};
use crate::crypto::keys::{canonical_context, context_digest, DataKey, EncryptionContext};
use crate::crypto::provider::KeyProvider;
use crate::error::{Result, SecurityError};

/// Serialized form of an encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    /// base64 of `nonce || ciphertext || tag`.
    pub ciphertext: String,
    pub wrapped_key: String,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<EncryptionContext>,
}

impl EncryptionEnvelope {
    fn scope(&self) -> EncryptionContext {
        self.context.clone().unwrap_or_default()
    }
}

struct CachedKey {
    key: DataKey,
    wrapped: String,
    created: Instant,
}

#[derive(Debug, Clone, Copy)]
struct CachePolicy {
    ttl: Duration,
    max_entries: usize,
}

/// Envelope encryption: a data key per context encrypts the payload, the key
/// provider wraps the data key under the master key.
pub struct EnvelopeEncryptionService {
    provider: Arc<dyn KeyProvider>,
    cache_policy: Option<CachePolicy>,
    cache: Mutex<HashMap<[u8; 32], CachedKey>>,
}

impl std::fmt::Debug for EnvelopeEncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEncryptionService")
            .field("provider", &self.provider.name())
            .field("cache_policy", &self.cache_policy)
            .finish()
    }
}

impl EnvelopeEncryptionService {
    /// Service without data-key caching: every call wraps a fresh key.
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self {
            provider,
            cache_policy: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the data key (and its wrapped form) for a context for up to `ttl`.
    pub fn with_data_key_cache(mut self, ttl: Duration, max_entries: usize) -> Self {
        if !ttl.is_zero() && max_entries > 0 {
            self.cache_policy = Some(CachePolicy { ttl, max_entries });
        }
        self
    }

    pub fn provider(&self) -> &Arc<dyn KeyProvider> {
        &self.provider
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<[u8; 32], CachedKey>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }

    async fn data_key_for(&self, context: Option<&EncryptionContext>) -> Result<(DataKey, String)> {
        let digest = context_digest(context);
        if let Some(policy) = self.cache_policy {
            let cache = self.lock_cache();
            if let Some(hit) = cache.get(&digest) {
                if hit.created.elapsed() < policy.ttl {
                    return Ok((hit.key.clone(), hit.wrapped.clone()));
                }
            }
        }

        let key = DataKey::generate()?;
        let scope = context.cloned().unwrap_or_default();
        let wrapped = self.provider.wrap(&key, &scope).await?;

        if let Some(policy) = self.cache_policy {
            let mut cache = self.lock_cache();
            if cache.len() >= policy.max_entries {
                cache.retain(|_, entry| entry.created.elapsed() < policy.ttl);
            }
            if cache.len() < policy.max_entries {
                cache.insert(
                    digest,
                    CachedKey {
                        key: key.clone(),
                        wrapped: wrapped.clone(),
                        created: Instant::now(),
                    },
                );
            }
        }
        Ok((key, wrapped))
    }

    fn aad(context: Option<&EncryptionContext>) -> Vec<u8> {
        let mut aad = canonical_context(context);
        aad.push(0);
        aad.extend_from_slice(ALGORITHM.as_bytes());
        aad
    }

    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        context: Option<EncryptionContext>,
    ) -> Result<EncryptionEnvelope> {
        let (key, wrapped_key) = self.data_key_for(context.as_ref()).await?;
        let sealed = aead::seal(key.as_bytes(), &Self::aad(context.as_ref()), plaintext)?;
        Ok(EncryptionEnvelope {
            ciphertext: general_purpose::STANDARD.encode(sealed),
            wrapped_key,
            algorithm: ALGORITHM.to_string(),
            context,
        })
    }

    /// Unwrap the data key and authenticate-decrypt. Fails closed on any mismatch.
    pub async fn decrypt(&self, envelope: &EncryptionEnvelope) -> Result<Vec<u8>> {
        if envelope.algorithm != ALGORITHM {
            warn!(algorithm = %envelope.algorithm, "refusing envelope with unsupported algorithm");
            return Err(SecurityError::DecryptionFailed);
        }
        let sealed = general_purpose::STANDARD
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|_| SecurityError::DecryptionFailed)?;
        let key = self
            .provider
            .unwrap(&envelope.wrapped_key, &envelope.scope())
            .await?;
        aead::open(key.as_bytes(), &Self::aad(envelope.context.as_ref()), &sealed)
    }

    pub async fn decrypt_string(&self, envelope: &EncryptionEnvelope) -> Result<String> {
        String::from_utf8(self.decrypt(envelope).await?).map_err(|_| SecurityError::DecryptionFailed)
    }

    /// Decrypt only if the envelope is bound to exactly `expected`.
    pub async fn decrypt_in_context(
        &self,
        envelope: &EncryptionEnvelope,
        expected: &EncryptionContext,
    ) -> Result<Vec<u8>> {
        if envelope.scope() != *expected {
            debug!("envelope context does not match the expected scope");
            return Err(SecurityError::DecryptionFailed);
        }
        self.decrypt(envelope).await
    }

    /// Re-wrap the data key under the active master key; the payload is untouched.
    pub async fn rewrap(&self, envelope: &EncryptionEnvelope) -> Result<EncryptionEnvelope> {
        if envelope.algorithm != ALGORITHM {
            return Err(SecurityError::DecryptionFailed);
        }
        let scope = envelope.scope();
        let key = self.provider.unwrap(&envelope.wrapped_key, &scope).await?;
        let wrapped_key = self.provider.wrap(&key, &scope).await?;
        Ok(EncryptionEnvelope {
            wrapped_key,
            ..envelope.clone()
        })
    }

    /// Rotate the master key. Cached data keys are dropped so new envelopes are
    /// wrapped under the new version; existing envelopes stay decryptable.
    pub async fn rotate_master_key(&self) -> Result<u32> {
        let version = self.provider.rotate().await?;
        self.lock_cache().clear();
        info!(provider = %self.provider.name(), version, "envelope master key rotated");
        Ok(version)
    }

    /// Drop expired cached data keys. Returns the number evicted.
    pub fn evict_expired_keys(&self) -> usize {
        let Some(policy) = self.cache_policy else {
            return 0;
        };
        let mut cache = self.lock_cache();
        let before = cache.len();
        cache.retain(|_, entry| entry.created.elapsed() < policy.ttl);
        before - cache.len()
    }

    pub fn cached_keys(&self) -> usize {
        self.lock_cache().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::LocalKeyProvider;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(pairs: &[(&str, &str)]) -> EncryptionContext {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn service() -> EnvelopeEncryptionService {
        EnvelopeEncryptionService::new(Arc::new(LocalKeyProvider::in_memory().unwrap()))
    }

    struct CountingProvider {
        inner: LocalKeyProvider,
        wraps: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: LocalKeyProvider::in_memory().unwrap(),
                wraps: AtomicUsize::new(0),
            }
        }

        fn inner(&self) -> &LocalKeyProvider {
            &self.inner
        }
    }

    #[async_trait]
    impl KeyProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        async fn wrap(&self, key: &DataKey, context: &EncryptionContext) -> Result<String> {
            self.wraps.fetch_add(1, Ordering::SeqCst);
            self.inner().wrap(key, context).await
        }
        async fn unwrap(&self, wrapped: &str, context: &EncryptionContext) -> Result<DataKey> {
            self.inner().unwrap(wrapped, context).await
        }
        async fn rotate(&self) -> Result<u32> {
            self.inner().rotate().await
        }
        async fn active_version(&self) -> Result<u32> {
            self.inner().active_version().await
        }
    }

    #[tokio::test]
    async fn roundtrips_assorted_payloads() {
        let svc = service();
        let big = vec![0x5Au8; 100_000];
        let payloads: [&[u8]; 4] = [b"", "héllo wörld ✓ 日本".as_bytes(), b"hello", &big];
        let contexts = [None, Some(ctx(&[("tenant", "t1"), ("purpose", "backup")]))];
        for payload in payloads {
            for context in &contexts {
                let env = svc.encrypt(payload, context.clone()).await.unwrap();
                assert_eq!(svc.decrypt(&env).await.unwrap(), payload);
            }
        }
    }

    #[tokio::test]
    async fn identical_inputs_give_distinct_ciphertexts() {
        for svc in [
            service(),
            service().with_data_key_cache(Duration::from_secs(300), 16),
        ] {
            let a = svc.encrypt(b"hello", None).await.unwrap();
            let b = svc.encrypt(b"hello", None).await.unwrap();
            assert_ne!(a.ciphertext, b.ciphertext);
            assert_eq!(svc.decrypt_string(&a).await.unwrap(), "hello");
            assert_eq!(svc.decrypt_string(&b).await.unwrap(), "hello");
        }
    }

    #[tokio::test]
    async fn cache_reuses_wrapped_key_per_context() {
        let provider = Arc::new(CountingProvider::new());
        let svc = EnvelopeEncryptionService::new(provider.clone())
            .with_data_key_cache(Duration::from_secs(300), 16);
        let scope = ctx(&[("tenant", "t1")]);

        let a = svc.encrypt(b"one", Some(scope.clone())).await.unwrap();
        let b = svc.encrypt(b"two", Some(scope)).await.unwrap();
        svc.encrypt(b"three", None).await.unwrap();

        assert_eq!(a.wrapped_key, b.wrapped_key);
        assert_eq!(provider.wraps.load(Ordering::SeqCst), 2);
        assert_eq!(svc.cached_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_keys_expire() {
        let svc = service().with_data_key_cache(Duration::from_secs(60), 16);
        let first = svc.encrypt(b"x", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(svc.evict_expired_keys(), 1);
        let second = svc.encrypt(b"x", None).await.unwrap();
        assert_ne!(first.wrapped_key, second.wrapped_key);
    }

    #[tokio::test]
    async fn altered_context_fails() {
        let svc = service();
        let mut env = svc
            .encrypt(b"secret", Some(ctx(&[("tenant", "t1")])))
            .await
            .unwrap();
        env.context = Some(ctx(&[("tenant", "t2")]));
        assert_eq!(svc.decrypt(&env).await, Err(SecurityError::DecryptionFailed));

        env.context = None;
        assert_eq!(svc.decrypt(&env).await, Err(SecurityError::DecryptionFailed));
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_without_leaking() {
        let svc = service();
        let mut env = svc.encrypt(b"very secret payload", None).await.unwrap();
        let mut raw = general_purpose::STANDARD.decode(&env.ciphertext).unwrap();
        raw[14] ^= 0xFF;
        env.ciphertext = general_purpose::STANDARD.encode(raw);

        let err = svc.decrypt(&env).await.unwrap_err();
        assert_eq!(err, SecurityError::DecryptionFailed);
        assert!(!err.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn unknown_algorithm_fails() {
        let svc = service();
        let mut env = svc.encrypt(b"data", None).await.unwrap();
        env.algorithm = "ROT13".into();
        assert_eq!(svc.decrypt(&env).await, Err(SecurityError::DecryptionFailed));
        assert!(svc.rewrap(&env).await.is_err());
    }

    #[tokio::test]
    async fn decrypt_in_context_checks_scope() {
        let svc = service();
        let scope = ctx(&[("user", "u1")]);
        let env = svc.encrypt(b"data", Some(scope.clone())).await.unwrap();
        assert_eq!(svc.decrypt_in_context(&env, &scope).await.unwrap(), b"data");
        assert_eq!(
            svc.decrypt_in_context(&env, &ctx(&[("user", "u2")])).await,
            Err(SecurityError::DecryptionFailed)
        );
    }

    #[tokio::test]
    async fn rotation_is_lazy_and_rewrap_migrates() {
        let svc = service().with_data_key_cache(Duration::from_secs(300), 16);
        let old = svc.encrypt(b"before rotation", None).await.unwrap();
        assert!(old.wrapped_key.starts_with("local:v1:"));

        assert_eq!(svc.rotate_master_key().await.unwrap(), 2);
        assert_eq!(svc.cached_keys(), 0);
        assert_eq!(svc.decrypt(&old).await.unwrap(), b"before rotation");

        let new = svc.encrypt(b"after rotation", None).await.unwrap();
        assert!(new.wrapped_key.starts_with("local:v2:"));

        let migrated = svc.rewrap(&old).await.unwrap();
        assert!(migrated.wrapped_key.starts_with("local:v2:"));
        assert_eq!(migrated.ciphertext, old.ciphertext);
        assert_eq!(svc.decrypt(&migrated).await.unwrap(), b"before rotation");
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let env = EncryptionEnvelope {
            ciphertext: "AA==".into(),
            wrapped_key: "local:v1:BB".into(),
            algorithm: ALGORITHM.into(),
            context: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["wrappedKey"], "local:v1:BB");
        assert!(json.get("context").is_none());
    }
}
