use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, SecurityError};
use crate::utils::retry::{retry_read, RetryPolicy};
use crate::webauthn::types::{Challenge, ChallengePurpose, Credential};

/// Durable credential storage.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Credential>>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Credential>>;

    /// Fails with `DuplicateCredential` if the id is taken.
    async fn insert(&self, credential: Credential) -> Result<()>;

    /// Compare-and-set the signature counter. Returns `false` when the stored
    /// counter no longer equals `expected` or the stored last use no longer
    /// equals `expected_last_used`.
    async fn update_counter(
        &self,
        id: &str,
        expected: u32,
        expected_last_used: Option<DateTime<Utc>>,
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Replace mutable metadata (name, active flag). Fails with `CredentialNotFound`.
    async fn update(&self, credential: Credential) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Challenge storage. `take_*` removes and returns in one step.
#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    /// Store a challenge. A registration challenge replaces any earlier one for
    /// the same user.
    async fn put(&self, challenge: Challenge) -> Result<()>;

    async fn take_registration(&self, user_id: &str) -> Result<Option<Challenge>>;

    /// Take the challenge stored under `value` if it was issued for `purpose`.
    /// A challenge issued for another purpose stays stored and the call fails
    /// with `ChallengeMismatch`.
    async fn take_by_value(&self, value: &str, purpose: ChallengePurpose) -> Result<Option<Challenge>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialRepository {
    credentials: RwLock<HashMap<String, Arc<Mutex<Credential>>>>,
}

impl InMemoryCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<Credential>>> {
        self.credentials.read().await.get(id).cloned()
    }
}

#[async_trait]
impl CredentialRepository for InMemoryCredentialRepository {
    async fn get(&self, id: &str) -> Result<Option<Credential>> {
        match self.entry(id).await {
            Some(entry) => Ok(Some(entry.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Credential>> {
        let entries: Vec<_> = self.credentials.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for entry in entries {
            let cred = entry.lock().await;
            if cred.user_id == user_id {
                out.push(cred.clone());
            }
        }
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    async fn insert(&self, credential: Credential) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        if credentials.contains_key(&credential.id) {
            return Err(SecurityError::DuplicateCredential);
        }
        credentials.insert(credential.id.clone(), Arc::new(Mutex::new(credential)));
        Ok(())
    }

    async fn update_counter(
        &self,
        id: &str,
        expected: u32,
        expected_last_used: Option<DateTime<Utc>>,
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<bool> {
        let entry = self.entry(id).await.ok_or(SecurityError::CredentialNotFound)?;
        let mut cred = entry.lock().await;
        if cred.counter != expected || cred.last_used_at != expected_last_used {
            return Ok(false);
        }
        cred.counter = counter;
        cred.last_used_at = Some(used_at);
        Ok(true)
    }

    async fn update(&self, credential: Credential) -> Result<()> {
        let entry = self
            .entry(&credential.id)
            .await
            .ok_or(SecurityError::CredentialNotFound)?;
        let mut stored = entry.lock().await;
        stored.name = credential.name;
        stored.active = credential.active;
        stored.transports = credential.transports;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.credentials.write().await.remove(id).is_some())
    }
}

type ChallengeSlot = Arc<Mutex<Option<Challenge>>>;

/// Challenges keyed by value, each behind its own lock, plus an index of the
/// pending registration challenge per user.
#[derive(Debug, Default)]
pub struct InMemoryChallengeRepository {
    challenges: RwLock<HashMap<String, ChallengeSlot>>,
    registrations: RwLock<HashMap<String, String>>,
}

impl InMemoryChallengeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.challenges.read().await.len()
    }

    async fn slot(&self, value: &str) -> Option<ChallengeSlot> {
        self.challenges.read().await.get(value).cloned()
    }

    async fn forget(&self, value: &str, slot: &ChallengeSlot) {
        let mut challenges = self.challenges.write().await;
        if challenges.get(value).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            challenges.remove(value);
        }
    }

    /// Empty the slot under `value`, provided the challenge matches `purpose`
    /// when one is given.
    async fn claim(&self, value: &str, purpose: Option<ChallengePurpose>) -> Result<Option<Challenge>> {
        let Some(slot) = self.slot(value).await else {
            return Ok(None);
        };
        let taken = {
            let mut held = slot.lock().await;
            let mismatched = match held.as_ref() {
                None => return Ok(None),
                Some(ch) => purpose.is_some_and(|p| p != ch.purpose),
            };
            if mismatched {
                return Err(SecurityError::ChallengeMismatch);
            }
            held.take()
        };
        self.forget(value, &slot).await;
        Ok(taken)
    }
}

#[async_trait]
impl ChallengeRepository for InMemoryChallengeRepository {
    async fn put(&self, challenge: Challenge) -> Result<()> {
        let value = challenge.value.clone();
        let owner = match (&challenge.purpose, &challenge.user_id) {
            (ChallengePurpose::Registration, Some(user)) => Some(user.clone()),
            _ => None,
        };
        self.challenges
            .write()
            .await
            .insert(value.clone(), Arc::new(Mutex::new(Some(challenge))));
        if let Some(user) = owner {
            let previous = self.registrations.write().await.insert(user, value.clone());
            if let Some(previous) = previous.filter(|p| *p != value) {
                self.claim(&previous, None).await?;
            }
        }
        Ok(())
    }

    async fn take_registration(&self, user_id: &str) -> Result<Option<Challenge>> {
        let Some(value) = self.registrations.write().await.remove(user_id) else {
            return Ok(None);
        };
        self.claim(&value, Some(ChallengePurpose::Registration)).await
    }

    async fn take_by_value(&self, value: &str, purpose: ChallengePurpose) -> Result<Option<Challenge>> {
        let challenge = self.claim(value, Some(purpose)).await?;
        if let Some(ch) = &challenge {
            if let (ChallengePurpose::Registration, Some(user)) = (&ch.purpose, &ch.user_id) {
                let mut registrations = self.registrations.write().await;
                if registrations.get(user).is_some_and(|v| v == value) {
                    registrations.remove(user);
                }
            }
        }
        Ok(challenge)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let slots: Vec<(String, ChallengeSlot)> = self
            .challenges
            .read()
            .await
            .iter()
            .map(|(value, slot)| (value.clone(), slot.clone()))
            .collect();
        let mut purged = Vec::new();
        for (value, slot) in slots {
            let expired = {
                let mut held = slot.lock().await;
                let expired = held.as_ref().is_some_and(|ch| ch.is_expired(now));
                if expired {
                    held.take();
                }
                expired
            };
            if expired {
                self.forget(&value, &slot).await;
                purged.push(value);
            }
        }
        if !purged.is_empty() {
            self.registrations
                .write()
                .await
                .retain(|_, value| !purged.contains(value));
        }
        Ok(purged.len())
    }
}

/// Read-through cache over a durable credential repository.
///
/// Reads are retried with backoff on transient storage faults; writes go to the
/// backend exactly once and invalidate the cached entry.
pub struct CachedCredentialRepository {
    inner: Arc<dyn CredentialRepository>,
    ttl: Duration,
    retry: RetryPolicy,
    cache: RwLock<HashMap<String, (Credential, Instant)>>,
}

impl CachedCredentialRepository {
    pub fn new(inner: Arc<dyn CredentialRepository>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            retry: RetryPolicy::default(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn invalidate(&self, id: &str) {
        self.cache.write().await.remove(id);
    }

    /// Drop expired cache entries. Returns the number evicted.
    pub async fn evict_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, (_, cached_at)| cached_at.elapsed() < self.ttl);
        before - cache.len()
    }
}

#[async_trait]
impl CredentialRepository for CachedCredentialRepository {
    async fn get(&self, id: &str) -> Result<Option<Credential>> {
        if let Some((cred, cached_at)) = self.cache.read().await.get(id) {
            if cached_at.elapsed() < self.ttl {
                return Ok(Some(cred.clone()));
            }
        }
        let fetched = retry_read(&self.retry, "credential.get", || self.inner.get(id)).await?;
        if let Some(cred) = &fetched {
            self.cache
                .write()
                .await
                .insert(id.to_string(), (cred.clone(), Instant::now()));
        }
        Ok(fetched)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Credential>> {
        retry_read(&self.retry, "credential.list_for_user", || {
            self.inner.list_for_user(user_id)
        })
        .await
    }

    async fn insert(&self, credential: Credential) -> Result<()> {
        self.inner.insert(credential).await
    }

    async fn update_counter(
        &self,
        id: &str,
        expected: u32,
        expected_last_used: Option<DateTime<Utc>>,
        counter: u32,
        used_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = self
            .inner
            .update_counter(id, expected, expected_last_used, counter, used_at)
            .await;
        self.invalidate(id).await;
        result
    }

    async fn update(&self, credential: Credential) -> Result<()> {
        let id = credential.id.clone();
        let result = self.inner.update(credential).await;
        self.invalidate(&id).await;
        result
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = self.inner.delete(id).await;
        self.invalidate(id).await;
        debug!(credential_id = %id, "credential deleted");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::types::DeviceClass;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn credential(id: &str, user: &str) -> Credential {
        Credential {
            id: id.into(),
            user_id: user.into(),
            name: "key".into(),
            public_key: "MFk".into(),
            algorithm: -7,
            counter: 0,
            aaguid: None,
            device_class: DeviceClass::Unknown,
            transports: vec![],
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    fn challenge(value: &str, user: Option<&str>, purpose: ChallengePurpose, ttl_secs: i64) -> Challenge {
        Challenge {
            id: Uuid::new_v4(),
            value: value.into(),
            user_id: user.map(String::from),
            purpose,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let repo = InMemoryCredentialRepository::new();
        repo.insert(credential("c1", "u1")).await.unwrap();
        assert_eq!(
            repo.insert(credential("c1", "u2")).await,
            Err(SecurityError::DuplicateCredential)
        );
        assert_eq!(repo.list_for_user("u1").await.unwrap().len(), 1);
        assert!(repo.list_for_user("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counter_update_is_compare_and_set() {
        let repo = InMemoryCredentialRepository::new();
        repo.insert(credential("c1", "u1")).await.unwrap();
        assert!(repo.update_counter("c1", 0, None, 5, Utc::now()).await.unwrap());
        assert!(!repo.update_counter("c1", 0, None, 6, Utc::now()).await.unwrap());
        let stored = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(stored.counter, 5);
        assert!(stored.last_used_at.is_some());
        assert_eq!(
            repo.update_counter("missing", 0, None, 1, Utc::now()).await,
            Err(SecurityError::CredentialNotFound)
        );
    }

    #[tokio::test]
    async fn zero_counter_update_also_compares_last_use() {
        let repo = InMemoryCredentialRepository::new();
        repo.insert(credential("c1", "u1")).await.unwrap();
        let first = Utc::now();
        assert!(repo.update_counter("c1", 0, None, 0, first).await.unwrap());

        // counter unchanged, but the first use is already taken
        assert!(!repo.update_counter("c1", 0, None, 0, Utc::now()).await.unwrap());
        assert!(repo.update_counter("c1", 0, Some(first), 0, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_counter_updates_admit_one_winner() {
        let repo = Arc::new(InMemoryCredentialRepository::new());
        repo.insert(credential("c1", "u1")).await.unwrap();
        let mut handles = Vec::new();
        for n in 1..=16u32 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.update_counter("c1", 0, None, n, Utc::now()).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn registration_challenge_is_one_per_user() {
        let repo = InMemoryChallengeRepository::new();
        repo.put(challenge("first", Some("u1"), ChallengePurpose::Registration, 300)).await.unwrap();
        repo.put(challenge("second", Some("u1"), ChallengePurpose::Registration, 300)).await.unwrap();
        assert_eq!(repo.len().await, 1);

        let taken = repo.take_registration("u1").await.unwrap().unwrap();
        assert_eq!(taken.value, "second");
        assert!(repo.take_registration("u1").await.unwrap().is_none());
        assert!(repo
            .take_by_value("first", ChallengePurpose::Registration)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn take_by_value_consumes_once() {
        let repo = InMemoryChallengeRepository::new();
        repo.put(challenge("auth", None, ChallengePurpose::Authentication, 300)).await.unwrap();
        let taken = repo.take_by_value("auth", ChallengePurpose::Authentication).await;
        assert!(taken.unwrap().is_some());
        let again = repo.take_by_value("auth", ChallengePurpose::Authentication).await;
        assert!(again.unwrap().is_none());
        assert_eq!(repo.len().await, 0);
    }

    #[tokio::test]
    async fn take_by_value_leaves_other_purposes_in_place() {
        let repo = InMemoryChallengeRepository::new();
        repo.put(challenge("reg", Some("u1"), ChallengePurpose::Registration, 300)).await.unwrap();
        assert_eq!(
            repo.take_by_value("reg", ChallengePurpose::Authentication).await,
            Err(SecurityError::ChallengeMismatch)
        );
        assert_eq!(repo.len().await, 1);
        assert_eq!(repo.take_registration("u1").await.unwrap().unwrap().value, "reg");
    }

    #[tokio::test]
    async fn taking_registration_by_value_clears_user_index() {
        let repo = InMemoryChallengeRepository::new();
        repo.put(challenge("reg", Some("u1"), ChallengePurpose::Registration, 300)).await.unwrap();
        let taken = repo.take_by_value("reg", ChallengePurpose::Registration).await;
        assert!(taken.unwrap().is_some());
        assert!(repo.take_registration("u1").await.unwrap().is_none());
        assert_eq!(repo.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_takes_hand_out_a_challenge_once() {
        let repo = Arc::new(InMemoryChallengeRepository::new());
        for n in 0..8 {
            repo.put(challenge(&format!("auth-{n}"), None, ChallengePurpose::Authentication, 300))
                .await
                .unwrap();
        }
        let mut handles = Vec::new();
        for n in 0..32 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.take_by_value(&format!("auth-{}", n % 8), ChallengePurpose::Authentication)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut taken = 0;
        for h in handles {
            if h.await.unwrap() {
                taken += 1;
            }
        }
        assert_eq!(taken, 8);
        assert_eq!(repo.len().await, 0);
    }

    #[tokio::test]
    async fn purge_removes_expired_only() {
        let repo = InMemoryChallengeRepository::new();
        repo.put(challenge("old", Some("u1"), ChallengePurpose::Registration, -1)).await.unwrap();
        repo.put(challenge("fresh", None, ChallengePurpose::Authentication, 300)).await.unwrap();
        assert_eq!(repo.purge_expired(Utc::now()).await.unwrap(), 1);
        assert!(repo.take_registration("u1").await.unwrap().is_none());
        assert_eq!(repo.len().await, 1);
    }

    /// Backend that fails the first `failures` reads.
    struct FlakyBackend {
        inner: InMemoryCredentialRepository,
        failures: AtomicU32,
        reads: AtomicU32,
    }

    #[async_trait]
    impl CredentialRepository for FlakyBackend {
        async fn get(&self, id: &str) -> Result<Option<Credential>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SecurityError::StorageUnavailable("db timeout".into()));
            }
            self.inner.get(id).await
        }
        async fn list_for_user(&self, user_id: &str) -> Result<Vec<Credential>> {
            self.inner.list_for_user(user_id).await
        }
        async fn insert(&self, credential: Credential) -> Result<()> {
            self.inner.insert(credential).await
        }
        async fn update_counter(
            &self,
            id: &str,
            expected: u32,
            expected_last_used: Option<DateTime<Utc>>,
            counter: u32,
            used_at: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner
                .update_counter(id, expected, expected_last_used, counter, used_at)
                .await
        }
        async fn update(&self, credential: Credential) -> Result<()> {
            self.inner.update(credential).await
        }
        async fn delete(&self, id: &str) -> Result<bool> {
            self.inner.delete(id).await
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyBackend> {
        Arc::new(FlakyBackend {
            inner: InMemoryCredentialRepository::new(),
            failures: AtomicU32::new(failures),
            reads: AtomicU32::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn cached_reads_retry_and_hit_cache() {
        let backend = flaky(2);
        backend.inner.insert(credential("c1", "u1")).await.unwrap();
        let repo = CachedCredentialRepository::new(backend.clone(), Duration::from_secs(30));

        assert!(repo.get("c1").await.unwrap().is_some());
        assert_eq!(backend.reads.load(Ordering::SeqCst), 3);

        assert!(repo.get("c1").await.unwrap().is_some());
        assert_eq!(backend.reads.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(repo.evict_expired().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_fault_surfaces_after_retries() {
        let backend = flaky(10);
        let repo = CachedCredentialRepository::new(backend.clone(), Duration::from_secs(30));
        assert!(matches!(
            repo.get("c1").await,
            Err(SecurityError::StorageUnavailable(_))
        ));
        assert_eq!(backend.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn writes_invalidate_cache() {
        let backend = flaky(0);
        let repo = CachedCredentialRepository::new(backend.clone(), Duration::from_secs(30));
        repo.insert(credential("c1", "u1")).await.unwrap();
        assert_eq!(repo.get("c1").await.unwrap().unwrap().counter, 0);
        assert!(repo.update_counter("c1", 0, None, 9, Utc::now()).await.unwrap());
        assert_eq!(repo.get("c1").await.unwrap().unwrap().counter, 9);
        assert!(repo.delete("c1").await.unwrap());
        assert!(repo.get("c1").await.unwrap().is_none());
    }
}
