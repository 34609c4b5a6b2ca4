use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::crypto::aead;
use crate::crypto::keys::{canonical_context, DataKey, EncryptionContext};
use crate::error::{Result, SecurityError};

/// Master-key backend that wraps and unwraps data keys.
///
/// Implementations fail with `KeyUnavailable` when the master key is missing,
/// corrupt, or the backend does not answer in time.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn wrap(&self, key: &DataKey, context: &EncryptionContext) -> Result<String>;

    async fn unwrap(&self, wrapped: &str, context: &EncryptionContext) -> Result<DataKey>;

    /// Create a new master key version and make it active. Prior versions stay usable
    /// for unwrapping.
    async fn rotate(&self) -> Result<u32>;

    async fn active_version(&self) -> Result<u32>;
}

const LOCAL_PREFIX: &str = "local";

#[derive(Debug, Serialize, Deserialize)]
struct KeyringFile {
    active: u32,
    keys: Vec<StoredKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredKey {
    version: u32,
    key: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MasterKey {
    key: DataKey,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Keyring {
    active: u32,
    keys: BTreeMap<u32, MasterKey>,
}

impl Keyring {
    fn fresh() -> Result<Self> {
        let mut keys = BTreeMap::new();
        keys.insert(
            1,
            MasterKey {
                key: DataKey::generate()?,
                created_at: Utc::now(),
            },
        );
        Ok(Self { active: 1, keys })
    }

    fn from_file(file: KeyringFile) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for mut stored in file.keys {
            let mut raw = general_purpose::STANDARD.decode(stored.key.as_bytes()).map_err(|_| {
                SecurityError::KeyUnavailable(format!("master key v{} is corrupt", stored.version))
            })?;
            stored.key.zeroize();
            let key = DataKey::from_slice(&raw);
            raw.zeroize();
            keys.insert(
                stored.version,
                MasterKey {
                    key: key?,
                    created_at: stored.created_at,
                },
            );
        }
        if !keys.contains_key(&file.active) {
            return Err(SecurityError::KeyUnavailable(format!(
                "active master key v{} missing from keyring",
                file.active
            )));
        }
        Ok(Self {
            active: file.active,
            keys,
        })
    }

    fn to_file(&self) -> KeyringFile {
        KeyringFile {
            active: self.active,
            keys: self
                .keys
                .iter()
                .map(|(version, master)| StoredKey {
                    version: *version,
                    key: general_purpose::STANDARD.encode(master.key.as_bytes()),
                    created_at: master.created_at,
                })
                .collect(),
        }
    }

    fn rotate(&mut self) -> Result<u32> {
        let next = self.keys.keys().next_back().copied().unwrap_or(0) + 1;
        self.keys.insert(
            next,
            MasterKey {
                key: DataKey::generate()?,
                created_at: Utc::now(),
            },
        );
        self.active = next;
        Ok(next)
    }
}

/// Versioned master keys held in a local keyring file.
///
/// Wrapped keys look like `local:v<version>:<base64>`; the data key is sealed with
/// AES-256-GCM under the master key using the canonical context as AAD, so a
/// context mismatch fails at unwrap.
#[derive(Debug)]
pub struct LocalKeyProvider {
    path: Option<PathBuf>,
    ring: RwLock<Keyring>,
}

impl LocalKeyProvider {
    /// Ephemeral keyring; nothing touches disk.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            path: None,
            ring: RwLock::new(Keyring::fresh()?),
        })
    }

    /// Create a new keyring file. Fails if one already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(SecurityError::Validation(format!(
                "keyring {} already exists",
                path.display()
            )));
        }
        let ring = Keyring::fresh()?;
        write_keyring(path, &ring)?;
        info!(path = %path.display(), "created master keyring");
        Ok(Self {
            path: Some(path.to_path_buf()),
            ring: RwLock::new(ring),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::KeyUnavailable(format!("cannot read keyring {}: {e}", path.display()))
        })?;
        let file: KeyringFile = serde_json::from_str(&raw).map_err(|_| {
            SecurityError::KeyUnavailable(format!("keyring {} is corrupt", path.display()))
        })?;
        let ring = Keyring::from_file(file)?;
        debug!(path = %path.display(), active = ring.active, versions = ring.keys.len(), "opened master keyring");
        Ok(Self {
            path: Some(path.to_path_buf()),
            ring: RwLock::new(ring),
        })
    }

    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn versions(&self) -> Vec<u32> {
        self.read().keys.keys().copied().collect()
    }

    /// Rotate when the active master key is older than `max_age`.
    pub fn rotate_if_due(&self, max_age: chrono::Duration) -> Result<Option<u32>> {
        let due = {
            let ring = self.read();
            ring.keys
                .get(&ring.active)
                .map(|k| Utc::now() - k.created_at >= max_age)
                .unwrap_or(true)
        };
        if due {
            self.rotate_sync().map(Some)
        } else {
            Ok(None)
        }
    }

    fn rotate_sync(&self) -> Result<u32> {
        let mut ring = match self.ring.write() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };
        let version = ring.rotate()?;
        if let Some(path) = &self.path {
            write_keyring(path, &ring)?;
        }
        info!(provider = LOCAL_PREFIX, version, "master key rotated");
        Ok(version)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Keyring> {
        match self.ring.read() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        }
    }
}

fn write_keyring(path: &Path, ring: &Keyring) -> Result<()> {
    let mut file = ring.to_file();
    let json = serde_json::to_vec_pretty(&file)
        .map_err(|e| SecurityError::KeyUnavailable(format!("cannot encode keyring: {e}")));
    for stored in &mut file.keys {
        stored.key.zeroize();
    }
    let mut json = json?;

    let tmp = path.with_extension("tmp");
    let written = write_private(&tmp, &json).and_then(|_| std::fs::rename(&tmp, path));
    json.zeroize();
    written.map_err(|e| {
        SecurityError::KeyUnavailable(format!("cannot write keyring {}: {e}", path.display()))
    })
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

fn parse_local(wrapped: &str) -> Option<(u32, &str)> {
    let mut parts = wrapped.splitn(3, ':');
    if parts.next()? != LOCAL_PREFIX {
        return None;
    }
    let version = parts.next()?.strip_prefix('v')?.parse().ok()?;
    Some((version, parts.next()?))
}

#[async_trait]
impl KeyProvider for LocalKeyProvider {
    fn name(&self) -> &str {
        LOCAL_PREFIX
    }

    async fn wrap(&self, key: &DataKey, context: &EncryptionContext) -> Result<String> {
        let ring = self.read();
        let master = ring
            .keys
            .get(&ring.active)
            .ok_or_else(|| SecurityError::KeyUnavailable("active master key missing".into()))?;
        let sealed = aead::seal(
            master.key.as_bytes(),
            &canonical_context(Some(context)),
            key.as_bytes(),
        )?;
        Ok(format!(
            "{LOCAL_PREFIX}:v{}:{}",
            ring.active,
            general_purpose::STANDARD.encode(sealed)
        ))
    }

    async fn unwrap(&self, wrapped: &str, context: &EncryptionContext) -> Result<DataKey> {
        let (version, body) = parse_local(wrapped).ok_or(SecurityError::DecryptionFailed)?;
        let sealed = general_purpose::STANDARD
            .decode(body)
            .map_err(|_| SecurityError::DecryptionFailed)?;
        let master = self
            .read()
            .keys
            .get(&version)
            .cloned()
            .ok_or_else(|| SecurityError::KeyUnavailable(format!("master key v{version} not found")))?;
        let mut raw = aead::open(master.key.as_bytes(), &canonical_context(Some(context)), &sealed)?;
        let key = DataKey::from_slice(&raw);
        raw.zeroize();
        key
    }

    async fn rotate(&self) -> Result<u32> {
        self.rotate_sync()
    }

    async fn active_version(&self) -> Result<u32> {
        Ok(self.read().active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(pairs: &[(&str, &str)]) -> EncryptionContext {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn wrap_unwrap_roundtrip() {
        let provider = LocalKeyProvider::in_memory().unwrap();
        let key = DataKey::generate().unwrap();
        let context = ctx(&[("tenant", "a")]);
        let wrapped = provider.wrap(&key, &context).await.unwrap();
        assert!(wrapped.starts_with("local:v1:"));
        assert_eq!(provider.unwrap(&wrapped, &context).await.unwrap(), key);
    }

    #[tokio::test]
    async fn unwrap_with_other_context_fails() {
        let provider = LocalKeyProvider::in_memory().unwrap();
        let key = DataKey::generate().unwrap();
        let wrapped = provider.wrap(&key, &ctx(&[("tenant", "a")])).await.unwrap();
        assert_eq!(
            provider.unwrap(&wrapped, &ctx(&[("tenant", "b")])).await,
            Err(SecurityError::DecryptionFailed)
        );
    }

    #[tokio::test]
    async fn rotation_keeps_old_versions() {
        let provider = LocalKeyProvider::in_memory().unwrap();
        let key = DataKey::generate().unwrap();
        let context = EncryptionContext::new();
        let old = provider.wrap(&key, &context).await.unwrap();

        assert_eq!(provider.rotate().await.unwrap(), 2);
        assert_eq!(provider.active_version().await.unwrap(), 2);
        assert!(provider.wrap(&key, &context).await.unwrap().starts_with("local:v2:"));
        assert_eq!(provider.unwrap(&old, &context).await.unwrap(), key);
        assert_eq!(provider.versions(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_version_is_unavailable() {
        let provider = LocalKeyProvider::in_memory().unwrap();
        let result = provider.unwrap("local:v9:AAAA", &EncryptionContext::new()).await;
        assert!(matches!(result, Err(SecurityError::KeyUnavailable(_))));
    }

    #[tokio::test]
    async fn keyring_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        let key = DataKey::generate().unwrap();
        let context = ctx(&[("purpose", "backup")]);

        let wrapped = {
            let provider = LocalKeyProvider::create(&path).unwrap();
            provider.rotate().await.unwrap();
            provider.wrap(&key, &context).await.unwrap()
        };

        let reopened = LocalKeyProvider::open_or_create(&path).unwrap();
        assert_eq!(reopened.active_version().await.unwrap(), 2);
        assert_eq!(reopened.unwrap(&wrapped, &context).await.unwrap(), key);
        assert!(LocalKeyProvider::create(&path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn keyring_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        LocalKeyProvider::create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_keyring_is_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keyring.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            LocalKeyProvider::open(&path),
            Err(SecurityError::KeyUnavailable(_))
        ));
        assert!(matches!(
            LocalKeyProvider::open(dir.path().join("missing.json")),
            Err(SecurityError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn rotate_if_due_respects_age() {
        let provider = LocalKeyProvider::in_memory().unwrap();
        assert_eq!(provider.rotate_if_due(chrono::Duration::days(90)).unwrap(), None);
        assert_eq!(provider.rotate_if_due(chrono::Duration::zero()).unwrap(), Some(2));
    }
}
