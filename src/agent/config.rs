use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::audit::AuditConfig;
use crate::security::{DdosConfig, RateLimitRule};
use crate::webauthn::{RelyingPartyConfig, WebAuthnSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyProviderKind {
    /// Keyring file on local disk.
    Local,
    /// Vault transit engine, configured from `VAULT_*` environment variables.
    Vault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_provider")]
    pub provider: KeyProviderKind,
    #[serde(default = "default_keyring_path")]
    pub keyring_path: String,
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// 0 disables data-key caching.
    #[serde(default = "default_data_key_cache_secs")]
    pub data_key_cache_secs: u64,
    #[serde(default = "default_data_key_cache_entries")]
    pub data_key_cache_entries: usize,
    #[serde(default = "default_kms_timeout_ms")]
    pub kms_timeout_ms: u64,
}

fn default_provider() -> KeyProviderKind {
    KeyProviderKind::Local
}
fn default_keyring_path() -> String {
    "keyring.json".to_string()
}
fn default_rotation_interval_secs() -> u64 {
    30 * 24 * 3600
}
fn default_data_key_cache_secs() -> u64 {
    300
}
fn default_data_key_cache_entries() -> usize {
    1024
}
fn default_kms_timeout_ms() -> u64 {
    5000
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            keyring_path: default_keyring_path(),
            rotation_interval_secs: default_rotation_interval_secs(),
            data_key_cache_secs: default_data_key_cache_secs(),
            data_key_cache_entries: default_data_key_cache_entries(),
            kms_timeout_ms: default_kms_timeout_ms(),
        }
    }
}

/// How often the daemon runs its housekeeping sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_interval_secs: u64,
}

fn default_sweep_secs() -> u64 {
    60
}
fn default_retention_sweep_secs() -> u64 {
    3600
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_secs(),
            retention_interval_secs: default_retention_sweep_secs(),
        }
    }
}

fn default_gate_rule() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub relying_party: RelyingPartyConfig,
    #[serde(default)]
    pub webauthn: WebAuthnSettings,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRule>,
    /// Rule applied per source address by the request gate.
    #[serde(default = "default_gate_rule")]
    pub gate_rule: String,
    #[serde(default)]
    pub ddos: DdosConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub sweeps: SweepConfig,
    #[serde(default)]
    pub policies_path: Option<String>,
    #[serde(default)]
    pub json_logs: bool,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.relying_party
            .validate()
            .context("relying_party section")?;
        self.webauthn.validate().context("webauthn section")?;
        self.ddos.validate().context("ddos section")?;
        if self.encryption.rotation_interval_secs == 0 {
            bail!("encryption.rotation_interval_secs must be positive");
        }
        if let Some(rule) = &self.webauthn.rate_limit_rule {
            if !self.rate_limits.iter().any(|r| &r.name == rule) {
                bail!("webauthn.rate_limit_rule '{rule}' is not defined in rate_limits");
            }
        }
        Ok(())
    }
}
