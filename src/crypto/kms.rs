use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::crypto::keys::{canonical_context, DataKey, EncryptionContext};
use crate::crypto::provider::KeyProvider;
use crate::error::{Result, SecurityError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TransitResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct EncryptData {
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct DecryptData {
    plaintext: String,
}

#[derive(Debug, Deserialize)]
struct KeyData {
    latest_version: u32,
}

/// Key provider backed by a Vault transit secrets engine.
///
/// Data keys never leave the process unwrapped except inside the TLS request to
/// Vault; wrapped keys are Vault ciphertexts (`vault:v<n>:...`). Every call carries
/// an explicit timeout and any failure surfaces as `KeyUnavailable`.
#[derive(Clone)]
pub struct TransitKeyProvider {
    base_url: String,
    token: String,
    mount: String,
    key_name: String,
    derived: bool,
    timeout: Duration,
    http_client: Client,
}

impl std::fmt::Debug for TransitKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitKeyProvider")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("mount", &self.mount)
            .field("key_name", &self.key_name)
            .field("derived", &self.derived)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TransitKeyProvider {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        mount: impl Into<String>,
        key_name: impl Into<String>,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SecurityError::KeyUnavailable(format!("creating HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            mount: mount.into(),
            key_name: key_name.into(),
            derived: false,
            timeout: DEFAULT_TIMEOUT,
            http_client,
        })
    }

    /// Build from environment variables.
    ///
    /// - `VAULT_ADDRESS`: base URL (e.g. http://127.0.0.1:8200)
    /// - `VAULT_TOKEN`: authentication token
    /// - `VAULT_TRANSIT_MOUNT`: transit mount, default `transit`
    /// - `VAULT_TRANSIT_KEY`: transit key name
    pub fn from_env() -> Result<Option<Self>> {
        let base_url = std::env::var("VAULT_ADDRESS").ok();
        let token = std::env::var("VAULT_TOKEN").ok();
        let key = std::env::var("VAULT_TRANSIT_KEY").ok();
        let mount = std::env::var("VAULT_TRANSIT_MOUNT").unwrap_or_else(|_| "transit".into());

        match (base_url, token, key) {
            (Some(base), Some(tok), Some(key)) => {
                debug!(base_url = %base, mount = %mount, key = %key, "transit key provider configured");
                Self::new(base, tok, mount, key).map(Some)
            }
            _ => {
                debug!("Vault transit not configured (missing VAULT_ADDRESS, VAULT_TOKEN, or VAULT_TRANSIT_KEY)");
                Ok(None)
            }
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The transit key was created with `derived=true`; the context is sent with
    /// every call so Vault binds it into the key derivation.
    pub fn with_derived_context(mut self, derived: bool) -> Self {
        self.derived = derived;
        self
    }

    fn url(&self, action: &str) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.base_url, self.mount, action, self.key_name
        )
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>> {
        let mut request = self
            .http_client
            .request(method, &url)
            .header("X-Vault-Token", &self.token)
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| SecurityError::KeyUnavailable("transit request timed out".into()))?
            .map_err(|e| SecurityError::KeyUnavailable(format!("transit request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = %status, "transit call rejected");
            return Err(SecurityError::KeyUnavailable(format!(
                "transit returned status {status}"
            )));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let parsed = tokio::time::timeout(self.timeout, response.json::<TransitResponse<T>>())
            .await
            .map_err(|_| SecurityError::KeyUnavailable("transit response timed out".into()))?
            .map_err(|e| SecurityError::KeyUnavailable(format!("parsing transit response: {e}")))?;
        Ok(Some(parsed.data))
    }

    fn context_field(&self, context: &EncryptionContext) -> Option<String> {
        self.derived
            .then(|| general_purpose::STANDARD.encode(canonical_context(Some(context))))
    }
}

#[async_trait]
impl KeyProvider for TransitKeyProvider {
    fn name(&self) -> &str {
        "vault-transit"
    }

    async fn wrap(&self, key: &DataKey, context: &EncryptionContext) -> Result<String> {
        let mut plaintext = general_purpose::STANDARD.encode(key.as_bytes());
        let mut body = json!({ "plaintext": plaintext });
        plaintext.zeroize();
        if let Some(ctx) = self.context_field(context) {
            body["context"] = json!(ctx);
        }

        let result = self
            .call::<EncryptData>(Method::POST, self.url("encrypt"), Some(body))
            .await;
        let data = result?.ok_or_else(|| {
            SecurityError::KeyUnavailable("transit encrypt returned no body".into())
        })?;
        Ok(data.ciphertext)
    }

    async fn unwrap(&self, wrapped: &str, context: &EncryptionContext) -> Result<DataKey> {
        if !wrapped.starts_with("vault:") {
            return Err(SecurityError::DecryptionFailed);
        }
        let mut body = json!({ "ciphertext": wrapped });
        if let Some(ctx) = self.context_field(context) {
            body["context"] = json!(ctx);
        }

        let mut data = self
            .call::<DecryptData>(Method::POST, self.url("decrypt"), Some(body))
            .await?
            .ok_or_else(|| SecurityError::KeyUnavailable("transit decrypt returned no body".into()))?;
        let raw = general_purpose::STANDARD.decode(data.plaintext.as_bytes());
        data.plaintext.zeroize();
        let mut raw = raw.map_err(|_| SecurityError::DecryptionFailed)?;
        let key = DataKey::from_slice(&raw);
        raw.zeroize();
        key
    }

    async fn rotate(&self) -> Result<u32> {
        let url = format!(
            "{}/v1/{}/keys/{}/rotate",
            self.base_url, self.mount, self.key_name
        );
        self.call::<serde_json::Value>(Method::POST, url, None).await?;
        let version = self.active_version().await?;
        info!(provider = "vault-transit", key = %self.key_name, version, "master key rotated");
        Ok(version)
    }

    async fn active_version(&self) -> Result<u32> {
        let data = self
            .call::<KeyData>(Method::GET, self.url("keys"), None)
            .await?
            .ok_or_else(|| SecurityError::KeyUnavailable("transit key lookup returned no body".into()))?;
        Ok(data.latest_version)
    }
}
