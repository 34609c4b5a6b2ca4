use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::agent::config::{Config, KeyProviderKind};
use crate::agent::tasks::TaskRegistry;
use crate::audit::incident::{spawn_alerter, spawn_incident_manager};
use crate::audit::{
    AuditSealer, AuditSink, AuditTrail, FanoutSink, IncidentManager, JsonLinesAuditSink,
    LogNotifier, Notifier, TracingAuditSink, WebhookNotifier,
};
use crate::crypto::{
    spawn_key_rotation, EnvelopeEncryptionService, KeyProvider, LocalKeyProvider,
    TransitKeyProvider,
};
use crate::policy::{InMemoryPolicyRepository, PolicyEngine};
use crate::security::{DdosGuard, HttpThreatFeed, RateLimiter, RequestGate, ThreatFeed};
use crate::webauthn::{
    CachedCredentialRepository, CredentialAuthenticator, CredentialRepository,
    InMemoryChallengeRepository, InMemoryCredentialRepository,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const ALERT_QUEUE: usize = 64;

/// Every long-lived service the daemon runs, wired together.
pub struct Services {
    pub audit: AuditTrail,
    pub incidents: IncidentManager,
    pub encryption: Arc<EnvelopeEncryptionService>,
    pub limiter: RateLimiter,
    pub guard: DdosGuard,
    pub gate: RequestGate,
    pub authenticator: Arc<CredentialAuthenticator>,
    pub policies: Arc<PolicyEngine>,
}

fn audit_sink(config: &Config) -> Arc<dyn AuditSink> {
    let tracing_sink: Arc<dyn AuditSink> = Arc::new(TracingAuditSink::new());
    match &config.audit.log_path {
        Some(path) => {
            let file_sink: Arc<dyn AuditSink> = Arc::new(JsonLinesAuditSink::new(path));
            Arc::new(FanoutSink::new(vec![file_sink, tracing_sink]))
        }
        None => tracing_sink,
    }
}

fn key_provider(config: &Config) -> Result<Arc<dyn KeyProvider>> {
    let enc = &config.encryption;
    let provider: Arc<dyn KeyProvider> = match enc.provider {
        KeyProviderKind::Local => Arc::new(
            LocalKeyProvider::open_or_create(&enc.keyring_path)
                .with_context(|| format!("opening keyring {}", enc.keyring_path))?,
        ),
        KeyProviderKind::Vault => Arc::new(
            TransitKeyProvider::from_env()
                .context("configuring Vault transit provider")?
                .context("VAULT_ADDRESS, VAULT_TOKEN and VAULT_TRANSIT_KEY must be set")?
                .with_timeout(Duration::from_millis(enc.kms_timeout_ms)),
        ),
    };
    Ok(provider)
}

/// Build all services and start their background tasks.
pub async fn build(config: &Config) -> Result<(Services, TaskRegistry)> {
    let mut tasks = TaskRegistry::new();

    let audit = AuditTrail::new(config.audit.clone(), audit_sink(config), AuditSealer::from_env()?);
    tasks.register("audit-flusher", audit.spawn_flusher(tasks.shutdown_signal()));

    let incidents = IncidentManager::new(config.audit.responders.clone());
    let (alerts_tx, alerts_rx) = mpsc::channel(ALERT_QUEUE);
    tasks.register(
        "incident-manager",
        spawn_incident_manager(incidents.clone(), audit.subscribe(), alerts_tx, tasks.shutdown_signal()),
    );
    let notifier: Arc<dyn Notifier> = match &config.audit.alert_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };
    tasks.register("alerter", spawn_alerter(notifier, alerts_rx, tasks.shutdown_signal()));

    let mut encryption = EnvelopeEncryptionService::new(key_provider(config)?);
    if config.encryption.data_key_cache_secs > 0 {
        encryption = encryption.with_data_key_cache(
            Duration::from_secs(config.encryption.data_key_cache_secs),
            config.encryption.data_key_cache_entries,
        );
    }
    let encryption = Arc::new(encryption);
    tasks.register(
        "key-rotation",
        spawn_key_rotation(
            encryption.clone(),
            Duration::from_secs(config.encryption.rotation_interval_secs),
            tasks.shutdown_signal(),
        ),
    );

    let limiter = RateLimiter::with_rules(config.rate_limits.clone());
    let guard = DdosGuard::new(config.ddos.clone()).context("ddos guard")?;
    let gate = RequestGate::new(guard.clone(), limiter.clone(), config.gate_rule.clone(), audit.clone());

    let durable: Arc<dyn CredentialRepository> = Arc::new(InMemoryCredentialRepository::new());
    let cached = (config.webauthn.credential_cache_secs > 0).then(|| {
        Arc::new(CachedCredentialRepository::new(
            durable.clone(),
            Duration::from_secs(config.webauthn.credential_cache_secs),
        ))
    });
    let credentials: Arc<dyn CredentialRepository> = match &cached {
        Some(cache) => cache.clone(),
        None => durable,
    };
    let authenticator = Arc::new(
        CredentialAuthenticator::new(
            config.relying_party.clone(),
            config.webauthn.clone(),
            credentials,
            Arc::new(InMemoryChallengeRepository::new()),
            audit.clone(),
        )
        .context("credential authenticator")?
        .with_rate_limiter(limiter.clone()),
    );

    let policies = Arc::new(
        PolicyEngine::new(Arc::new(InMemoryPolicyRepository::new()), audit.clone())
            .await
            .context("policy engine")?,
    );
    if let Some(path) = &config.policies_path {
        let count = policies.load_file(path).await?;
        info!(count, path = %path, "policies loaded from file");
    }

    let sweep = Duration::from_secs(config.sweeps.interval_secs.max(1));
    {
        let limiter = limiter.clone();
        tasks.spawn_periodic("rate-limit-sweep", sweep, move || {
            let limiter = limiter.clone();
            async move {
                limiter.sweep_idle().await;
            }
        });
    }
    {
        let guard = guard.clone();
        tasks.spawn_periodic("connection-sweep", sweep, move || {
            let guard = guard.clone();
            async move {
                guard.sweep().await;
            }
        });
    }
    {
        let authenticator = authenticator.clone();
        tasks.spawn_periodic("challenge-purge", sweep, move || {
            let authenticator = authenticator.clone();
            async move {
                if let Err(e) = authenticator.purge_expired_challenges().await {
                    error!(severity = "critical", error = %e, "challenge purge failed");
                }
            }
        });
    }
    if let Some(cache) = cached {
        tasks.spawn_periodic("credential-cache-evict", sweep, move || {
            let cache = cache.clone();
            async move {
                cache.evict_expired().await;
            }
        });
    }
    {
        let encryption = encryption.clone();
        tasks.spawn_periodic("data-key-evict", sweep, move || {
            let encryption = encryption.clone();
            async move {
                encryption.evict_expired_keys();
            }
        });
    }
    {
        let audit = audit.clone();
        let every = Duration::from_secs(config.sweeps.retention_interval_secs.max(1));
        tasks.spawn_periodic("audit-retention", every, move || {
            let audit = audit.clone();
            async move {
                if let Err(e) = audit.purge_expired().await {
                    warn!(error = %e, "audit retention purge failed");
                }
            }
        });
    }
    {
        let incidents = incidents.clone();
        let retention = config.audit.retention();
        let every = Duration::from_secs(config.sweeps.retention_interval_secs.max(1));
        tasks.spawn_periodic("incident-retention", every, move || {
            let incidents = incidents.clone();
            async move {
                incidents.purge_resolved_before(Utc::now() - retention).await;
            }
        });
    }
    if let Some(url) = &config.ddos.threat_feed_url {
        let feed: Arc<dyn ThreatFeed> = Arc::new(HttpThreatFeed::new(url.clone())?);
        let guard = guard.clone();
        let every = Duration::from_secs(config.ddos.threat_refresh_secs.max(1));
        tasks.spawn_periodic("threat-intel-refresh", every, move || {
            let guard = guard.clone();
            let feed = feed.clone();
            async move {
                if let Err(e) = guard.refresh_threat_intel(feed.as_ref()).await {
                    warn!(feed = feed.name(), error = %e, "threat intelligence refresh failed");
                }
            }
        });
    }

    info!(tasks = tasks.len(), "services started");
    Ok((
        Services {
            audit,
            incidents,
            encryption,
            limiter,
            guard,
            gate,
            authenticator,
            policies,
        },
        tasks,
    ))
}

/// Run the daemon until Ctrl-C, then stop every task and flush the audit buffer.
pub async fn run(cfg: Config) -> Result<()> {
    info!(rp_id = %cfg.relying_party.id, origin = %cfg.relying_party.origin, "trustgate daemon starting");

    let (services, tasks) = build(&cfg).await?;

    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping daemon");

    tasks.shutdown(SHUTDOWN_GRACE).await;
    match services.audit.flush().await {
        Ok(n) => info!(flushed = n, "final audit flush"),
        Err(e) => error!(severity = "critical", error = %e, "final audit flush failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webauthn::RelyingPartyConfig;

    fn config(dir: &tempfile::TempDir) -> Config {
        serde_json::from_value(serde_json::json!({
            "relying_party": {"id": "localhost", "name": "Dev", "origin": "http://localhost:8080"},
            "encryption": {"keyring_path": dir.path().join("keyring.json")},
            "rate_limits": [{"name": "default", "requests": 100, "windowMs": 60000, "burst": 100}],
            "audit": {"log_path": dir.path().join("audit.jsonl")}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn builds_services_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let (services, tasks) = build(&cfg).await.unwrap();
        assert!(tasks.len() >= 10);
        assert!(dir.path().join("keyring.json").exists());

        let env = services.encryption.encrypt(b"secret", None).await.unwrap();
        assert_eq!(services.encryption.decrypt(&env).await.unwrap(), b"secret");
        assert_eq!(services.authenticator.relying_party(), &RelyingPartyConfig {
            id: "localhost".into(),
            name: "Dev".into(),
            origin: "http://localhost:8080".into(),
        });

        tasks.shutdown(Duration::from_secs(5)).await;
    }
}
