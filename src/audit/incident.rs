use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::event::{AuditEvent, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

/// Incident opened for a critical audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub event_id: Uuid,
    pub title: String,
    pub severity: RiskLevel,
    pub status: IncidentStatus,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub responders: Vec<String>,
    pub actor: String,
    pub resource: String,
}

/// Holds incident records. Owned by the incident task; shared read access for queries.
#[derive(Debug, Clone)]
pub struct IncidentManager {
    incidents: Arc<RwLock<HashMap<Uuid, Incident>>>,
    responders: Vec<String>,
}

impl IncidentManager {
    pub fn new(responders: Vec<String>) -> Self {
        Self {
            incidents: Arc::new(RwLock::new(HashMap::new())),
            responders,
        }
    }

    pub async fn open_from_event(&self, event: &AuditEvent) -> Incident {
        let now = Utc::now();
        let incident = Incident {
            id: Uuid::new_v4(),
            event_id: event.id,
            title: format!("{} on {} ({:?})", event.action, event.resource, event.outcome).to_lowercase(),
            severity: event.risk_level,
            status: IncidentStatus::Open,
            opened_at: now,
            updated_at: now,
            responders: self.responders.clone(),
            actor: event.actor.clone(),
            resource: event.resource.clone(),
        };
        self.incidents.write().await.insert(incident.id, incident.clone());
        warn!(incident_id = %incident.id, event_id = %event.id, title = %incident.title, "incident opened");
        incident
    }

    pub async fn get(&self, id: Uuid) -> Option<Incident> {
        self.incidents.read().await.get(&id).cloned()
    }

    pub async fn open_incidents(&self) -> Vec<Incident> {
        let mut open: Vec<Incident> = self
            .incidents
            .read()
            .await
            .values()
            .filter(|i| i.status != IncidentStatus::Resolved)
            .cloned()
            .collect();
        open.sort_by_key(|i| i.opened_at);
        open
    }

    async fn transition(&self, id: Uuid, status: IncidentStatus) -> bool {
        let mut incidents = self.incidents.write().await;
        match incidents.get_mut(&id) {
            Some(incident) if incident.status != IncidentStatus::Resolved => {
                incident.status = status;
                incident.updated_at = Utc::now();
                info!(incident_id = %id, status = ?status, "incident updated");
                true
            }
            _ => false,
        }
    }

    pub async fn acknowledge(&self, id: Uuid) -> bool {
        self.transition(id, IncidentStatus::Acknowledged).await
    }

    pub async fn resolve(&self, id: Uuid) -> bool {
        self.transition(id, IncidentStatus::Resolved).await
    }

    /// Forget incidents resolved before `cutoff`. Open and acknowledged
    /// incidents are kept however old they are.
    pub async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut incidents = self.incidents.write().await;
        let before = incidents.len();
        incidents.retain(|_, i| i.status != IncidentStatus::Resolved || i.updated_at >= cutoff);
        let purged = before - incidents.len();
        if purged > 0 {
            info!(purged, "resolved incidents purged");
        }
        purged
    }
}

/// Escalation channel to designated responders.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, incident: &Incident) -> anyhow::Result<()>;
}

/// Writes escalations to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, incident: &Incident) -> anyhow::Result<()> {
        error!(
            severity = "critical",
            incident_id = %incident.id,
            responders = ?incident.responders,
            title = %incident.title,
            "escalating incident"
        );
        Ok(())
    }
}

/// Posts escalations as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, incident: &Incident) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(incident).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("alert webhook returned status {}", response.status());
        }
        debug!(incident_id = %incident.id, "escalation delivered");
        Ok(())
    }
}

/// Consumes the audit feed and opens an incident per critical event; opened
/// incidents are handed to the alerting task over `alerts`.
pub fn spawn_incident_manager(
    manager: IncidentManager,
    mut events: broadcast::Receiver<AuditEvent>,
    alerts: mpsc::Sender<Incident>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                received = events.recv() => received,
                _ = shutdown.changed() => break,
            };
            match event {
                Ok(event) if event.is_critical() => {
                    let incident = manager.open_from_event(&event).await;
                    if alerts.try_send(incident).is_err() {
                        error!(severity = "critical", event_id = %event.id, "alert queue full, escalation dropped");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    error!(severity = "critical", skipped, "incident manager lagged behind audit feed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("incident manager stopped");
    })
}

/// Delivers escalation notifications for opened incidents.
pub fn spawn_alerter(
    notifier: Arc<dyn Notifier>,
    mut alerts: mpsc::Receiver<Incident>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let incident = tokio::select! {
                received = alerts.recv() => received,
                _ = shutdown.changed() => None,
            };
            let Some(incident) = incident else { break };
            if let Err(e) = notifier.notify(&incident).await {
                warn!(incident_id = %incident.id, error = %e, "escalation notification failed");
            }
        }
        // drain whatever was queued before shutdown
        while let Ok(incident) = alerts.try_recv() {
            if let Err(e) = notifier.notify(&incident).await {
                warn!(incident_id = %incident.id, error = %e, "escalation notification failed");
            }
        }
    })
}
