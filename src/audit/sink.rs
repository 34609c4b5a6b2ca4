use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::audit::event::{AuditEvent, RiskLevel};
use crate::error::{Result, SecurityError};

/// Durable destination for flushed audit events. Append-only.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()>;

    /// Remove events older than `cutoff`; returns how many were purged.
    async fn purge_before(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

/// Keeps events in memory; used by tests and for in-process queries.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_for_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        self.events.write().await.extend_from_slice(events);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok(before - events.len())
    }
}

/// Mirrors audit events onto the `audit` tracing target.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }

    fn emit(&self, event: &AuditEvent) {
        let id = event.id.to_string();
        let outcome = format!("{:?}", event.outcome).to_lowercase();
        let risk = event.risk_level.as_str();
        match event.risk_level {
            RiskLevel::Low | RiskLevel::Medium => {
                info!(target: "audit", event_id = %id, actor = %event.actor, action = %event.action, resource = %event.resource, outcome = %outcome, risk)
            }
            RiskLevel::High => {
                warn!(target: "audit", event_id = %id, actor = %event.actor, action = %event.action, resource = %event.resource, outcome = %outcome, risk)
            }
            RiskLevel::Critical => {
                error!(target: "audit", severity = "critical", event_id = %id, actor = %event.actor, action = %event.action, resource = %event.resource, outcome = %outcome, risk)
            }
        }
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        for event in events {
            self.emit(event);
        }
        Ok(())
    }
}

/// Appends events as JSON lines to a local file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SecurityError::StorageUnavailable(e.to_string())),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| SecurityError::StorageUnavailable(format!("corrupt audit line: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)
                .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
        file.write_all(&buf)
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let events = self.read_all().await?;
        let kept: Vec<&AuditEvent> = events.iter().filter(|e| e.timestamp >= cutoff).collect();
        let purged = events.len() - kept.len();
        if purged == 0 {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for event in kept {
            serde_json::to_writer(&mut buf, event)
                .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
            buf.push(b'\n');
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &buf)
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
        Ok(purged)
    }
}

/// Fans a batch out to several sinks; the first failure is reported.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AuditSink for FanoutSink {
    async fn write_batch(&self, events: &[AuditEvent]) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.write_batch(events).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        for sink in &self.sinks {
            purged += sink.purge_before(cutoff).await?;
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{ActorProfile, AuditOutcome};
    use tempfile::tempdir;

    fn event(action: &str) -> AuditEvent {
        AuditEvent::new(&ActorProfile::user("u-1"), action, "res", AuditOutcome::Success)
    }

    #[tokio::test]
    async fn memory_sink_filters_by_action() {
        let sink = MemoryAuditSink::new();
        sink.write_batch(&[event("a"), event("b"), event("a")]).await.unwrap();
        assert_eq!(sink.events().await.len(), 3);
        assert_eq!(sink.events_for_action("a").await.len(), 2);
    }

    #[tokio::test]
    async fn json_lines_sink_appends_and_purges() {
        let dir = tempdir().unwrap();
        let sink = JsonLinesAuditSink::new(dir.path().join("audit.log"));

        let mut old = event("old");
        old.timestamp = Utc::now() - chrono::Duration::days(120);
        sink.write_batch(&[old]).await.unwrap();
        sink.write_batch(&[event("new")]).await.unwrap();
        assert_eq!(sink.read_all().await.unwrap().len(), 2);

        let purged = sink
            .purge_before(Utc::now() - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        let remaining = sink.read_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].action, "new");
    }

    #[tokio::test]
    async fn fanout_writes_to_all() {
        let a = MemoryAuditSink::new();
        let b = MemoryAuditSink::new();
        let fan = FanoutSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone()), Arc::new(TracingAuditSink::new())]);
        fan.write_batch(&[event("x")]).await.unwrap();
        assert_eq!(a.events().await.len(), 1);
        assert_eq!(b.events().await.len(), 1);
    }
}
