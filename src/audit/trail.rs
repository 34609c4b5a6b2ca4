use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::audit::event::{ActorProfile, AuditEvent, AuditOutcome, RiskLevel};
use crate::audit::seal::AuditSealer;
use crate::audit::sink::AuditSink;
use crate::error::Result;

/// Buffering and retention settings for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_flush_batch")]
    pub flush_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// JSON-lines file receiving flushed events; tracing only when unset.
    #[serde(default)]
    pub log_path: Option<String>,
    /// Responders notified when an incident is opened.
    #[serde(default)]
    pub responders: Vec<String>,
    /// Optional webhook receiving escalation notifications.
    #[serde(default)]
    pub alert_webhook: Option<String>,
}

fn default_buffer_capacity() -> usize {
    4096
}
fn default_flush_batch() -> usize {
    256
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_retention_days() -> u32 {
    365
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            flush_batch_size: default_flush_batch(),
            flush_interval_ms: default_flush_interval_ms(),
            retention_days: default_retention_days(),
            channel_capacity: default_channel_capacity(),
            log_path: None,
            responders: Vec::new(),
            alert_webhook: None,
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

struct TrailState {
    buffer: VecDeque<AuditEvent>,
    sealer: AuditSealer,
    dropped: u64,
}

struct TrailInner {
    config: AuditConfig,
    state: Mutex<TrailState>,
    sink: Arc<dyn AuditSink>,
    flush_signal: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    events_tx: broadcast::Sender<AuditEvent>,
}

/// Append-only audit stream.
///
/// `record` never blocks on I/O: events are sealed, buffered and published to
/// subscribers immediately, then written to the sink by `flush` (normally driven
/// by the background flusher). On overflow the oldest unflushed events are dropped
/// and the next flush records a critical `audit.events_dropped` meta-event.
#[derive(Clone)]
pub struct AuditTrail {
    inner: Arc<TrailInner>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("pending", &self.pending())
            .finish()
    }
}

impl AuditTrail {
    pub fn new(config: AuditConfig, sink: Arc<dyn AuditSink>, sealer: AuditSealer) -> Self {
        let (events_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(TrailInner {
                state: Mutex::new(TrailState {
                    buffer: VecDeque::with_capacity(config.buffer_capacity.min(1024)),
                    sealer,
                    dropped: 0,
                }),
                config,
                sink,
                flush_signal: Notify::new(),
                flush_lock: tokio::sync::Mutex::new(()),
                events_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrailState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Append an event. Returns its id.
    pub fn record(&self, mut event: AuditEvent) -> Uuid {
        let id = event.id;
        let capacity = self.inner.config.buffer_capacity.max(1);
        let should_flush = {
            let mut state = self.state();
            state.sealer.seal(&mut event);
            state.buffer.push_back(event.clone());
            while state.buffer.len() > capacity {
                state.buffer.pop_front();
                state.dropped += 1;
            }
            state.buffer.len() >= self.inner.config.flush_batch_size
        };

        // No subscribers is fine.
        let _ = self.inner.events_tx.send(event);

        if should_flush {
            self.inner.flush_signal.notify_one();
        }
        id
    }

    /// Live feed of recorded events for incident management and alerting.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.state().buffer.len()
    }

    /// Write all buffered events to the sink. Returns how many were written.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.inner.flush_lock.lock().await;

        let dropped = std::mem::take(&mut self.state().dropped);
        if dropped > 0 {
            let meta = AuditEvent::new(
                &ActorProfile::system(),
                "audit.events_dropped",
                "audit-trail",
                AuditOutcome::Failure,
            )
            .with_metadata("dropped", dropped)
            .with_min_risk(RiskLevel::Critical);
            error!(severity = "critical", dropped, "audit buffer overflow, oldest events dropped");
            self.record(meta);
        }

        let batch_size = self.inner.config.flush_batch_size.max(1);
        let mut flushed = 0;
        loop {
            let batch: Vec<AuditEvent> = {
                let mut state = self.state();
                let n = state.buffer.len().min(batch_size);
                state.buffer.drain(..n).collect()
            };
            if batch.is_empty() {
                break;
            }

            if let Err(err) = self.inner.sink.write_batch(&batch).await {
                error!(severity = "critical", error = %err, events = batch.len(), "audit sink write failed");
                self.requeue(batch);
                return Err(err);
            }
            flushed += batch.len();
        }

        if flushed > 0 {
            debug!(flushed, "audit events flushed");
        }
        Ok(flushed)
    }

    fn requeue(&self, batch: Vec<AuditEvent>) {
        let capacity = self.inner.config.buffer_capacity.max(1);
        let mut state = self.state();
        for event in batch.into_iter().rev() {
            state.buffer.push_front(event);
        }
        while state.buffer.len() > capacity {
            state.buffer.pop_front();
            state.dropped += 1;
        }
    }

    /// Drop events older than the retention window from the sink.
    pub async fn purge_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.inner.config.retention();
        let purged = self.inner.sink.purge_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "audit retention purge");
        }
        Ok(purged)
    }

    /// Background flusher: flushes on interval or when a batch fills up, and once
    /// more when shutdown is signalled.
    pub fn spawn_flusher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let trail = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(trail.inner.config.flush_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = trail.inner.flush_signal.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if let Err(e) = trail.flush().await {
                    debug!(error = %e, "flush deferred to next tick");
                }
            }
            match trail.flush().await {
                Ok(n) => info!(flushed = n, "audit trail drained on shutdown"),
                Err(e) => error!(severity = "critical", error = %e, "audit events lost on shutdown"),
            }
        })
    }
}
