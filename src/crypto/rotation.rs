use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::crypto::envelope::EnvelopeEncryptionService;

fn jitter(interval: Duration) -> Duration {
    use rand::Rng;
    // up to 5% of the interval, capped at five minutes
    let max_ms = (interval.as_millis() / 20).min(300_000) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Background task that rotates the master key every `interval` (plus jitter).
///
/// A failed rotation is logged and retried on the next tick; previously wrapped
/// data keys are never re-encrypted here.
pub fn spawn_key_rotation(
    service: Arc<EnvelopeEncryptionService>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = interval + jitter(interval);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            match service.rotate_master_key().await {
                Ok(version) => {
                    info!(provider = %service.provider().name(), version, "scheduled master key rotation complete");
                }
                Err(err) => {
                    warn!(provider = %service.provider().name(), error = %err, "scheduled master key rotation failed (will retry)");
                }
            }
        }
        debug!("key rotation task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::provider::{KeyProvider, LocalKeyProvider};

    #[test]
    fn jitter_is_bounded() {
        let interval = Duration::from_secs(3600);
        for _ in 0..100 {
            assert!(jitter(interval) <= Duration::from_secs(180));
        }
        assert_eq!(jitter(Duration::from_millis(10)), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_on_schedule_and_stops_on_shutdown() {
        let provider = Arc::new(LocalKeyProvider::in_memory().unwrap());
        let service = Arc::new(EnvelopeEncryptionService::new(provider.clone()));
        let before = service.encrypt(b"payload", None).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_key_rotation(service.clone(), Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(64)).await;
        assert_eq!(provider.active_version().await.unwrap(), 2);
        assert_eq!(service.decrypt(&before).await.unwrap(), b"payload");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
