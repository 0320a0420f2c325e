// restoretool/src/restore/cancel.rs
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::controllers::CancelFlag;
use super::lease::FileLease;

/// Background observer for a running restore.
///
/// Polls the external cancel flag and trips the run's token when it is set.
/// While it runs it also keeps the lease heartbeat fresh.
pub struct CancelWatcher {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CancelWatcher {
    pub fn spawn(
        flag: Arc<dyn CancelFlag>,
        lease: Option<(Arc<FileLease>, Uuid)>,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let heartbeat_every = lease
                .as_ref()
                .map(|(l, _)| (l.ttl() / 4).max(interval))
                .unwrap_or(Duration::MAX);
            let mut last_heartbeat = Instant::now();

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match flag.is_requested().await {
                    Ok(true) => {
                        debug!("Cancel flag observed");
                        token.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to read the cancel flag: {}", e),
                }

                if let Some((lease, holder_id)) = &lease {
                    if last_heartbeat.elapsed() >= heartbeat_every {
                        match lease.heartbeat(*holder_id) {
                            Ok(true) => {}
                            Ok(false) => warn!("Lease {} is no longer held by this run", holder_id),
                            Err(e) => warn!("Failed to refresh lease heartbeat: {}", e),
                        }
                        last_heartbeat = Instant::now();
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for CancelWatcher {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
