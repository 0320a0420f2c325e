// restoretool/src/restore/controllers.rs
//! Boundaries to the job queue, readonly mode and the external cancel flag.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::log::RestoreLogger;
use crate::config::DrainSettings;
use crate::errors::{RestoreError, Result};

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    /// In-flight jobs scoped to `tenant` or to all tenants.
    async fn running_jobs(&self, tenant: &str) -> Result<u64>;
}

#[async_trait]
pub trait ReadonlyMode: Send + Sync {
    async fn is_enabled(&self) -> Result<bool>;
    async fn enable(&self) -> Result<()>;
    async fn disable(&self) -> Result<()>;
}

#[async_trait]
pub trait CancelFlag: Send + Sync {
    async fn is_requested(&self) -> Result<bool>;
    async fn request(&self) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

async fn sleep_or_cancel(duration: std::time::Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RestoreError::Cancelled("restore was cancelled while waiting for background jobs".into())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Blocks until no job is running for `tenant`.
///
/// Paused queues still let already-started jobs finish, so the first check
/// happens only after the settle delay. Gives up after `max_retries` checks.
pub async fn wait_for_jobs_to_drain(
    queue: &dyn JobQueue,
    tenant: &str,
    settings: &DrainSettings,
    logger: &RestoreLogger,
    cancel: &CancellationToken,
) -> Result<()> {
    logger.log("Waiting for background jobs to finish...");
    sleep_or_cancel(settings.settle, cancel).await?;

    for attempt in 1..=settings.max_retries {
        let running = queue.running_jobs(tenant).await?;
        if running == 0 {
            logger.log("No background jobs are running.");
            return Ok(());
        }
        logger.log(format!(
            "{} background job(s) still running (check {}/{})",
            running, attempt, settings.max_retries
        ));
        if attempt < settings.max_retries {
            sleep_or_cancel(settings.interval, cancel).await?;
        }
    }

    Err(RestoreError::DrainTimeout {
        retries: settings.max_retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountdownQueue {
        remaining: AtomicU64,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for CountdownQueue {
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn resume(&self) -> Result<()> {
            Ok(())
        }
        async fn running_jobs(&self, _tenant: &str) -> Result<u64> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            let current = self.remaining.load(Ordering::SeqCst);
            self.remaining.store(current.saturating_sub(1), Ordering::SeqCst);
            Ok(current)
        }
    }

    fn quick(max_retries: u32) -> DrainSettings {
        DrainSettings {
            settle: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_drain_waits_until_jobs_finish() -> anyhow::Result<()> {
        let queue = CountdownQueue {
            remaining: AtomicU64::new(2),
            checks: AtomicUsize::new(0),
        };
        let logger = RestoreLogger::new(None, None);
        wait_for_jobs_to_drain(&queue, "default", &quick(6), &logger, &CancellationToken::new())
            .await?;
        assert_eq!(queue.checks.load(Ordering::SeqCst), 3);
        assert!(logger.contains("No background jobs are running."));
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_retry_bound() {
        let queue = CountdownQueue {
            remaining: AtomicU64::new(100),
            checks: AtomicUsize::new(0),
        };
        let logger = RestoreLogger::new(None, None);
        let result =
            wait_for_jobs_to_drain(&queue, "default", &quick(3), &logger, &CancellationToken::new())
                .await;
        assert!(matches!(result, Err(RestoreError::DrainTimeout { retries: 3 })));
        assert_eq!(queue.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_drain_honours_cancellation() {
        let queue = CountdownQueue {
            remaining: AtomicU64::new(100),
            checks: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let settings = DrainSettings {
            settle: Duration::from_secs(60),
            ..quick(3)
        };
        let result = wait_for_jobs_to_drain(
            &queue,
            "default",
            &settings,
            &RestoreLogger::new(None, None),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(RestoreError::Cancelled(_))));
        assert_eq!(queue.checks.load(Ordering::SeqCst), 0);
    }
}
