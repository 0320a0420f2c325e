// restoretool/src/restore/lease.rs
//! System-wide exclusive lease shared by restores and backups.
//!
//! The lease is a lock file created with `create_new`, so at most one holder
//! can exist at a time. The holder record is JSON and can be inspected by
//! anyone (`status`). A holder whose heartbeat is older than the TTL is
//! considered dead and its lease may be taken over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{RestoreError, Result};

const LEASE_FILE: &str = "operation.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Restore,
    Backup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Restore => f.write_str("restore"),
            Operation::Backup => f.write_str("backup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub holder_id: Uuid,
    pub operation: Operation,
    pub tenant: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of tenant '{}' (pid {}, holder {}) since {}",
            self.operation, self.tenant, self.pid, self.holder_id, self.acquired_at
        )
    }
}

#[derive(Debug, Clone)]
pub struct FileLease {
    path: PathBuf,
    ttl: Duration,
}

impl FileLease {
    pub fn new(lock_dir: &Path, ttl: Duration) -> Self {
        Self {
            path: lock_dir.join(LEASE_FILE),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Result<Option<LeaseHolder>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_stale(&self, holder: &LeaseHolder, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        now.signed_duration_since(holder.heartbeat_at) > ttl
    }

    pub fn acquire(&self, operation: Operation, tenant: &str) -> Result<LeaseHolder> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let now = Utc::now();
        let holder = LeaseHolder {
            holder_id: Uuid::new_v4(),
            operation,
            tenant: tenant.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        };

        // One takeover attempt for a stale lease.
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    file.write_all(serde_json::to_string(&holder)?.as_bytes())?;
                    file.sync_all()?;
                    info!("Acquired {} lease {}", operation, holder.holder_id);
                    return Ok(holder);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let current = match self.holder() {
                        Ok(Some(current)) => current,
                        // Released between our attempt and the read.
                        Ok(None) => continue,
                        Err(e) => {
                            return Err(RestoreError::OperationRunning(format!(
                                "unreadable lease file {} ({})",
                                self.path.display(),
                                e
                            )));
                        }
                    };
                    if !self.is_stale(&current, Utc::now()) {
                        return Err(RestoreError::OperationRunning(current.to_string()));
                    }
                    warn!("Taking over stale lease held by {}", current);
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RestoreError::OperationRunning(format!(
            "lease {} is contended",
            self.path.display()
        )))
    }

    /// Refreshes the heartbeat. Returns false when `holder_id` no longer owns the lease.
    pub fn heartbeat(&self, holder_id: Uuid) -> Result<bool> {
        let Some(mut current) = self.holder()? else {
            return Ok(false);
        };
        if current.holder_id != holder_id {
            return Ok(false);
        }
        current.heartbeat_at = Utc::now();

        let tmp_path = self.path.with_extension("lock.tmp");
        fs::write(&tmp_path, serde_json::to_string(&current)?)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(true)
    }

    /// Releases the lease if `holder_id` still owns it.
    pub fn release(&self, holder_id: Uuid) -> Result<bool> {
        match self.holder()? {
            Some(current) if current.holder_id == holder_id => {
                fs::remove_file(&self.path)?;
                info!("Released {} lease {}", current.operation, holder_id);
                Ok(true)
            }
            Some(current) => {
                warn!(
                    "Not releasing lease {}: it is now held by {}",
                    holder_id, current
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_cycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lease = FileLease::new(dir.path(), Duration::from_secs(60));

        assert_eq!(lease.holder()?, None);
        let holder = lease.acquire(Operation::Restore, "default")?;
        assert_eq!(lease.holder()?, Some(holder.clone()));

        assert!(lease.release(holder.holder_id)?);
        assert_eq!(lease.holder()?, None);
        assert!(!lease.release(holder.holder_id)?);
        Ok(())
    }

    #[test]
    fn test_second_acquire_is_rejected_with_holder_identity() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lease = FileLease::new(dir.path(), Duration::from_secs(60));
        let backup = lease.acquire(Operation::Backup, "tenant_a")?;

        match lease.acquire(Operation::Restore, "tenant_a") {
            Err(RestoreError::OperationRunning(description)) => {
                assert!(description.contains("backup"));
                assert!(description.contains(&backup.holder_id.to_string()));
            }
            other => panic!("expected OperationRunning, got {:?}", other),
        }
        assert_eq!(lease.holder()?.map(|h| h.holder_id), Some(backup.holder_id));
        Ok(())
    }

    #[test]
    fn test_release_by_other_holder_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lease = FileLease::new(dir.path(), Duration::from_secs(60));
        let holder = lease.acquire(Operation::Restore, "default")?;

        assert!(!lease.release(Uuid::new_v4())?);
        assert!(lease.holder()?.is_some());
        assert!(lease.release(holder.holder_id)?);
        Ok(())
    }

    #[test]
    fn test_stale_lease_is_taken_over() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lease = FileLease::new(dir.path(), Duration::from_secs(60));
        let old = LeaseHolder {
            holder_id: Uuid::new_v4(),
            operation: Operation::Restore,
            tenant: "default".into(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            heartbeat_at: Utc::now() - chrono::Duration::hours(1),
        };
        fs::write(lease.path(), serde_json::to_string(&old)?)?;

        let fresh = lease.acquire(Operation::Restore, "default")?;
        assert_ne!(fresh.holder_id, old.holder_id);
        assert_eq!(lease.holder()?.map(|h| h.holder_id), Some(fresh.holder_id));
        Ok(())
    }

    #[test]
    fn test_heartbeat_refreshes_only_own_lease() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lease = FileLease::new(dir.path(), Duration::from_secs(60));
        let holder = lease.acquire(Operation::Restore, "default")?;

        assert!(lease.heartbeat(holder.holder_id)?);
        let refreshed = lease.holder()?.expect("holder");
        assert!(refreshed.heartbeat_at >= holder.heartbeat_at);
        assert_eq!(refreshed.acquired_at, holder.acquired_at);

        assert!(!lease.heartbeat(Uuid::new_v4())?);
        Ok(())
    }
}
