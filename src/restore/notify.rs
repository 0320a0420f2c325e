// restoretool/src/restore/notify.rs
use async_trait::async_trait;
use serde::Serialize;

use crate::errors::Result;

/// The single message a requesting user receives at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreNotification {
    pub user_id: i64,
    pub success: bool,
    pub filename: String,
    pub transcript: String,
}

impl RestoreNotification {
    pub fn kind(&self) -> &'static str {
        if self.success {
            "restore_succeeded"
        } else {
            "restore_failed"
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &RestoreNotification) -> Result<()>;
}
