// restoretool/src/restore/state.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::archive::BackupArchive;
use super::cancel::CancelWatcher;
use super::compat::RestoreStrategy;
use super::lease::LeaseHolder;
use super::log::{LogLine, RestoreLogger};
use super::metadata::BackupMetadata;
use crate::errors::{RestoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStep {
    Init,
    Acquire,
    Extract,
    ValidateMetadata,
    InPlaceRestore,
    ShadowSchemaRestore,
    Migrate,
    Reconnect,
    PostProcess,
    Uploads,
    Done,
    Failed,
    Rollback,
    Cleanup,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStep::Init => "INIT",
            RestoreStep::Acquire => "ACQUIRE",
            RestoreStep::Extract => "EXTRACT",
            RestoreStep::ValidateMetadata => "VALIDATE_METADATA",
            RestoreStep::InPlaceRestore => "IN_PLACE_RESTORE",
            RestoreStep::ShadowSchemaRestore => "SHADOW_SCHEMA_RESTORE",
            RestoreStep::Migrate => "MIGRATE",
            RestoreStep::Reconnect => "RECONNECT",
            RestoreStep::PostProcess => "POST_PROCESS",
            RestoreStep::Uploads => "UPLOADS",
            RestoreStep::Done => "DONE",
            RestoreStep::Failed => "FAILED",
            RestoreStep::Rollback => "ROLLBACK",
            RestoreStep::Cleanup => "CLEANUP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub requesting_user_id: i64,
    pub archive_filename: String,
    pub client_session_id: Option<String>,
    pub disable_emails: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub staff: bool,
}

/// Result of one `run`, handed back to the caller once cleanup is over.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub failed_step: Option<RestoreStep>,
    pub error: Option<String>,
    pub strategy: Option<RestoreStrategy>,
    pub db_was_changed: bool,
    pub rolled_back: bool,
    pub tmp_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub logs: Vec<LogLine>,
}

/// Everything a single run threads through its steps.
pub struct RunContext {
    pub run_id: Uuid,
    pub request: RestoreRequest,
    pub step: RestoreStep,
    pub started_at: DateTime<Utc>,
    pub logger: RestoreLogger,
    pub cancel: CancellationToken,
    pub watcher: Option<CancelWatcher>,
    pub lease: Option<LeaseHolder>,
    pub user: Option<UserInfo>,
    pub archive: Option<BackupArchive>,
    pub tmp_dir: Option<PathBuf>,
    pub metadata: Option<BackupMetadata>,
    pub strategy: Option<RestoreStrategy>,
    pub db_was_changed: bool,
    /// Set while a `backup` schema holds the pre-run live tables and moving it
    /// back would restore them.
    pub rollback_available: bool,
    pub rolled_back: bool,
    pub readonly_was_enabled: Option<bool>,
    /// Readonly was switched on by this run and not yet switched off again.
    pub readonly_active_by_run: bool,
    pub jobs_paused_by_run: bool,
    pub success: bool,
    pub failed_step: Option<RestoreStep>,
    pub error: Option<String>,
}

impl RunContext {
    pub fn new(request: RestoreRequest, logger: RestoreLogger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request,
            step: RestoreStep::Init,
            started_at: Utc::now(),
            logger,
            cancel: CancellationToken::new(),
            watcher: None,
            lease: None,
            user: None,
            archive: None,
            tmp_dir: None,
            metadata: None,
            strategy: None,
            db_was_changed: false,
            rollback_available: false,
            rolled_back: false,
            readonly_was_enabled: None,
            readonly_active_by_run: false,
            jobs_paused_by_run: false,
            success: false,
            failed_step: None,
            error: None,
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.logger.log(message);
    }

    /// Moves to `step`; this is also the safe point where cancellation is honoured.
    pub fn enter(&mut self, step: RestoreStep) -> Result<()> {
        self.checkpoint()?;
        tracing::debug!(run_id = %self.run_id, "entering {}", step);
        self.step = step;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RestoreError::Cancelled(format!(
                "restore was cancelled during {}",
                self.step
            )));
        }
        Ok(())
    }

    /// Called right before the first statement that touches live schemas.
    pub fn begin_mutation(&mut self) {
        self.db_was_changed = true;
    }

    pub fn fail(&mut self, error: &RestoreError) {
        self.failed_step = Some(self.step);
        self.error = Some(error.to_string());
        self.step = RestoreStep::Failed;
    }

    /// The live schema was changed and could not be put back.
    pub fn left_system_broken(&self) -> bool {
        self.db_was_changed && !self.rolled_back
    }

    pub fn archive(&self) -> Result<&BackupArchive> {
        self.archive
            .as_ref()
            .ok_or_else(|| RestoreError::Storage("backup archive was not downloaded".into()))
    }

    pub fn archive_mut(&mut self) -> Result<&mut BackupArchive> {
        self.archive
            .as_mut()
            .ok_or_else(|| RestoreError::Storage("backup archive was not downloaded".into()))
    }

    pub fn metadata(&self) -> Result<&BackupMetadata> {
        self.metadata
            .as_ref()
            .ok_or_else(|| RestoreError::MissingMetadata(self.request.archive_filename.clone()))
    }

    pub fn into_outcome(self) -> RestoreOutcome {
        RestoreOutcome {
            run_id: self.run_id,
            success: self.success,
            failed_step: self.failed_step,
            error: self.error,
            strategy: self.strategy,
            db_was_changed: self.db_was_changed,
            rolled_back: self.rolled_back,
            tmp_dir: self.tmp_dir,
            started_at: self.started_at,
            finished_at: Utc::now(),
            logs: self.logger.lines(),
        }
    }
}
