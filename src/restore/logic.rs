// restoretool/src/restore/logic.rs
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

use super::archive::{BackupArchive, METADATA_ENTRY, UPLOADS_ENTRY};
use super::cancel::CancelWatcher;
use super::compat::{RestoreStrategy, dumped_by_version, read_dump_header};
use super::controllers::{CancelFlag, JobQueue, ReadonlyMode, wait_for_jobs_to_drain};
use super::db_restore::{SiteDatabase, psql_command};
use super::lease::{FileLease, Operation};
use super::log::{LogEvent, RestoreLogger};
use super::metadata::{BackupMetadata, validate_version};
use super::notify::{Notifier, RestoreNotification};
use super::process::{CommandRunner, CommandSpec};
use super::schema_swap::{ROLLBACK_FLOWS, Schema, SwapFlow};
use super::state::{RestoreOutcome, RestoreRequest, RestoreStep, RunContext};
use super::uploads::{UploadsPlan, remap_pairs};
use crate::config::RestoreSettings;
use crate::errors::{RestoreError, Result};
use crate::storage::{ArchiveStore, validate_archive_filename};

/// The systems a restore talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ArchiveStore>,
    pub runner: Arc<dyn CommandRunner>,
    pub database: Arc<dyn SiteDatabase>,
    pub jobs: Arc<dyn JobQueue>,
    pub readonly: Arc<dyn ReadonlyMode>,
    pub cancel_flag: Arc<dyn CancelFlag>,
    pub notifier: Arc<dyn Notifier>,
    pub lease: Arc<FileLease>,
}

pub struct RestoreOrchestrator {
    settings: RestoreSettings,
    deps: Collaborators,
    log_channel: Option<broadcast::Sender<LogEvent>>,
}

impl RestoreOrchestrator {
    pub fn new(settings: RestoreSettings, deps: Collaborators) -> Self {
        Self {
            settings,
            deps,
            log_channel: None,
        }
    }

    /// Pushes every log line of every run to `channel`.
    pub fn with_log_channel(mut self, channel: broadcast::Sender<LogEvent>) -> Self {
        self.log_channel = Some(channel);
        self
    }

    /// Runs one restore from start to finish.
    ///
    /// Errors never escape: they end the run on the failure path, which
    /// attempts a rollback when it is safe. Cleanup and the notification to
    /// the requesting user happen on every path.
    pub async fn run(&self, request: RestoreRequest) -> RestoreOutcome {
        let logger = RestoreLogger::new(request.client_session_id.clone(), self.log_channel.clone());
        let mut ctx = RunContext::new(request, logger);
        ctx.log(format!(
            "[STARTED] '{}' restoring '{}' for user {}",
            self.settings.tenant, ctx.request.archive_filename, ctx.request.requesting_user_id
        ));

        match self.execute(&mut ctx).await {
            Ok(()) => {
                ctx.success = true;
                ctx.step = RestoreStep::Done;
                ctx.log("Restore completed.");
            }
            Err(e) => {
                ctx.fail(&e);
                ctx.log(format!(
                    "EXCEPTION during {}: {}",
                    ctx.failed_step.unwrap_or(RestoreStep::Init),
                    e
                ));
                if !e.is_precondition() {
                    self.rollback(&mut ctx).await;
                }
            }
        }

        self.clean_up(&mut ctx).await;
        ctx.log(if ctx.success { "[SUCCESS]" } else { "[FAILED]" });
        self.notify_user(&ctx).await;
        ctx.into_outcome()
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        self.initialize(ctx).await?;
        self.acquire_archive(ctx).await?;
        let metadata = self.extract_metadata(ctx).await?;
        self.validate_metadata(ctx, metadata).await?;
        let strategy = self.prepare_dump(ctx).await?;

        match strategy {
            RestoreStrategy::InPlace => self.restore_in_place(ctx).await?,
            RestoreStrategy::ShadowSchema => self.restore_via_shadow_schema(ctx).await?,
        }

        ctx.enter(RestoreStep::Migrate)?;
        self.migrate_database(ctx).await?;

        ctx.enter(RestoreStep::Reconnect)?;
        ctx.log("Reconnecting to the database...");
        self.deps.database.reconnect().await?;

        ctx.enter(RestoreStep::PostProcess)?;
        self.post_process(ctx).await?;

        ctx.enter(RestoreStep::Uploads)?;
        self.restore_uploads(ctx).await?;

        self.after_restore_hook(ctx).await;
        Ok(())
    }

    async fn initialize(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(RestoreStep::Init)?;

        ctx.log("Ensuring restore is enabled...");
        if !self.settings.allow_restore {
            return Err(RestoreError::RestoreDisabled);
        }

        ctx.log("Ensuring no backup or restore is running...");
        let holder = self
            .deps
            .lease
            .acquire(Operation::Restore, &self.settings.tenant)?;
        let holder_id = holder.holder_id;
        ctx.lease = Some(holder);
        self.attach_log_file(ctx);

        // A cancel request left over from an earlier run must not stop this one.
        self.deps.cancel_flag.clear().await?;
        ctx.watcher = Some(CancelWatcher::spawn(
            self.deps.cancel_flag.clone(),
            Some((self.deps.lease.clone(), holder_id)),
            self.settings.cancel_poll_interval,
            ctx.cancel.clone(),
        ));

        ctx.log("Ensuring we have a user...");
        let user_id = ctx.request.requesting_user_id;
        let user = self
            .deps
            .database
            .find_user(user_id)
            .await?
            .ok_or(RestoreError::UserNotFound(user_id))?;
        ctx.log(format!(
            "User '{}' <{}>{} requested the restore.",
            user.username,
            user.email,
            if user.staff { " (staff)" } else { "" }
        ));
        ctx.user = Some(user);

        ctx.log("Ensuring we have a filename...");
        validate_archive_filename(&ctx.request.archive_filename)?;
        Ok(())
    }

    fn attach_log_file(&self, ctx: &RunContext) {
        let Some(log_dir) = &self.settings.log_dir else {
            return;
        };
        let path = log_dir.join(format!(
            "{}-{}.log",
            self.settings.tenant,
            ctx.started_at.format("%Y-%m-%d-%H%M%S")
        ));
        if let Err(e) = ctx.logger.attach_file(&path) {
            warn!("Could not open restore log file {}: {}", path.display(), e);
        }
    }

    async fn acquire_archive(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(RestoreStep::Acquire)?;
        let archive = BackupArchive::create(
            &self.settings.tmp_root,
            &self.settings.tenant,
            &ctx.request.archive_filename,
            ctx.started_at,
        )?;
        ctx.tmp_dir = Some(archive.tmp_dir.clone());
        let destination = archive.archive_path.clone();
        ctx.archive = Some(archive);

        ctx.log(format!(
            "Downloading '{}' to {}...",
            ctx.request.archive_filename,
            destination.display()
        ));
        self.deps
            .store
            .download(&ctx.request.archive_filename, &destination)
            .await
    }

    async fn extract_metadata(&self, ctx: &mut RunContext) -> Result<BackupMetadata> {
        ctx.enter(RestoreStep::Extract)?;
        ctx.log("Unzipping archive, this may take a while...");
        ctx.archive_mut()?.decompress().await?;

        let metadata_entry = {
            let archive = ctx.archive_mut()?;
            if archive.kind.is_tar() {
                archive.list_entries()?;
                archive.find_entry(METADATA_ENTRY)
            } else {
                None
            }
        };

        if let Some(entry) = metadata_entry {
            ctx.log("Extracting metadata file...");
            let path = self.extract_entry(ctx, &entry, false).await?;
            ctx.archive_mut()?.metadata_path = Some(path.clone());
            let content = tokio::fs::read_to_string(&path).await?;
            return BackupMetadata::parse(&content);
        }

        ctx.log("No metadata file found in the archive. Reading the version from the filename...");
        BackupMetadata::from_filename(&ctx.request.archive_filename)
            .ok_or_else(|| RestoreError::MissingMetadata(ctx.request.archive_filename.clone()))
    }

    async fn validate_metadata(&self, ctx: &mut RunContext, metadata: BackupMetadata) -> Result<()> {
        ctx.enter(RestoreStep::ValidateMetadata)?;
        ctx.log("Validating metadata...");

        let installed = match self.settings.installed_schema_version {
            Some(version) => version,
            None => self.deps.database.installed_schema_version().await?,
        };
        ctx.log(format!("  Current version: {}", installed));
        ctx.log(format!("  Restored version: {}", metadata.schema_version));
        validate_version(metadata.schema_version, installed)?;

        if metadata.multisite != self.settings.multisite {
            ctx.log(format!(
                "WARNING: the backup was made on a {} deployment but this one is {}.",
                if metadata.multisite { "multisite" } else { "single-site" },
                if self.settings.multisite { "multisite" } else { "single-site" }
            ));
        }
        ctx.metadata = Some(metadata);
        Ok(())
    }

    /// Extracts the dump and picks the strategy from its header.
    async fn prepare_dump(&self, ctx: &mut RunContext) -> Result<RestoreStrategy> {
        if ctx.archive()?.dump_path.is_none() {
            let entry = ctx
                .archive()?
                .find_dump_entry()
                .ok_or_else(|| RestoreError::Extraction {
                    entry: "dump.sql.gz".into(),
                    message: "the archive does not contain a database dump".into(),
                })?;
            ctx.log("Extracting dump file...");
            let path = self.extract_entry(ctx, &entry, false).await?;
            ctx.archive_mut()?.dump_path = Some(path);
        }

        let dump_path = self.dump_path(ctx)?;
        let header = tokio::task::spawn_blocking(move || read_dump_header(&dump_path))
            .await
            .map_err(|e| RestoreError::Extraction {
                entry: "dump header".into(),
                message: e.to_string(),
            })??;

        let version = dumped_by_version(&header);
        let strategy = RestoreStrategy::select(version.as_ref());
        match &version {
            Some(version) => ctx.log(format!(
                "Dump was produced by pg_dump {}; using the {} strategy.",
                version, strategy
            )),
            None => ctx.log(format!(
                "No pg_dump version found in the dump header; using the {} strategy.",
                strategy
            )),
        }
        ctx.strategy = Some(strategy);
        Ok(strategy)
    }

    /// Live tables move to `backup` first, then the dump loads straight into
    /// `public`. Once that load starts the old data cannot be put back
    /// automatically.
    async fn restore_in_place(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(RestoreStep::InPlaceRestore)?;
        self.enable_readonly(ctx).await?;
        self.pause_jobs(ctx).await?;
        self.drain_jobs(ctx).await?;

        ctx.checkpoint()?;
        ctx.log("Moving live tables to the backup schema...");
        ctx.begin_mutation();
        self.swap(ctx, &[SwapFlow::MakeRoom]).await?;
        ctx.rollback_available = true;

        ctx.checkpoint()?;
        ctx.log("Restoring dump file into public... (this may take a while)");
        ctx.rollback_available = false;
        self.restore_dump(ctx, RestoreStrategy::InPlace).await
    }

    /// The dump loads into `restore` while the site keeps serving; only the
    /// final swap needs readonly mode.
    async fn restore_via_shadow_schema(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.enter(RestoreStep::ShadowSchemaRestore)?;
        if self.deps.database.relation_count(Schema::Restore).await? > 0 {
            ctx.log("Dropping the leftover restore schema from an earlier run...");
        }
        self.deps.database.reset_shadow_schema().await?;

        ctx.log("Restoring dump file into the restore schema... (this may take a while)");
        self.restore_dump(ctx, RestoreStrategy::ShadowSchema).await?;

        ctx.checkpoint()?;
        self.enable_readonly(ctx).await?;
        self.pause_jobs(ctx).await?;
        self.drain_jobs(ctx).await?;

        ctx.checkpoint()?;
        ctx.log("Swapping the restored schema into place...");
        ctx.begin_mutation();
        self.swap(ctx, &[SwapFlow::MakeRoom, SwapFlow::Promote]).await?;
        ctx.rollback_available = true;
        Ok(())
    }

    /// Swaps run in one transaction; a failed swap leaves the schemas as they were.
    async fn swap(&self, ctx: &mut RunContext, flows: &[SwapFlow]) -> Result<()> {
        match self.deps.database.swap_schemas(flows).await {
            Ok(()) => Ok(()),
            Err(e) => {
                ctx.log("The schema swap was rolled back by the database; live tables are unchanged.");
                ctx.rolled_back = true;
                Err(e)
            }
        }
    }

    async fn restore_dump(&self, ctx: &RunContext, strategy: RestoreStrategy) -> Result<()> {
        let dump_path = self.dump_path(ctx)?;
        let spec = psql_command(
            &self.settings.database_url,
            &dump_path,
            strategy,
            &self.settings.dump_failure_marker,
        )?;
        self.deps.runner.run(&spec, &ctx.logger, &ctx.cancel).await
    }

    async fn migrate_database(&self, ctx: &RunContext) -> Result<()> {
        ctx.log("Migrating the database...");
        let spec = CommandSpec::from_parts(&self.settings.migrate_command)?
            .env("SKIP_POST_DEPLOY_MIGRATIONS", "0")
            .env("DATABASE_URL", self.settings.database_url.clone())
            .describe("database migration");
        self.deps.runner.run(&spec, &ctx.logger, &ctx.cancel).await
    }

    async fn post_process(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.log("Reloading site settings...");
        self.deps.database.reload_settings().await?;
        ctx.log("Clearing caches...");
        self.deps.database.clear_caches().await?;

        if ctx.request.disable_emails {
            if self.deps.database.disable_non_staff_emails().await? {
                ctx.log("Outgoing emails are now disabled for non-staff users.");
            } else {
                ctx.log("Outgoing emails were already restricted; leaving the setting as is.");
            }
        }

        if ctx.readonly_active_by_run {
            ctx.log("Disabling readonly mode...");
            self.deps.readonly.disable().await?;
            ctx.readonly_active_by_run = false;
        }
        Ok(())
    }

    async fn restore_uploads(&self, ctx: &mut RunContext) -> Result<()> {
        let metadata = ctx.metadata()?.clone();
        let uploads_entry = {
            let archive = ctx.archive()?;
            if archive.kind.is_tar() {
                archive.find_entry(UPLOADS_ENTRY)
            } else {
                None
            }
        };

        let mut plan = None;
        if let Some(entry) = uploads_entry {
            ctx.log("Extracting uploads...");
            let uploads_root = self.extract_entry(ctx, &entry, true).await?;
            ctx.archive_mut()?.uploads_path = Some(uploads_root.clone());

            let found = UploadsPlan::inspect(&uploads_root, &metadata)?;
            let live_dir = self.settings.uploads_dir.join(&self.settings.tenant);
            tokio::fs::create_dir_all(&live_dir).await?;
            ctx.log(format!("Merging uploads into {}...", live_dir.display()));
            let spec = found.merge_command(&self.settings.uploads_dir, &self.settings.tenant);
            self.deps.runner.run(&spec, &ctx.logger, &ctx.cancel).await?;
            plan = Some(found);
        } else {
            ctx.log("No uploads found in the archive.");
        }

        let previous_tenant = plan
            .as_ref()
            .map(|p| p.previous_tenant.clone())
            .or_else(|| metadata.tenant.clone());
        for (from, to) in remap_pairs(
            &metadata,
            &self.settings.site_urls,
            previous_tenant.as_deref(),
            &self.settings.tenant,
        ) {
            ctx.checkpoint()?;
            ctx.log(format!("Remapping '{}' to '{}'...", from, to));
            let rows = self.deps.database.remap(&from, &to).await?;
            ctx.log(format!("  {} rows updated", rows));
        }

        let Some(plan) = plan else {
            return Ok(());
        };

        if self.settings.migrate_to_object_storage {
            if let Some(command) = &self.settings.object_storage_migrate_command {
                ctx.log("Migrating uploads to object storage...");
                let spec = CommandSpec::from_parts(command)?.describe("object storage migration");
                self.deps.runner.run(&spec, &ctx.logger, &ctx.cancel).await?;
            }
        }

        if plan.derived_images_present {
            ctx.log("Optimized images are included in the archive; skipping regeneration.");
        } else {
            ctx.log("Optimized images are missing; they will be regenerated.");
            self.deps.database.reset_derived_images().await?;
            if let Some(command) = &self.settings.regenerate_images_command {
                let spec = CommandSpec::from_parts(command)?.describe("image regeneration");
                self.deps.runner.run(&spec, &ctx.logger, &ctx.cancel).await?;
            }
        }
        Ok(())
    }

    /// Failures here are reported but do not undo a finished restore.
    async fn after_restore_hook(&self, ctx: &RunContext) {
        let Some(command) = &self.settings.after_restore_command else {
            return;
        };
        ctx.log("Running the after-restore command...");
        let result = match CommandSpec::from_parts(command) {
            Ok(spec) => {
                let spec = spec.describe("after-restore command");
                self.deps.runner.run(&spec, &ctx.logger, &ctx.cancel).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            ctx.log(format!("WARNING: the after-restore command failed: {}", e));
        }
    }

    async fn extract_entry(&self, ctx: &RunContext, entry: &str, keep_newer: bool) -> Result<PathBuf> {
        let archive = ctx.archive()?;
        let spec = archive.extract_command(entry, keep_newer)?;
        let path = archive.extracted_path(entry);
        self.deps
            .runner
            .run(&spec, &ctx.logger, &ctx.cancel)
            .await
            .map_err(|e| match e {
                RestoreError::Cancelled(_) => e,
                other => RestoreError::Extraction {
                    entry: entry.to_string(),
                    message: other.to_string(),
                },
            })?;
        Ok(path)
    }

    fn dump_path(&self, ctx: &RunContext) -> Result<PathBuf> {
        ctx.archive()?
            .dump_path
            .clone()
            .ok_or_else(|| RestoreError::Extraction {
                entry: "dump.sql.gz".into(),
                message: "the dump file has not been extracted".into(),
            })
    }

    async fn enable_readonly(&self, ctx: &mut RunContext) -> Result<()> {
        let was_enabled = self.deps.readonly.is_enabled().await?;
        ctx.readonly_was_enabled = Some(was_enabled);
        if was_enabled {
            ctx.log("Readonly mode is already enabled; it will stay enabled.");
            return Ok(());
        }
        ctx.log("Enabling readonly mode...");
        self.deps.readonly.enable().await?;
        ctx.readonly_active_by_run = true;
        Ok(())
    }

    async fn pause_jobs(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.log("Pausing background jobs...");
        self.deps.jobs.pause().await?;
        ctx.jobs_paused_by_run = true;
        Ok(())
    }

    async fn drain_jobs(&self, ctx: &RunContext) -> Result<()> {
        wait_for_jobs_to_drain(
            self.deps.jobs.as_ref(),
            &self.settings.tenant,
            &self.settings.drain,
            &ctx.logger,
            &ctx.cancel,
        )
        .await
    }

    async fn rollback(&self, ctx: &mut RunContext) {
        ctx.step = RestoreStep::Rollback;
        if !ctx.db_was_changed {
            ctx.log("The database was not changed; nothing to roll back.");
            return;
        }
        if ctx.rolled_back {
            ctx.log("Live tables were left untouched; nothing to roll back.");
            return;
        }
        if !ctx.rollback_available {
            ctx.log(
                "CANNOT ROLL BACK: the in-place restore already replaced the live tables. \
                 Manual intervention is required; the previous tables are in the backup schema.",
            );
            error!("Restore left tenant '{}' in a broken state", self.settings.tenant);
            return;
        }

        match self.deps.database.relation_count(Schema::Backup).await {
            Ok(count) if count > 0 => {}
            Ok(_) => {
                ctx.log("CANNOT ROLL BACK: the backup schema is empty. Manual intervention is required.");
                return;
            }
            Err(e) => {
                ctx.log(format!("CANNOT ROLL BACK: failed to inspect the backup schema: {}", e));
                return;
            }
        }

        ctx.log("Trying to roll back...");
        match self.deps.database.swap_schemas(&ROLLBACK_FLOWS).await {
            Ok(()) => {
                ctx.rolled_back = true;
                ctx.log("Rollback successful!");
                if let Err(e) = self.deps.database.reconnect().await {
                    ctx.log(format!("WARNING: failed to reconnect after the rollback: {}", e));
                }
            }
            Err(e) => {
                ctx.log(format!(
                    "ROLLBACK FAILED: {}. Manual intervention is required.",
                    e
                ));
            }
        }
    }

    async fn clean_up(&self, ctx: &mut RunContext) {
        ctx.step = RestoreStep::Cleanup;
        ctx.log("Cleaning stuff up...");

        if let Some(mut watcher) = ctx.watcher.take() {
            watcher.stop().await;
        }

        if let Some(archive) = &ctx.archive {
            ctx.log("Removing tmp directory...");
            if let Err(e) = archive.remove() {
                ctx.log(format!(
                    "WARNING: failed to remove {}: {}",
                    archive.tmp_dir.display(),
                    e
                ));
            }
        }

        if ctx.jobs_paused_by_run {
            ctx.log("Resuming background jobs...");
            match self.deps.jobs.resume().await {
                Ok(()) => ctx.jobs_paused_by_run = false,
                Err(e) => ctx.log(format!("WARNING: failed to resume background jobs: {}", e)),
            }
        }

        if ctx.readonly_active_by_run {
            if ctx.left_system_broken() {
                ctx.log("Leaving readonly mode enabled because the database could not be restored.");
            } else {
                ctx.log("Disabling readonly mode...");
                match self.deps.readonly.disable().await {
                    Ok(()) => ctx.readonly_active_by_run = false,
                    Err(e) => ctx.log(format!("WARNING: failed to disable readonly mode: {}", e)),
                }
            }
        } else if ctx.readonly_was_enabled == Some(true) {
            ctx.log("Readonly mode was enabled before the restore; leaving it enabled.");
        }

        if let Some(holder) = ctx.lease.take() {
            ctx.log("Releasing the restore lease...");
            if let Err(e) = self.deps.lease.release(holder.holder_id) {
                ctx.log(format!("WARNING: failed to release the restore lease: {}", e));
            }
        }
    }

    /// The user is looked up again by email: after a restore their id may differ.
    async fn notify_user(&self, ctx: &RunContext) {
        let Some(user) = &ctx.user else {
            ctx.log("No user to notify.");
            return;
        };

        let recipient = match self.deps.database.find_user_by_email(&user.email).await {
            Ok(Some(recipient)) => recipient,
            Ok(None) => {
                ctx.log(format!(
                    "Could not find a user with email <{}> after the restore; no notification was sent.",
                    user.email
                ));
                return;
            }
            Err(e) => {
                ctx.log(format!("Could not look up the user to notify: {}", e));
                return;
            }
        };

        ctx.log(format!("Notifying '{}' of the end of the restore...", recipient.username));
        let notification = RestoreNotification {
            user_id: recipient.id,
            success: ctx.success,
            filename: ctx.request.archive_filename.clone(),
            transcript: ctx.logger.transcript(),
        };
        if let Err(e) = self.deps.notifier.notify(&notification).await {
            warn!("Failed to notify user {}: {}", recipient.id, e);
        }
    }

    /// Moves the `backup` schema back into `public` outside of a restore run.
    pub async fn rollback_now(&self) -> Result<bool> {
        let holder = self
            .deps
            .lease
            .acquire(Operation::Restore, &self.settings.tenant)?;

        let result: Result<bool> = async {
            let count = self.deps.database.relation_count(Schema::Backup).await?;
            if count == 0 {
                return Ok(false);
            }
            self.deps.database.swap_schemas(&ROLLBACK_FLOWS).await?;
            self.deps.database.reconnect().await?;
            Ok(true)
        }
        .await;

        self.deps.lease.release(holder.holder_id)?;
        result
    }
}
