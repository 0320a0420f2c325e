mod logic; // Orchestrator state machine
pub(crate) mod archive; // Per-run temp directory and tar handling
pub(crate) mod cancel; // Cancel flag observer
pub(crate) mod compat; // pg_dump version checks and dump rewriting
pub(crate) mod controllers; // Job queue, readonly mode and cancel flag boundaries
pub(crate) mod db_restore; // Site database access and psql invocation
pub(crate) mod lease; // System-wide backup/restore lease
pub(crate) mod log; // Restore transcript
pub(crate) mod metadata; // meta.json parsing
pub(crate) mod notify; // End-of-run notification
pub(crate) mod process; // External command runner
pub(crate) mod schema_swap; // Moving relations between schemas
pub(crate) mod state; // Run context
pub(crate) mod uploads; // Uploads merge and URL remapping


use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::{AppConfig, RestoreSettings, load_restore_config_from_json};
use crate::storage::get_archive_store;
use crate::utils::setting::check_db_connection_async;
use controllers::CancelFlag;
use db_restore::{PgSite, SiteDatabase};
use lease::FileLease;
use process::SystemCommandRunner;
use schema_swap::Schema;

pub use log::LogEvent;
pub use logic::{Collaborators, RestoreOrchestrator};
pub use state::{RestoreOutcome, RestoreRequest};

async fn connect_site(settings: &RestoreSettings) -> Result<Arc<PgSite>> {
    if !check_db_connection_async(&settings.database_url).await {
        anyhow::bail!("Cannot connect to the site database.");
    }
    let site = PgSite::connect(&settings.database_url, &settings.tenant)
        .await
        .context("Failed to open the site database pool")?;
    Ok(Arc::new(site))
}

async fn build_orchestrator(app_config: &AppConfig) -> Result<RestoreOrchestrator> {
    let settings = load_restore_config_from_json(app_config)
        .context("Failed to load restore configuration from JSON")?;
    let site = connect_site(&settings).await?;
    let lease = Arc::new(FileLease::new(&app_config.lock_dir, settings.lease_ttl));

    let deps = Collaborators {
        store: Arc::from(get_archive_store(app_config)),
        runner: Arc::new(SystemCommandRunner),
        database: site.clone(),
        jobs: site.clone(),
        readonly: site.clone(),
        cancel_flag: site.clone(),
        notifier: site,
        lease,
    };
    Ok(RestoreOrchestrator::new(settings, deps))
}

/// Public entry point for the restore process.
pub async fn run_restore_flow(
    app_config: &AppConfig,
    request: RestoreRequest,
    log_channel: Option<broadcast::Sender<LogEvent>>,
) -> Result<RestoreOutcome> {
    let mut orchestrator = build_orchestrator(app_config).await?;
    if let Some(channel) = log_channel {
        orchestrator = orchestrator.with_log_channel(channel);
    }
    Ok(orchestrator.run(request).await)
}

/// Puts the `backup` schema back in place of `public`.
pub async fn run_manual_rollback(app_config: &AppConfig) -> Result<bool> {
    let orchestrator = build_orchestrator(app_config).await?;
    orchestrator
        .rollback_now()
        .await
        .context("Manual rollback failed")
}

pub async fn print_status(app_config: &AppConfig) -> Result<()> {
    let settings = load_restore_config_from_json(app_config)
        .context("Failed to load restore configuration from JSON")?;
    let lease = FileLease::new(&app_config.lock_dir, settings.lease_ttl);

    match lease.holder().context("Failed to read the lease file")? {
        Some(holder) if lease.is_stale(&holder, chrono::Utc::now()) => {
            println!("⚠️ Stale lease: {} (last heartbeat {})", holder, holder.heartbeat_at);
        }
        Some(holder) => println!("🔒 Running: {}", holder),
        None => println!("💤 No backup or restore is running."),
    }
    println!("Lease file: {}", lease.path().display());

    let site = connect_site(&settings).await?;
    let relations = site
        .relation_count(Schema::Backup)
        .await
        .context("Failed to inspect the backup schema")?;
    if relations > 0 {
        println!("↩️ Rollback available: the backup schema holds {} tables.", relations);
    } else {
        println!("No backup schema to roll back to.");
    }
    Ok(())
}

pub async fn request_cancel(app_config: &AppConfig) -> Result<()> {
    let settings = load_restore_config_from_json(app_config)
        .context("Failed to load restore configuration from JSON")?;
    let site = connect_site(&settings).await?;
    site.request()
        .await
        .context("Failed to set the cancel flag")?;
    println!("🛑 Cancellation requested; the running restore will stop at its next safe point.");
    Ok(())
}
