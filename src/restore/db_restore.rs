// restoretool/src/restore/db_restore.rs
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde_json::json;
use sqlx::{PgPool, Pool, Postgres};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use super::compat::RestoreStrategy;
use super::controllers::{CancelFlag, JobQueue, ReadonlyMode};
use super::notify::{Notifier, RestoreNotification};
use super::process::{CommandSpec, StdinSource};
use super::schema_swap::{self, Schema, SwapFlow, quote_ident};
use super::state::UserInfo;
use crate::errors::{RestoreError, Result};

const OPS_SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS ops",
    r#"CREATE TABLE IF NOT EXISTS ops.site_flags (
        tenant text NOT NULL,
        name text NOT NULL,
        enabled boolean NOT NULL DEFAULT false,
        updated_at timestamptz NOT NULL DEFAULT now(),
        PRIMARY KEY (tenant, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS ops.running_jobs (
        id bigserial PRIMARY KEY,
        tenant text NOT NULL,
        job_name text NOT NULL,
        started_at timestamptz NOT NULL DEFAULT now()
    )"#,
];

const FLAG_READONLY: &str = "readonly";
const FLAG_JOBS_PAUSED: &str = "jobs_paused";
const FLAG_RESTORE_CANCEL: &str = "restore_cancel";

/// Jobs registered under this tenant label run for every tenant.
const ALL_TENANTS: &str = "*";

/// Everything the orchestrator does to the site's own database, apart from
/// loading the dump (psql) and running migrations (external command).
#[async_trait]
pub trait SiteDatabase: Send + Sync {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserInfo>>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserInfo>>;
    async fn installed_schema_version(&self) -> Result<i64>;
    async fn relation_count(&self, schema: Schema) -> Result<i64>;
    /// Drops any leftover `restore` schema and creates an empty one.
    async fn reset_shadow_schema(&self) -> Result<()>;
    /// Runs every flow in a single transaction.
    async fn swap_schemas(&self, flows: &[SwapFlow]) -> Result<()>;
    async fn reconnect(&self) -> Result<()>;
    async fn reload_settings(&self) -> Result<()>;
    async fn clear_caches(&self) -> Result<()>;
    /// Returns true when the setting was changed.
    async fn disable_non_staff_emails(&self) -> Result<bool>;
    /// Replaces `from` with `to` in every text column; returns the rows touched.
    async fn remap(&self, from: &str, to: &str) -> Result<u64>;
    async fn reset_derived_images(&self) -> Result<()>;
}

/// The live site database, reached with sqlx.
pub struct PgSite {
    database_url: String,
    tenant: String,
    pool: RwLock<PgPool>,
}

impl PgSite {
    pub async fn connect(database_url: &str, tenant: &str) -> Result<Self> {
        let pool = Pool::<Postgres>::connect(database_url).await?;
        let site = Self {
            database_url: database_url.to_string(),
            tenant: tenant.to_string(),
            pool: RwLock::new(pool),
        };
        site.ensure_ops_schema().await?;
        Ok(site)
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Operational flags live outside `public` so schema swaps never carry them.
    async fn ensure_ops_schema(&self) -> Result<()> {
        let pool = self.pool().await;
        for statement in OPS_SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(())
    }

    async fn flag(&self, name: &str) -> Result<bool> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT enabled FROM ops.site_flags WHERE tenant = $1 AND name = $2",
        )
        .bind(&self.tenant)
        .bind(name)
        .fetch_optional(&self.pool().await)
        .await?;
        Ok(enabled.unwrap_or(false))
    }

    async fn set_flag(&self, name: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ops.site_flags (tenant, name, enabled, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (tenant, name)
            DO UPDATE SET enabled = EXCLUDED.enabled, updated_at = now()
            "#,
        )
        .bind(&self.tenant)
        .bind(name)
        .bind(enabled)
        .execute(&self.pool().await)
        .await?;
        debug!("Flag {} for tenant {} set to {}", name, self.tenant, enabled);
        Ok(())
    }

    async fn notify_channel(&self, channel: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(&self.tenant)
            .execute(&self.pool().await)
            .await?;
        Ok(())
    }

    async fn text_columns(&self) -> Result<Vec<(String, String)>> {
        let columns: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT c.table_name::text, c.column_name::text
            FROM information_schema.columns c
            JOIN information_schema.tables t
              ON t.table_schema = c.table_schema AND t.table_name = c.table_name
            WHERE c.table_schema = 'public'
              AND t.table_type = 'BASE TABLE'
              AND c.data_type IN ('character varying', 'text')
            ORDER BY c.table_name, c.column_name
            "#,
        )
        .fetch_all(&self.pool().await)
        .await?;
        Ok(columns)
    }
}

const USER_COLUMNS: &str = "id, username, COALESCE(email, ''), (admin OR moderator)";

fn user_from_row(row: (i64, String, String, bool)) -> UserInfo {
    let (id, username, email, staff) = row;
    UserInfo {
        id,
        username,
        email,
        staff,
    }
}

#[async_trait]
impl SiteDatabase for PgSite {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserInfo>> {
        let row: Option<(i64, String, String, bool)> = sqlx::query_as(&format!(
            "SELECT {} FROM public.users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool().await)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserInfo>> {
        let row: Option<(i64, String, String, bool)> = sqlx::query_as(&format!(
            "SELECT {} FROM public.users WHERE lower(email) = lower($1) ORDER BY id LIMIT 1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool().await)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn installed_schema_version(&self) -> Result<i64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version::bigint) FROM public.schema_migrations")
                .fetch_one(&self.pool().await)
                .await?;
        Ok(version.unwrap_or(0))
    }

    async fn relation_count(&self, schema: Schema) -> Result<i64> {
        schema_swap::relation_count(&self.pool().await, schema).await
    }

    async fn reset_shadow_schema(&self) -> Result<()> {
        let pool = self.pool().await;
        let restore = quote_ident(Schema::Restore.as_str());
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", restore))
            .execute(&pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {}", restore))
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn swap_schemas(&self, flows: &[SwapFlow]) -> Result<()> {
        schema_swap::swap_in_transaction(&self.pool().await, flows).await
    }

    async fn reconnect(&self) -> Result<()> {
        let fresh = Pool::<Postgres>::connect(&self.database_url).await?;
        let old = std::mem::replace(&mut *self.pool.write().await, fresh);
        old.close().await;
        info!("Database connection pool re-established");
        Ok(())
    }

    async fn reload_settings(&self) -> Result<()> {
        self.notify_channel("site_settings_reload").await
    }

    async fn clear_caches(&self) -> Result<()> {
        self.notify_channel("cache_clear").await
    }

    async fn disable_non_staff_emails(&self) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE public.site_settings SET value = 'non-staff', updated_at = now() \
             WHERE name = 'disable_emails' AND value = 'no'",
        )
        .execute(&self.pool().await)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remap(&self, from: &str, to: &str) -> Result<u64> {
        let pool = self.pool().await;
        let pattern = like_pattern(from);
        let mut touched = 0;
        for (table, column) in self.text_columns().await? {
            let column = quote_ident(&column);
            let statement = format!(
                "UPDATE public.{} SET {col} = REPLACE({col}, $1, $2) WHERE {col} LIKE $3",
                quote_ident(&table),
                col = column
            );
            let result = sqlx::query(&statement)
                .bind(from)
                .bind(to)
                .bind(&pattern)
                .execute(&pool)
                .await?;
            touched += result.rows_affected();
        }
        Ok(touched)
    }

    async fn reset_derived_images(&self) -> Result<()> {
        let pool = self.pool().await;
        let exists: bool =
            sqlx::query_scalar("SELECT to_regclass('public.optimized_images') IS NOT NULL")
                .fetch_one(&pool)
                .await?;
        if exists {
            sqlx::query("TRUNCATE TABLE public.optimized_images")
                .execute(&pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgSite {
    async fn pause(&self) -> Result<()> {
        self.set_flag(FLAG_JOBS_PAUSED, true).await
    }

    async fn resume(&self) -> Result<()> {
        self.set_flag(FLAG_JOBS_PAUSED, false).await
    }

    async fn running_jobs(&self, tenant: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ops.running_jobs WHERE tenant = $1 OR tenant = $2",
        )
        .bind(tenant)
        .bind(ALL_TENANTS)
        .fetch_one(&self.pool().await)
        .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ReadonlyMode for PgSite {
    async fn is_enabled(&self) -> Result<bool> {
        self.flag(FLAG_READONLY).await
    }

    async fn enable(&self) -> Result<()> {
        self.set_flag(FLAG_READONLY, true).await
    }

    async fn disable(&self) -> Result<()> {
        self.set_flag(FLAG_READONLY, false).await
    }
}

#[async_trait]
impl CancelFlag for PgSite {
    async fn is_requested(&self) -> Result<bool> {
        self.flag(FLAG_RESTORE_CANCEL).await
    }

    async fn request(&self) -> Result<()> {
        self.set_flag(FLAG_RESTORE_CANCEL, true).await
    }

    async fn clear(&self) -> Result<()> {
        self.set_flag(FLAG_RESTORE_CANCEL, false).await
    }
}

#[async_trait]
impl Notifier for PgSite {
    async fn notify(&self, notification: &RestoreNotification) -> Result<()> {
        let data = json!({
            "filename": notification.filename,
            "success": notification.success,
            "logs": notification.transcript,
        });
        sqlx::query(
            "INSERT INTO public.notifications (user_id, notification_type, data, created_at) \
             VALUES ($1, $2, $3, now())",
        )
        .bind(notification.user_id)
        .bind(notification.kind())
        .bind(data)
        .execute(&self.pool().await)
        .await?;
        Ok(())
    }
}

/// `LIKE` pattern matching any value containing `needle` literally.
pub fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// psql invocation that loads `dump_path` in one transaction.
///
/// The password travels in `PGPASSWORD` so it never shows up in the
/// logged command line.
pub fn psql_command(
    database_url: &str,
    dump_path: &Path,
    strategy: RestoreStrategy,
    failure_marker: &str,
) -> Result<CommandSpec> {
    let url = Url::parse(database_url)?;
    let database = url.path().trim_start_matches('/');
    if database.is_empty() {
        return Err(RestoreError::Config(format!(
            "database name not found in URL for host {}",
            url.host_str().unwrap_or("unknown_host")
        )));
    }

    let mut args = vec![
        "--no-psqlrc".to_string(),
        "--single-transaction".to_string(),
        "--dbname".to_string(),
        decode(database),
    ];
    if let Some(host) = url.host_str() {
        args.push("--host".to_string());
        args.push(host.trim_start_matches('[').trim_end_matches(']').to_string());
    }
    if let Some(port) = url.port() {
        args.push("--port".to_string());
        args.push(port.to_string());
    }
    if !url.username().is_empty() {
        args.push("--username".to_string());
        args.push(decode(url.username()));
    }

    let mut spec = CommandSpec::new("psql", args)
        .stdin(StdinSource::DumpFile {
            path: dump_path.to_path_buf(),
            rewrite_for_shadow: strategy == RestoreStrategy::ShadowSchema,
        })
        .failure_marker(failure_marker)
        .describe(format!("psql restore ({})", strategy));
    if let Some(password) = url.password() {
        spec = spec.env("PGPASSWORD", decode(password));
    }
    Ok(spec)
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}
