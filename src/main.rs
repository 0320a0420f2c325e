//! Site Restore Tool
//!
//! Provides CLI interface for restoring a site backup and for inspecting,
//! cancelling or undoing a restore.

// restoretool/src/main.rs
mod config;
mod errors;
mod restore;
mod storage;
mod utils;

use anyhow::{Context, Result};
use config::AppConfig;
use restore::{LogEvent, RestoreRequest};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run_app().await {
        Ok(true) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("❌ Operation failed. See the log above for details.");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<bool> {
    // RESTORE_CONFIG overrides the default config.json in the working directory.
    let config_path = env::var("RESTORE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().skip(1).collect();
    let choice = match args.first() {
        Some(choice) => choice.trim().to_string(),
        None => prompt_choice()?,
    };

    match choice.as_str() {
        "1" | "restore" => {
            let request = if args.is_empty() {
                prompt_restore_request()?
            } else {
                parse_restore_args(&args[1..])?
            };
            println!("🔄 Starting Restore Process...");
            println!("Archive: {}", request.archive_filename);
            run_restore(&app_config, request).await
        }
        "2" | "status" => {
            restore::print_status(&app_config).await?;
            Ok(true)
        }
        "3" | "cancel" => {
            restore::request_cancel(&app_config).await?;
            Ok(true)
        }
        "4" | "rollback" => {
            println!("↩️ Rolling back to the backup schema...");
            let rolled_back = restore::run_manual_rollback(&app_config).await?;
            if !rolled_back {
                println!("No backup schema found; nothing was changed.");
            }
            Ok(rolled_back)
        }
        _ => {
            println!(
                "❌ Invalid choice. Please enter '1' (restore), '2' (status), '3' (cancel), or '4' (rollback)."
            );
            anyhow::bail!("Invalid operation choice");
        }
    }
}

async fn run_restore(app_config: &AppConfig, request: RestoreRequest) -> Result<bool> {
    let (sender, mut receiver) = broadcast::channel::<LogEvent>(1024);
    let session = request.client_session_id.clone();

    // Live view of the transcript for the requesting session.
    let printer = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) if event.session_id == session => println!("{}", event.line.render()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("⚠️ {} log lines were skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = restore::run_restore_flow(app_config, request, Some(sender))
        .await
        .context("Restore process failed")?;
    let _ = printer.await;

    if let Some(error) = &outcome.error {
        eprintln!(
            "❌ Restore failed during {}: {}",
            outcome
                .failed_step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "INIT".to_string()),
            error
        );
        if outcome.db_was_changed && !outcome.rolled_back {
            eprintln!("⚠️ The database was changed and could not be rolled back automatically.");
        }
    }
    Ok(outcome.success)
}

/// Parses `<user_id> <filename> [--disable-emails] [--session <id>]`.
fn parse_restore_args(args: &[String]) -> Result<RestoreRequest> {
    let mut positional = Vec::new();
    let mut disable_emails = false;
    let mut client_session_id = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--disable-emails" => disable_emails = true,
            "--session" => {
                client_session_id = Some(
                    iter.next()
                        .context("--session requires a value")?
                        .clone(),
                );
            }
            other => positional.push(other.to_string()),
        }
    }

    let user_id = positional
        .first()
        .context("Usage: restore <user_id> <filename> [--disable-emails] [--session <id>]")?;
    let requesting_user_id = user_id
        .parse::<i64>()
        .with_context(|| format!("Invalid user id '{}'", user_id))?;

    Ok(RestoreRequest {
        requesting_user_id,
        archive_filename: positional.get(1).cloned().unwrap_or_default(),
        client_session_id,
        disable_emails,
    })
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    println!("Select an operation:");
    println!("1. Restore Backup (or type 'restore')");
    println!("2. Show Status (or type 'status')");
    println!("3. Cancel Running Restore (or type 'cancel')");
    println!("4. Roll Back Last Restore (or type 'rollback')");
    read_input("Enter your choice: ")
}

fn prompt_restore_request() -> Result<RestoreRequest> {
    let user_id = read_input("Requesting user id: ")?;
    let filename = read_input("Backup filename: ")?;
    let disable_emails = read_input("Disable emails for non-staff users? [y/N]: ")?;

    let mut args = vec![user_id, filename];
    if disable_emails.eq_ignore_ascii_case("y") {
        args.push("--disable-emails".to_string());
    }
    parse_restore_args(&args)
}

fn read_input(prompt: &str) -> Result<String> {
    use std::io::{Write, stdin, stdout};

    print!("{}", prompt);
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_restore_args() -> Result<()> {
        let request = parse_restore_args(&args(&[
            "7",
            "site-2024-01-01.tar.gz",
            "--session",
            "abc",
            "--disable-emails",
        ]))?;
        assert_eq!(request.requesting_user_id, 7);
        assert_eq!(request.archive_filename, "site-2024-01-01.tar.gz");
        assert_eq!(request.client_session_id.as_deref(), Some("abc"));
        assert!(request.disable_emails);
        Ok(())
    }

    #[test]
    fn test_parse_restore_args_leaves_filename_check_to_the_restore() -> Result<()> {
        let request = parse_restore_args(&args(&["7"]))?;
        assert_eq!(request.archive_filename, "");
        assert!(parse_restore_args(&args(&["seven", "x.tar.gz"])).is_err());
        assert!(parse_restore_args(&args(&["7", "x.tar.gz", "--session"])).is_err());
        Ok(())
    }
}
