// Connection preflight run before the restore starts
use postgres::{Client, NoTls};
use tracing::{error, info};

pub fn check_db_connection(db_url: &str) -> bool {
    match Client::connect(db_url, NoTls) {
        Ok(_) => {
            info!("Successfully connected to the target database");
            true
        }
        Err(e) => {
            error!("Failed to connect to the target database: {}", e);
            false
        }
    }
}

/// Runs [`check_db_connection`] off the async runtime; the postgres client is blocking.
pub async fn check_db_connection_async(db_url: &str) -> bool {
    let url = db_url.to_string();
    tokio::task::spawn_blocking(move || check_db_connection(&url))
        .await
        .unwrap_or(false)
}
