use thiserror::Error;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Restore is disabled. Set `allow_restore` to true in config.json to enable it.")]
    RestoreDisabled,

    #[error("Another operation is already running: {0}")]
    OperationRunning(String),

    #[error("User {0} does not exist")]
    UserNotFound(i64),

    #[error("No backup filename was given")]
    FilenameMissing,

    #[error("Invalid backup filename: {0}")]
    InvalidFilename(String),

    #[error("Failed to download backup '{filename}': {message}")]
    Download { filename: String, message: String },

    #[error("Failed to extract '{entry}' from the archive: {message}")]
    Extraction { entry: String, message: String },

    #[error("No metadata found in the archive and no version token in filename '{0}'")]
    MissingMetadata(String),

    #[error(
        "Cannot restore a backup made on a newer schema (backup: {backup}, installed: {installed})"
    )]
    IncompatibleVersion { backup: i64, installed: i64 },

    #[error("{program} exited with {status}. Last output: {last_line}")]
    Command {
        program: String,
        status: String,
        last_line: String,
    },

    #[error("{program} reported an error: {line}")]
    FailureMarker { program: String, line: String },

    #[error("Background jobs did not finish running after {retries} checks")]
    DrainTimeout { retries: u32 },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Schema swap failed: {0}")]
    SchemaSwap(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl RestoreError {
    /// Errors raised before anything outside the temp directory was touched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RestoreError::RestoreDisabled
                | RestoreError::OperationRunning(_)
                | RestoreError::UserNotFound(_)
                | RestoreError::FilenameMissing
                | RestoreError::InvalidFilename(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;
