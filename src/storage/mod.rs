pub(crate) mod s3_download;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{AppConfig, ArchiveSource};
use crate::errors::{RestoreError, Result};

/// Fetches a backup archive by name into a local path.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn download(&self, filename: &str, destination_path: &Path) -> Result<()>;
}

/// Factory to create the archive store from the application config
pub fn get_archive_store(app_config: &AppConfig) -> Box<dyn ArchiveStore> {
    match &app_config.archive_source {
        ArchiveSource::Local(dir) => Box::new(LocalArchiveStore::new(dir.clone())),
        ArchiveSource::Spaces(spaces) => Box::new(s3_download::S3ArchiveStore::new(spaces.clone())),
    }
}

/// Rejects names that could escape the backup directory or the temp directory.
pub fn validate_archive_filename(filename: &str) -> Result<()> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(RestoreError::FilenameMissing);
    }
    if trimmed != filename
        || filename.contains('/')
        || filename.contains('\\')
        || filename.starts_with('.')
        || filename.contains("..")
    {
        return Err(RestoreError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}

/// Archives kept in a directory on the local filesystem.
pub struct LocalArchiveStore {
    dir: PathBuf,
}

impl LocalArchiveStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl ArchiveStore for LocalArchiveStore {
    async fn download(&self, filename: &str, destination_path: &Path) -> Result<()> {
        validate_archive_filename(filename)?;
        let source = self.dir.join(filename);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(RestoreError::Download {
                filename: filename.to_string(),
                message: format!("{} does not exist", source.display()),
            });
        }
        let bytes = tokio::fs::copy(&source, destination_path)
            .await
            .map_err(|e| RestoreError::Download {
                filename: filename.to_string(),
                message: e.to_string(),
            })?;
        info!(
            "Copied {} bytes from {} to {}",
            bytes,
            source.display(),
            destination_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_archive_filename() {
        assert!(validate_archive_filename("site-2024-01-01-000000-v20231201000000.tar.gz").is_ok());
        assert!(matches!(
            validate_archive_filename(""),
            Err(RestoreError::FilenameMissing)
        ));
        assert!(matches!(
            validate_archive_filename("   "),
            Err(RestoreError::FilenameMissing)
        ));
        for bad in ["../secrets.tar.gz", "dir/file.tar.gz", ".hidden.tar.gz", "a\\b.tar"] {
            assert!(
                matches!(validate_archive_filename(bad), Err(RestoreError::InvalidFilename(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_local_store_copies_archive() -> anyhow::Result<()> {
        let store_dir = tempfile::tempdir()?;
        let dest_dir = tempfile::tempdir()?;
        std::fs::write(store_dir.path().join("backup.tar.gz"), b"archive-bytes")?;

        let store = LocalArchiveStore::new(store_dir.path().to_path_buf());
        let dest = dest_dir.path().join("backup.tar.gz");
        store.download("backup.tar.gz", &dest).await?;

        assert_eq!(std::fs::read(&dest)?, b"archive-bytes");
        Ok(())
    }

    #[tokio::test]
    async fn test_local_store_missing_archive() -> anyhow::Result<()> {
        let store_dir = tempfile::tempdir()?;
        let store = LocalArchiveStore::new(store_dir.path().to_path_buf());
        let result = store
            .download("missing.tar.gz", &store_dir.path().join("out"))
            .await;
        assert!(matches!(result, Err(RestoreError::Download { .. })));
        Ok(())
    }
}
