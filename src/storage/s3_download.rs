// restoretool/src/storage/s3_download.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt; // For write_all
use tracing::info;

use super::{validate_archive_filename, ArchiveStore};
use crate::config::SpacesConfig;
use crate::errors::{RestoreError, Result};

/// Archives kept in an S3-compatible bucket, addressed as `<folder_prefix>/<filename>`.
pub struct S3ArchiveStore {
    spaces_config: SpacesConfig,
}

impl S3ArchiveStore {
    pub fn new(spaces_config: SpacesConfig) -> Self {
        Self { spaces_config }
    }

    fn object_key(&self, filename: &str) -> String {
        object_key(self.spaces_config.folder_prefix.as_deref(), filename)
    }
}

pub fn object_key(folder_prefix: Option<&str>, filename: &str) -> String {
    match folder_prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, filename),
        None => filename.to_string(),
    }
}

#[async_trait]
impl ArchiveStore for S3ArchiveStore {
    async fn download(&self, filename: &str, destination_path: &Path) -> Result<()> {
        validate_archive_filename(filename)?;
        let s3_bucket = &self.spaces_config.bucket_name;
        let s3_key = self.object_key(filename);
        let download_error = |message: String| RestoreError::Download {
            filename: filename.to_string(),
            message,
        };

        info!(
            "Attempting to download s3://{}/{} to {}",
            s3_bucket,
            s3_key,
            destination_path.display()
        );

        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&self.spaces_config.endpoint_url)
            .region(Region::new(self.spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &self.spaces_config.access_key_id,
                &self.spaces_config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let client = s3::Client::new(&sdk_config);

        let mut object = client
            .get_object()
            .bucket(s3_bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| download_error(format!("get_object s3://{}/{}: {}", s3_bucket, s3_key, e)))?;

        let mut output_file = File::create(destination_path).await?;

        let mut total_bytes_downloaded = 0;
        while let Some(bytes_chunk) = object
            .body
            .try_next()
            .await
            .map_err(|e| download_error(format!("reading object body: {}", e)))?
        {
            output_file.write_all(&bytes_chunk).await?;
            total_bytes_downloaded += bytes_chunk.len();
        }
        output_file.flush().await?;

        info!(
            "Downloaded {} bytes from s3://{}/{} to {}",
            total_bytes_downloaded,
            s3_bucket,
            s3_key,
            destination_path.display()
        );
        Ok(())
    }
}
