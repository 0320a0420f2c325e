// restoretool/src/restore/uploads.rs
//! Restored uploads: where they came from, where they go, and which URLs
//! in the restored content need to point somewhere else afterwards.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::metadata::BackupMetadata;
use super::process::CommandSpec;
use crate::config::SiteUrls;
use crate::errors::{RestoreError, Result};

const DERIVED_IMAGES_DIR: &str = "optimized";

/// What the extracted uploads subtree contains.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadsPlan {
    /// `<tmp>/uploads/<previous tenant>`
    pub source_dir: PathBuf,
    pub previous_tenant: String,
    pub derived_images_present: bool,
}

impl UploadsPlan {
    /// Inspects `<tmp>/uploads`. The previous tenant label comes from the
    /// metadata, or else from the single directory the archive put there.
    pub fn inspect(uploads_root: &Path, metadata: &BackupMetadata) -> Result<Self> {
        let previous_tenant = match &metadata.tenant {
            Some(tenant) if uploads_root.join(tenant).is_dir() => tenant.clone(),
            _ => detect_tenant_dir(uploads_root)?,
        };
        let source_dir = uploads_root.join(&previous_tenant);
        Ok(Self {
            derived_images_present: source_dir.join(DERIVED_IMAGES_DIR).is_dir(),
            source_dir,
            previous_tenant,
        })
    }

    /// rsync that merges into the live directory and keeps newer local files.
    pub fn merge_command(&self, uploads_dir: &Path, current_tenant: &str) -> CommandSpec {
        let source = format!("{}/", self.source_dir.display());
        let dest = format!("{}/", uploads_dir.join(current_tenant).display());
        CommandSpec::new(
            "rsync",
            vec![
                "-avp".to_string(),
                "--safe-links".to_string(),
                "--update".to_string(),
                source,
                dest,
            ],
        )
        .describe("merge uploads")
    }
}

fn detect_tenant_dir(uploads_root: &Path) -> Result<String> {
    WalkDir::new(uploads_root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .ok_or_else(|| RestoreError::Extraction {
            entry: uploads_root.display().to_string(),
            message: "the uploads directory does not contain a tenant directory".into(),
        })
}

/// Old → new replacements for restored content, longest source first so a
/// URL is never half-rewritten by a shorter prefix of itself.
pub fn remap_pairs(
    metadata: &BackupMetadata,
    site: &SiteUrls,
    previous_tenant: Option<&str>,
    current_tenant: &str,
) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    let mut push = |from: Option<&String>, to: Option<&String>| {
        if let (Some(from), Some(to)) = (from, to) {
            if from != to && !pairs.iter().any(|(f, _)| f == from) {
                pairs.push((from.clone(), to.clone()));
            }
        }
    };

    push(metadata.base_url.as_ref(), Some(&site.base_url));
    push(
        metadata.cdn_url.as_ref(),
        site.cdn_url.as_ref().or(Some(&site.base_url)),
    );
    push(metadata.s3_base_url.as_ref(), site.object_storage_base_url.as_ref());
    push(
        metadata.s3_cdn_url.as_ref(),
        site.object_storage_cdn_url
            .as_ref()
            .or(site.object_storage_base_url.as_ref()),
    );

    if let Some(previous) = previous_tenant {
        if previous != current_tenant {
            push(
                Some(&format!("/uploads/{}/", previous)),
                Some(&format!("/uploads/{}/", current_tenant)),
            );
        }
    }

    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
    pairs
}
