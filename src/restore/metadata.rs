// restoretool/src/restore/metadata.rs
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::LazyLock;

use crate::errors::{RestoreError, Result};

/// `-v<14 digit migration timestamp>` somewhere in the archive name.
static FILENAME_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-v(\d{14})(?:\D|$)").expect("valid filename version regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    #[serde(rename = "version", deserialize_with = "int_or_string")]
    pub schema_version: i64,
    #[serde(default)]
    pub multisite: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub cdn_url: Option<String>,
    #[serde(default)]
    pub s3_base_url: Option<String>,
    #[serde(default)]
    pub s3_cdn_url: Option<String>,
    #[serde(default, alias = "db_name")]
    pub tenant: Option<String>,
}

fn int_or_string<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Int(i64),
        Text(String),
    }

    match Version::deserialize(deserializer)? {
        Version::Int(v) => Ok(v),
        Version::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl BackupMetadata {
    pub fn parse(json: &str) -> Result<Self> {
        let metadata: BackupMetadata = serde_json::from_str(json)?;
        Ok(metadata.normalized())
    }

    /// Minimal metadata for archives that carry none, recovered from the filename.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let captures = FILENAME_VERSION.captures(filename)?;
        let schema_version = captures.get(1)?.as_str().parse().ok()?;
        Some(BackupMetadata {
            schema_version,
            multisite: false,
            base_url: None,
            cdn_url: None,
            s3_base_url: None,
            s3_cdn_url: None,
            tenant: None,
        })
    }

    fn normalized(mut self) -> Self {
        for url in [
            &mut self.base_url,
            &mut self.cdn_url,
            &mut self.s3_base_url,
            &mut self.s3_cdn_url,
        ] {
            *url = url
                .take()
                .map(|u| u.trim().trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty());
        }
        self.tenant = self.tenant.take().filter(|t| !t.trim().is_empty());
        self
    }
}

/// Older backups can be migrated forward; newer ones cannot be migrated back.
pub fn validate_version(backup: i64, installed: i64) -> Result<()> {
    if backup > installed {
        return Err(RestoreError::IncompatibleVersion { backup, installed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_metadata() -> anyhow::Result<()> {
        let metadata = BackupMetadata::parse(
            r#"{
                "source": "site",
                "version": 20240101000000,
                "multisite": true,
                "base_url": "https://old.example.com/",
                "cdn_url": "https://cdn.old.example.com",
                "s3_base_url": "//old-bucket.s3.amazonaws.com",
                "s3_cdn_url": "",
                "db_name": "tenant_old"
            }"#,
        )?;

        assert_eq!(metadata.schema_version, 20240101000000);
        assert!(metadata.multisite);
        assert_eq!(metadata.base_url.as_deref(), Some("https://old.example.com"));
        assert_eq!(metadata.s3_base_url.as_deref(), Some("//old-bucket.s3.amazonaws.com"));
        assert_eq!(metadata.s3_cdn_url, None);
        assert_eq!(metadata.tenant.as_deref(), Some("tenant_old"));
        Ok(())
    }

    #[test]
    fn test_parse_version_only_and_string_version() -> anyhow::Result<()> {
        let metadata = BackupMetadata::parse(r#"{"version": "20230101000000"}"#)?;
        assert_eq!(metadata.schema_version, 20230101000000);
        assert!(!metadata.multisite);
        assert_eq!(metadata.base_url, None);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_missing_or_garbage_version() {
        assert!(BackupMetadata::parse(r#"{"base_url": "x"}"#).is_err());
        assert!(BackupMetadata::parse(r#"{"version": "abc"}"#).is_err());
        assert!(BackupMetadata::parse("not json").is_err());
    }

    #[test]
    fn test_version_from_filename() {
        let metadata =
            BackupMetadata::from_filename("site-2024-01-01-033000-v20231201000000.tar.gz")
                .expect("token present");
        assert_eq!(metadata.schema_version, 20231201000000);

        assert!(BackupMetadata::from_filename("site-2024-01-01-033000.tar.gz").is_none());
        assert!(BackupMetadata::from_filename("site-v2023.tar.gz").is_none());
        assert!(BackupMetadata::from_filename("site-v202312010000001.tar.gz").is_none());
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version(20230101000000, 20240101000000).is_ok());
        assert!(validate_version(20240101000000, 20240101000000).is_ok());
        assert!(matches!(
            validate_version(20240101000001, 20240101000000),
            Err(RestoreError::IncompatibleVersion {
                backup: 20240101000001,
                installed: 20240101000000
            })
        ));
    }
}
