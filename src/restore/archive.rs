// restoretool/src/restore/archive.rs
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::info;

use super::process::CommandSpec;
use crate::errors::{RestoreError, Result};

pub const METADATA_ENTRY: &str = "meta.json";
pub const DUMP_ENTRIES: [&str; 2] = ["dump.sql.gz", "dump.sql"];
pub const UPLOADS_ENTRY: &str = "uploads";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    /// Legacy backups that are nothing but a (compressed) dump.
    SqlGz,
    Sql,
}

impl ArchiveKind {
    pub fn from_filename(filename: &str) -> Result<Self> {
        let kind = if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if filename.ends_with(".tar") {
            ArchiveKind::Tar
        } else if filename.ends_with(".sql.gz") {
            ArchiveKind::SqlGz
        } else if filename.ends_with(".sql") {
            ArchiveKind::Sql
        } else {
            return Err(RestoreError::InvalidFilename(format!(
                "{} (expected .tar.gz, .tar, .sql.gz or .sql)",
                filename
            )));
        };
        Ok(kind)
    }

    pub fn is_tar(&self) -> bool {
        matches!(self, ArchiveKind::TarGz | ArchiveKind::Tar)
    }
}

/// On-disk artifacts of one run, all inside a per-run temp directory.
#[derive(Debug)]
pub struct BackupArchive {
    pub tmp_dir: PathBuf,
    pub filename: String,
    pub kind: ArchiveKind,
    pub archive_path: PathBuf,
    pub tar_path: Option<PathBuf>,
    pub dump_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub uploads_path: Option<PathBuf>,
    entries: Vec<String>,
}

impl BackupArchive {
    /// Creates `<tmp_root>/<tenant>/<timestamp>` for the run.
    pub fn create(tmp_root: &Path, tenant: &str, filename: &str, now: DateTime<Utc>) -> Result<Self> {
        let kind = ArchiveKind::from_filename(filename)?;
        let tmp_dir = tmp_root
            .join(tenant)
            .join(now.format("%Y-%m-%d-%H%M%S%3f").to_string());
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            archive_path: tmp_dir.join(filename),
            tmp_dir,
            filename: filename.to_string(),
            kind,
            tar_path: None,
            dump_path: None,
            metadata_path: None,
            uploads_path: None,
            entries: Vec::new(),
        })
    }

    /// Turns the downloaded file into a plain tar (or a dump for dump-only backups).
    pub async fn decompress(&mut self) -> Result<()> {
        match self.kind {
            ArchiveKind::TarGz => {
                let source = self.archive_path.clone();
                let tar_path = self.tmp_dir.join(tar_name(&self.filename));
                let target = tar_path.clone();
                let bytes = tokio::task::spawn_blocking(move || gunzip(&source, &target))
                    .await
                    .map_err(|e| RestoreError::Extraction {
                        entry: "archive".into(),
                        message: e.to_string(),
                    })??;
                info!("Decompressed {} bytes into {}", bytes, tar_path.display());
                self.tar_path = Some(tar_path);
            }
            ArchiveKind::Tar => self.tar_path = Some(self.archive_path.clone()),
            ArchiveKind::SqlGz | ArchiveKind::Sql => {
                self.dump_path = Some(self.archive_path.clone());
            }
        }
        Ok(())
    }

    /// Reads the table of contents of the tar without extracting anything.
    pub fn list_entries(&mut self) -> Result<&[String]> {
        let Some(tar_path) = &self.tar_path else {
            return Ok(&self.entries);
        };
        let mut archive = tar::Archive::new(File::open(tar_path)?);
        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            entries.push(entry.path()?.to_string_lossy().into_owned());
        }
        self.entries = entries;
        Ok(&self.entries)
    }

    /// Name of `name` as stored in the tar (which may carry a `./` prefix).
    pub fn find_entry(&self, name: &str) -> Option<String> {
        self.entries.iter().find_map(|raw| {
            let normalized = raw.trim_start_matches("./").trim_end_matches('/');
            if normalized == name {
                Some(raw.trim_end_matches('/').to_string())
            } else if normalized.starts_with(&format!("{}/", name)) {
                let prefix_len = raw.len() - normalized.len();
                Some(format!("{}{}", &raw[..prefix_len], name))
            } else {
                None
            }
        })
    }

    pub fn find_dump_entry(&self) -> Option<String> {
        DUMP_ENTRIES.iter().find_map(|name| self.find_entry(name))
    }

    /// `tar --extract` for exactly one entry (or subtree) into the temp directory.
    pub fn extract_command(&self, entry: &str, keep_newer_files: bool) -> Result<CommandSpec> {
        let tar_path = self.tar_path.as_ref().ok_or_else(|| RestoreError::Extraction {
            entry: entry.to_string(),
            message: "archive has not been decompressed".into(),
        })?;
        let mut args = vec![
            "--extract".to_string(),
            "--file".to_string(),
            tar_path.to_string_lossy().into_owned(),
            "--directory".to_string(),
            self.tmp_dir.to_string_lossy().into_owned(),
        ];
        if keep_newer_files {
            args.push("--keep-newer-files".to_string());
        }
        args.push(entry.to_string());
        Ok(CommandSpec::new("tar", args).describe(format!("extracting '{}'", entry)))
    }

    /// Path an entry lands on after extraction.
    pub fn extracted_path(&self, entry: &str) -> PathBuf {
        self.tmp_dir.join(entry.trim_start_matches("./"))
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.tmp_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn tar_name(filename: &str) -> String {
    filename
        .strip_suffix(".gz")
        .map(str::to_string)
        .or_else(|| filename.strip_suffix(".tgz").map(|s| format!("{}.tar", s)))
        .unwrap_or_else(|| format!("{}.tar", filename))
}

fn gunzip(source: &Path, target: &Path) -> Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(source)?));
    let mut output = File::create(target)?;
    std::io::copy(&mut decoder, &mut output).map_err(|e| RestoreError::Extraction {
        entry: source.display().to_string(),
        message: format!("failed to decompress: {}", e),
    })
}

/// Opens a dump for reading, transparently decompressing gzip content.
pub fn open_dump(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    let file = File::open(path)?;
    if read == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(BufReader::new(GzDecoder::new(BufReader::new(file)))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}
