//! Backups of key files that are about to be replaced or retired.
//!
//! Files are moved (not copied) into `<root>/backup/<YYYYMMDD-HHMMSS>/`.
//! Retention is an explicit policy; pruning removes whole backup
//! directories, oldest first, and never touches live key files.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{KeyError, Result};

/// Name of the backup directory under the key directory.
pub const BACKUP_DIR: &str = "backup";

/// How many backup directories to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupRetention {
    /// Never prune.
    #[default]
    KeepAll,
    /// Keep the newest `n` backup directories.
    KeepLatest(usize),
}

/// Moves key files into dated backup directories.
#[derive(Debug, Clone)]
pub struct KeyBackup {
    root: PathBuf,
    retention: BackupRetention,
}

impl KeyBackup {
    /// Back up into `<key_dir>/backup`.
    pub fn new(key_dir: &Path, retention: BackupRetention) -> Self {
        Self {
            root: key_dir.join(BACKUP_DIR),
            retention,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move every existing file in `files` into a fresh backup directory,
    /// then apply the retention policy.
    ///
    /// Returns the backup directory, or `None` when none of the files
    /// existed.
    pub fn backup_files(&self, files: &[PathBuf]) -> Result<Option<PathBuf>> {
        let existing: Vec<&PathBuf> = files.iter().filter(|p| p.is_file()).collect();
        if existing.is_empty() {
            return Ok(None);
        }

        let target = self.fresh_dir(OffsetDateTime::now_utc())?;
        for file in existing {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = target.join(name);
            fs::rename(file, &dest).map_err(|e| KeyError::io(file, e))?;
        }

        info!(path = %target.display(), "backed up key files");
        self.prune()?;
        Ok(Some(target))
    }

    /// Move every file of `backup_dir` back into the key directory,
    /// replacing live files of the same name, and remove the emptied
    /// backup directory. Returns the restored paths.
    pub fn restore(&self, backup_dir: &Path) -> Result<Vec<PathBuf>> {
        let key_dir = self.root.parent().unwrap_or(Path::new("."));
        let entries = fs::read_dir(backup_dir).map_err(|e| KeyError::io(backup_dir, e))?;

        let mut restored = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KeyError::io(backup_dir, e))?;
            let from = entry.path();
            if !from.is_file() {
                continue;
            }
            let to = key_dir.join(entry.file_name());
            fs::rename(&from, &to).map_err(|e| KeyError::io(&from, e))?;
            restored.push(to);
        }
        fs::remove_dir(backup_dir).map_err(|e| KeyError::io(backup_dir, e))?;

        restored.sort();
        info!(path = %backup_dir.display(), files = restored.len(), "restored key files");
        Ok(restored)
    }

    /// Delete the oldest backup directories beyond the retention limit.
    pub fn prune(&self) -> Result<Vec<PathBuf>> {
        let BackupRetention::KeepLatest(keep) = self.retention else {
            return Ok(Vec::new());
        };

        let mut dirs = self.backup_dirs()?;
        if dirs.len() <= keep {
            return Ok(Vec::new());
        }

        let excess = dirs.len() - keep;
        let removed: Vec<PathBuf> = dirs.drain(..excess).collect();
        for dir in &removed {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(path = %dir.display(), error = %e, "failed to prune key backup");
                return Err(KeyError::io(dir, e));
            }
        }
        Ok(removed)
    }

    /// Backup directories, oldest first.
    pub fn backup_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KeyError::io(&self.root, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KeyError::io(&self.root, e))?;
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        // Timestamp names sort chronologically; same-second suffixes sort
        // after their base name.
        dirs.sort();
        Ok(dirs)
    }

    fn fresh_dir(&self, now: OffsetDateTime) -> Result<PathBuf> {
        let stamp = format!(
            "{:04}{:02}{:02}-{:02}{:02}{:02}",
            now.year(),
            u8::from(now.month()),
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        );

        // Same-second backups get a suffix above every one already taken,
        // even if older ones were pruned, so names stay in creation order.
        let last_suffix = self
            .backup_dirs()?
            .iter()
            .filter_map(|dir| dir.file_name()?.to_str().map(str::to_owned))
            .filter_map(|name| match name.strip_prefix(&stamp)? {
                "" => Some(0),
                rest => rest.strip_prefix('-')?.parse::<u32>().ok(),
            })
            .max();
        let candidate = match last_suffix {
            None => self.root.join(&stamp),
            Some(n) => self.root.join(format!("{stamp}-{:03}", n + 1)),
        };

        fs::create_dir_all(&candidate).map_err(|e| KeyError::io(&candidate, e))?;
        Ok(candidate)
    }
}
