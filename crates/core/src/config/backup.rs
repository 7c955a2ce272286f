use chrono::{Local, NaiveDateTime};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::{write_atomic, ConfigError, GlobalConfig};

pub const BACKUP_MARKER: &str = ".backup_";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub size: u64,
    pub taken_at: Option<NaiveDateTime>,
    sequence: u32,
}

fn backup_prefix(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| format!("{}{BACKUP_MARKER}", name.to_string_lossy()))
}

/// Splits `20240102_030405` or `20240102_030405_2` into stamp and sequence.
fn parse_suffix(suffix: &str) -> Option<(NaiveDateTime, u32)> {
    let stamp_len = "YYYYmmdd_HHMMSS".len();
    let stamp = suffix.get(..stamp_len)?;
    let taken_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let sequence = match suffix.get(stamp_len..)? {
        "" => 0,
        rest => rest.strip_prefix('_')?.parse().ok()?,
    };
    Some((taken_at, sequence))
}

/// Copies `path` to `<file>.backup_<YYYYmmdd_HHMMSS>` next to it. Copies
/// taken within the same second get a `_<n>` suffix.
pub fn backup_config(path: &Path) -> Result<PathBuf, ConfigError> {
    let prefix = backup_prefix(path).ok_or_else(|| ConfigError::BackupNotFound(path.into()))?;
    let stamp = Local::now().format(STAMP_FORMAT).to_string();

    let mut candidate = path.with_file_name(format!("{prefix}{stamp}"));
    let mut sequence = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{prefix}{stamp}_{sequence}"));
        sequence += 1;
    }

    fs::copy(path, &candidate).map_err(|source| ConfigError::io(path, source))?;
    info!("configuration backed up to {}", candidate.display());
    Ok(candidate)
}

/// Backups of `path`, newest first.
pub fn list_backups(path: &Path) -> Vec<BackupEntry> {
    let Some(prefix) = backup_prefix(path) else {
        return Vec::new();
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("cannot list backups in {}: {err}", dir.display());
            return Vec::new();
        }
    };

    let mut backups: Vec<BackupEntry> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let suffix = name.strip_prefix(&prefix)?;
            let parsed = parse_suffix(suffix);
            let metadata = entry.metadata().ok().filter(|meta| meta.is_file())?;
            Some(BackupEntry {
                path: entry.path(),
                size: metadata.len(),
                taken_at: parsed.map(|(taken_at, _)| taken_at),
                sequence: parsed.map(|(_, sequence)| sequence).unwrap_or_default(),
            })
        })
        .collect();

    backups.sort_by(|a, b| {
        b.taken_at
            .cmp(&a.taken_at)
            .then_with(|| b.sequence.cmp(&a.sequence))
            .then_with(|| a.path.cmp(&b.path))
    });
    backups
}

/// Replaces `target` with the contents of `backup`.
///
/// The backup must parse as a configuration. The current `target`, if any,
/// is itself backed up first; that copy's path is returned.
pub fn restore_backup(backup: &Path, target: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if !backup.is_file() {
        return Err(ConfigError::BackupNotFound(backup.to_path_buf()));
    }
    GlobalConfig::from_path(backup)?;

    let safety = if target.exists() {
        Some(backup_config(target)?)
    } else {
        None
    };

    let contents = fs::read(backup).map_err(|source| ConfigError::io(backup, source))?;
    write_atomic(target, &contents)?;
    info!(
        "configuration restored from {} into {}",
        backup.display(),
        target.display()
    );
    Ok(safety)
}
