//! Retention Rotator
//!
//! Keeps at most `max_backups` artifact pairs in a backup directory by
//! deleting the oldest pairs first. At least one pair always survives.

use crate::backup::artifacts::ArtifactFamily;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info};

/// Rotate every file in `directory`; returns the number of pairs removed
pub async fn rotate(max_backups: u32, directory: &Path) -> Result<usize> {
    rotate_matching(max_backups, directory, |_| true).await
}

/// Rotate only the files of one artifact family in `directory`
pub async fn rotate_family(
    max_backups: u32,
    directory: &Path,
    family: &ArtifactFamily,
) -> Result<usize> {
    rotate_matching(max_backups, directory, |name| family.matches(name)).await
}

async fn rotate_matching<F>(max_backups: u32, directory: &Path, include: F) -> Result<usize>
where
    F: Fn(&str) -> bool,
{
    debug!("(i) Path to check for backups: {:?}", directory);
    debug!("(i) Maximum backups to keep: {}", max_backups);

    let mut files = list_files(directory, include).await?;

    // A lone file means an earlier run left an orphan; an operator has to
    // decide which half of the pair is trustworthy
    if files.len() % 2 != 0 {
        return Err(Error::OrphanedArtifacts {
            path: directory.to_path_buf(),
            count: files.len(),
        });
    }

    let mut pairs = files.len() / 2;
    debug!("(i) Total backups found: {}", pairs);

    // Oldest first, name as a tie-break for identical timestamps
    files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let max = max_backups as usize;
    let mut removed = 0;
    let mut oldest = files.into_iter().map(|(path, _)| path);

    while pairs > max && pairs > 1 {
        let (Some(first), Some(second)) = (oldest.next(), oldest.next()) else {
            break;
        };
        for path in [first, second] {
            info!("> Removing old backup file: {}", path.display());
            fs::remove_file(&path).await.map_err(|e| Error::Rotation {
                path: directory.to_path_buf(),
                reason: format!("unable to remove {:?}: {}", path, e),
            })?;
        }
        pairs -= 1;
        removed += 1;
    }

    Ok(removed)
}

async fn list_files<F>(directory: &Path, include: F) -> Result<Vec<(PathBuf, SystemTime)>>
where
    F: Fn(&str) -> bool,
{
    let mut entries = fs::read_dir(directory).await.map_err(|e| Error::Rotation {
        path: directory.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name();
        if !include(&name.to_string_lossy()) {
            continue;
        }
        files.push((entry.path(), meta.modified()?));
    }
    Ok(files)
}
