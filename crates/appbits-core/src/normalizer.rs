use std::{os::unix::fs::PermissionsExt as _, path::Path};

use crate::{
    archive_tool::{ArchiveEntry, ArchiveTool, EntrySelection},
    error::{IoContext as _, PackagingError},
};

/// Number of entry names passed to each delete invocation, keeping the
/// command line well under the OS argument length limit.
pub const DEFAULT_DIRECTORY_DELETE_BATCH_SIZE: usize = 10;

const DIRECTORY_MODE: u32 = 0o755;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeSummary {
    pub removed_directories: usize,
    pub delete_batches: usize,
    pub restored_directories: usize,
}

/// Strip explicit directory entries from an archive. Archives built on other
/// platforms often record directories without the directory attribute or
/// execute bit, which breaks extraction on Linux. Files keep their full
/// paths, so their parent directories are still created implicitly.
///
/// Directories with nothing left beneath them would otherwise disappear, so
/// they are added back with `drwxr-xr-x` permissions.
#[tracing::instrument(skip(tool))]
pub async fn normalize(
    tool: &dyn ArchiveTool,
    archive: &Path,
    batch_size: usize,
) -> Result<NormalizeSummary, PackagingError> {
    let batch_size = batch_size.max(1);
    let entries = tool.list_entries(archive).await?;

    let directories = entries
        .iter()
        .filter(|entry| entry.is_directory_like())
        .map(|entry| entry.name.clone())
        .collect::<Vec<_>>();
    if directories.is_empty() {
        return Ok(NormalizeSummary::default());
    }

    let mut summary = NormalizeSummary {
        removed_directories: directories.len(),
        ..Default::default()
    };
    for batch in directories.chunks(batch_size) {
        tool.delete_entries(archive, batch).await?;
        summary.delete_batches += 1;
    }

    let restored = directories_to_restore(&entries);
    if !restored.is_empty() {
        restore_directories(tool, archive, &restored).await?;
        summary.restored_directories = restored.len();
    }

    tracing::debug!(?summary, "normalized directory entries");
    Ok(summary)
}

/// Directory entries that have no file, symlink, or other directory entry
/// beneath them.
fn directories_to_restore(entries: &[ArchiveEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| entry.is_directory_like())
        .filter(|directory| {
            !entries.iter().any(|entry| {
                entry.name != directory.name && entry.name.starts_with(&directory.name)
            })
        })
        .map(|directory| directory.name.clone())
        .collect()
}

async fn restore_directories(
    tool: &dyn ArchiveTool,
    archive: &Path,
    directories: &[String],
) -> Result<(), PackagingError> {
    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix("restored_dirs")
        .tempdir_in(parent)
        .io_context(|| "failed to create staging directory")?;

    for directory in directories {
        let path = staging.path().join(directory.trim_end_matches('/'));
        tokio::fs::create_dir_all(&path)
            .await
            .io_context(|| "failed to create staging directory")?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
            .await
            .io_context(|| "failed to set directory permissions")?;
    }

    tool.add_entries(archive, staging.path(), EntrySelection::Named(directories))
        .await?;

    Ok(())
}
