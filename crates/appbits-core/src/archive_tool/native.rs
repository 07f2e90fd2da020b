use std::{
    collections::HashSet,
    io::{Read as _, Write as _},
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
};

use super::{ArchiveTool, EntryKind, EntrySelection, read_entries_sync};
use crate::error::{IoContext as _, PackagingError};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

/// Implements every archive operation in-process with the `zip` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeArchiveTool;

#[async_trait::async_trait]
impl ArchiveTool for NativeArchiveTool {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError> {
        let archive = archive.to_owned();
        let destination = destination.to_owned();
        blocking(move || extract_sync(&archive, &destination)).await
    }

    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError> {
        let sources = match selection {
            EntrySelection::All => None,
            EntrySelection::Named(names) => Some(names.to_vec()),
        };
        let archive = archive.to_owned();
        let source_dir = source_dir.to_owned();
        blocking(move || add_entries_sync(&archive, &source_dir, sources.as_deref())).await
    }

    async fn delete_entries(
        &self,
        archive: &Path,
        names: &[String],
    ) -> Result<(), PackagingError> {
        if names.is_empty() {
            return Ok(());
        }

        let archive = archive.to_owned();
        let names = names.iter().cloned().collect::<HashSet<_>>();
        blocking(move || rewrite_without(&archive, &names)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, PackagingError>
where
    F: FnOnce() -> Result<T, PackagingError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|error| PackagingError::Io {
            context: "archive task failed".to_string(),
            source: std::io::Error::other(error),
        })?
}

fn open_archive(archive: &Path) -> Result<zip::ZipArchive<std::fs::File>, PackagingError> {
    let file = std::fs::File::open(archive).map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            PackagingError::ArchiveNotFound {
                path: archive.to_owned(),
            }
        } else {
            PackagingError::Io {
                context: "failed to open archive".to_string(),
                source: error,
            }
        }
    })?;
    let zip = zip::ZipArchive::new(file)?;
    Ok(zip)
}

fn extract_sync(archive: &Path, destination: &Path) -> Result<(), PackagingError> {
    let mut zip = open_archive(archive)?;

    // Directory permissions are applied last, so a read-only directory
    // doesn't stop us from writing its contents
    let mut directory_modes = vec![];

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative_path) = entry.enclosed_name() else {
            return Err(PackagingError::invalid_archive(format!(
                "entry has an unsafe path: {:?}",
                entry.name()
            )));
        };
        let path = destination.join(&relative_path);
        let mode = entry.unix_mode().map(|mode| mode & 0o7777);

        if entry.name().ends_with('/') {
            std::fs::create_dir_all(&path).io_context(|| "failed to create directory")?;
            directory_modes.push((path, mode.unwrap_or(DEFAULT_DIRECTORY_MODE) | 0o700));
            continue;
        }

        if std::fs::symlink_metadata(&path).is_ok() {
            tracing::debug!(path = %relative_path.display(), "not overwriting existing file");
            continue;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).io_context(|| "failed to create directory")?;
        }

        let kind = super::entry_kind(entry.name(), entry.unix_mode());
        match kind {
            EntryKind::Symlink => {
                let mut target = String::new();
                entry
                    .read_to_string(&mut target)
                    .io_context(|| "failed to read symlink target")?;
                std::os::unix::fs::symlink(&target, &path)
                    .io_context(|| "failed to create symlink")?;
            }
            EntryKind::File | EntryKind::Directory => {
                let mut file = std::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .io_context(|| "failed to create file")?;
                std::io::copy(&mut entry, &mut file).io_context(|| "failed to write file")?;
                file.set_permissions(std::fs::Permissions::from_mode(
                    mode.unwrap_or(DEFAULT_FILE_MODE),
                ))
                .io_context(|| "failed to set file permissions")?;
            }
        }
    }

    for (path, mode) in directory_modes.into_iter().rev() {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .io_context(|| "failed to set directory permissions")?;
    }

    Ok(())
}

struct SourceEntry {
    name: String,
    path: PathBuf,
    metadata: std::fs::Metadata,
}

fn collect_sources(
    source_dir: &Path,
    names: Option<&[String]>,
) -> Result<Vec<SourceEntry>, PackagingError> {
    let mut sources = vec![];

    match names {
        None => {
            let walker = walkdir::WalkDir::new(source_dir)
                .min_depth(1)
                .follow_links(false)
                .sort_by_file_name();
            for dir_entry in walker {
                let dir_entry = dir_entry.map_err(|error| PackagingError::Io {
                    context: "failed to walk directory".to_string(),
                    source: error.into(),
                })?;
                let relative = dir_entry
                    .path()
                    .strip_prefix(source_dir)
                    .map_err(|_| PackagingError::invalid_archive("file outside source directory"))?;
                let metadata = std::fs::symlink_metadata(dir_entry.path())
                    .io_context(|| "failed to read file metadata")?;
                sources.push(SourceEntry {
                    name: entry_name(relative, &metadata),
                    path: dir_entry.path().to_owned(),
                    metadata,
                });
            }
        }
        Some(names) => {
            for name in names {
                let relative = Path::new(name.trim_end_matches('/'));
                let path = source_dir.join(relative);
                let metadata =
                    std::fs::symlink_metadata(&path).io_context(|| "failed to read file metadata")?;
                sources.push(SourceEntry {
                    name: entry_name(relative, &metadata),
                    path,
                    metadata,
                });
            }
        }
    }

    Ok(sources)
}

fn entry_name(relative: &Path, metadata: &std::fs::Metadata) -> String {
    let name = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if metadata.is_dir() {
        format!("{name}/")
    } else {
        name
    }
}

fn add_entries_sync(
    archive: &Path,
    source_dir: &Path,
    names: Option<&[String]>,
) -> Result<(), PackagingError> {
    let sources = collect_sources(source_dir, names)?;
    if sources.is_empty() {
        return Ok(());
    }

    let existing = read_entries_sync(archive)?
        .into_iter()
        .map(|entry| entry.name)
        .collect::<HashSet<_>>();

    // Files and symlinks replace existing entries of the same name, but
    // existing directory entries are kept as-is
    let replaced = sources
        .iter()
        .filter(|source| !source.metadata.is_dir() && existing.contains(&source.name))
        .map(|source| source.name.clone())
        .collect::<HashSet<_>>();
    if !replaced.is_empty() {
        rewrite_without(archive, &replaced)?;
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(archive)
        .io_context(|| "failed to open archive for writing")?;
    let mut writer = zip::ZipWriter::new_append(file)?;

    for source in sources {
        let mode = source.metadata.permissions().mode() & 0o7777;
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode);

        if source.metadata.is_dir() {
            if existing.contains(&source.name) {
                continue;
            }
            writer.add_directory(source.name, options)?;
        } else if source.metadata.is_symlink() {
            let target =
                std::fs::read_link(&source.path).io_context(|| "failed to read symlink")?;
            writer.add_symlink(source.name, target.to_string_lossy(), options)?;
        } else {
            writer.start_file(source.name, options)?;
            let mut file =
                std::fs::File::open(&source.path).io_context(|| "failed to open file")?;
            std::io::copy(&mut file, &mut writer).io_context(|| "failed to write archive")?;
        }
    }

    let mut file = writer.finish()?;
    file.flush().io_context(|| "failed to write archive")?;

    Ok(())
}

/// Rewrite the archive without the named entries, copying every other entry
/// without recompressing it.
fn rewrite_without(archive: &Path, names: &HashSet<String>) -> Result<(), PackagingError> {
    let mut zip = open_archive(archive)?;
    let parent = archive.parent().unwrap_or_else(|| Path::new("."));
    let temp_file =
        tempfile::NamedTempFile::new_in(parent).io_context(|| "failed to create temp file")?;

    let mut writer = zip::ZipWriter::new(temp_file);
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index)?;
        if names.contains(entry.name()) {
            continue;
        }
        writer.raw_copy_file(entry)?;
    }
    let temp_file = writer.finish()?;

    temp_file
        .persist(archive)
        .map_err(|error| PackagingError::Io {
            context: "failed to replace archive".to_string(),
            source: error.error,
        })?;

    Ok(())
}
