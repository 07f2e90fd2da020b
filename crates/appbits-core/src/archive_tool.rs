use std::{
    io::Read as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::error::{IoContext as _, PackagingError};

pub mod command;
pub mod native;

pub use command::CommandArchiveTool;
pub use native::NativeArchiveTool;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

/// Symlink targets longer than this are treated as a corrupt archive.
const MAX_LINK_TARGET_LENGTH: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub kind: EntryKind,

    /// Unix mode including the file type bits, if the archive recorded one.
    pub mode: Option<u32>,

    /// Uncompressed size in bytes.
    pub size: u64,
    pub link_target: Option<String>,
}

impl ArchiveEntry {
    /// Zip directory entries are marked only by their trailing separator.
    /// Archives created on Windows often lack the directory attribute.
    pub fn is_directory_like(&self) -> bool {
        self.name.ends_with('/')
    }

    pub fn permissions(&self) -> Option<u32> {
        self.mode.map(|mode| mode & 0o7777)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum EntrySelection<'a> {
    /// Everything under the source directory, recursively.
    All,

    /// Only these paths (relative to the source directory), without
    /// descending into directories.
    Named(&'a [String]),
}

/// The operations the packaging pipeline needs from an archive
/// implementation. Everything that touches archive contents goes through
/// this trait so the subprocess-backed implementation can be swapped out.
#[async_trait::async_trait]
pub trait ArchiveTool: std::fmt::Debug + Send + Sync {
    async fn list_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, PackagingError> {
        read_entries(archive).await
    }

    /// Extract the archive into an existing directory, keeping symlinks
    /// as symlinks and restoring permission bits. Existing files are never
    /// overwritten.
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError>;

    /// Add files from `source_dir` to the archive, stored relative to
    /// `source_dir`. Symlinks are stored as symlinks.
    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError>;

    async fn delete_entries(&self, archive: &Path, names: &[String])
    -> Result<(), PackagingError>;

    /// Total uncompressed size of every entry, from the central directory.
    async fn measure_size(&self, archive: &Path) -> Result<u64, PackagingError> {
        let entries = self.list_entries(archive).await?;
        total_size(&entries)
    }
}

/// Sum of the sizes declared by `entries`. Sizes come from the archive
/// itself, so a total that overflows is treated as a corrupt archive.
pub fn total_size(entries: &[ArchiveEntry]) -> Result<u64, PackagingError> {
    entries.iter().try_fold(0_u64, |total, entry| {
        total.checked_add(entry.size).ok_or_else(|| {
            PackagingError::invalid_archive(format!(
                "declared entry sizes overflow at {:?}",
                entry.name
            ))
        })
    })
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ArchiveToolConfig {
    Command {
        #[serde(default = "default_zip_path")]
        zip_path: PathBuf,
        #[serde(default = "default_unzip_path")]
        unzip_path: PathBuf,
    },
    Native,
}

impl Default for ArchiveToolConfig {
    fn default() -> Self {
        Self::Command {
            zip_path: default_zip_path(),
            unzip_path: default_unzip_path(),
        }
    }
}

impl ArchiveToolConfig {
    pub fn build(&self) -> Arc<dyn ArchiveTool> {
        match self {
            Self::Command {
                zip_path,
                unzip_path,
            } => Arc::new(CommandArchiveTool::new(zip_path.clone(), unzip_path.clone())),
            Self::Native => Arc::new(NativeArchiveTool),
        }
    }
}

fn default_zip_path() -> PathBuf {
    PathBuf::from("zip")
}

fn default_unzip_path() -> PathBuf {
    PathBuf::from("unzip")
}

pub(crate) fn entry_kind(name: &str, mode: Option<u32>) -> EntryKind {
    if name.ends_with('/') {
        EntryKind::Directory
    } else if mode.is_some_and(|mode| mode & S_IFMT == S_IFLNK) {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

/// Read the central directory of a zip archive without extracting anything.
pub async fn read_entries(archive: &Path) -> Result<Vec<ArchiveEntry>, PackagingError> {
    let archive = archive.to_owned();
    tokio::task::spawn_blocking(move || read_entries_sync(&archive))
        .await
        .map_err(|error| PackagingError::Io {
            context: "archive listing task failed".to_string(),
            source: std::io::Error::other(error),
        })?
}

pub(crate) fn read_entries_sync(archive: &Path) -> Result<Vec<ArchiveEntry>, PackagingError> {
    let file = match std::fs::File::open(archive) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(PackagingError::ArchiveNotFound {
                path: archive.to_owned(),
            });
        }
        Err(error) => return Err(error).io_context(|| "failed to open archive"),
    };

    let mut zip = zip::ZipArchive::new(std::io::BufReader::new(file))?;
    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut zip_file = zip.by_index(index)?;
        let name = zip_file.name().to_string();
        let mode = zip_file.unix_mode();
        let size = zip_file.size();

        let kind = entry_kind(&name, mode);

        let link_target = if kind == EntryKind::Symlink {
            let mut target = String::new();
            (&mut zip_file)
                .take(MAX_LINK_TARGET_LENGTH + 1)
                .read_to_string(&mut target)
                .map_err(|error| {
                    PackagingError::invalid_archive(format!(
                        "could not read symlink target for {name:?}: {error}"
                    ))
                })?;
            if target.len() as u64 > MAX_LINK_TARGET_LENGTH {
                return Err(PackagingError::invalid_archive(format!(
                    "symlink target for {name:?} is too long"
                )));
            }
            Some(target)
        } else {
            None
        };

        entries.push(ArchiveEntry {
            name,
            kind,
            mode,
            size,
            link_target,
        });
    }

    Ok(entries)
}
