use std::{collections::HashMap, path::Path};

use crate::{
    archive_tool::{self, ArchiveEntry, ArchiveTool, EntryKind},
    error::{IoContext as _, PackagingError},
    fs_utils,
};

/// Extract an untrusted archive into `destination`, returning the total
/// uncompressed size of its entries.
///
/// Every entry is checked before anything is written: entry names must stay
/// inside the destination, and every symlink (following chains of other
/// symlinks in the same archive) must resolve inside it too. If any check
/// fails, nothing is extracted.
#[tracing::instrument(skip(tool))]
pub async fn extract(
    tool: &dyn ArchiveTool,
    archive: &Path,
    destination: &Path,
) -> Result<u64, PackagingError> {
    let destination = match tokio::fs::canonicalize(destination).await {
        Ok(destination) if destination.is_dir() => destination,
        Ok(_) => {
            return Err(PackagingError::DestinationMissing {
                path: destination.to_owned(),
            });
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(PackagingError::DestinationMissing {
                path: destination.to_owned(),
            });
        }
        Err(error) => return Err(error).io_context(|| "failed to resolve destination"),
    };

    let archive_metadata = match tokio::fs::metadata(archive).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(PackagingError::ArchiveNotFound {
                path: archive.to_owned(),
            });
        }
        Err(error) => return Err(error).io_context(|| "failed to read archive metadata"),
    };
    if !archive_metadata.is_file() {
        return Err(PackagingError::ArchiveNotFound {
            path: archive.to_owned(),
        });
    }
    if archive_metadata.len() == 0 {
        return Err(PackagingError::EmptyArchive);
    }

    let entries = tool.list_entries(archive).await?;
    if entries.is_empty() {
        return Err(PackagingError::EmptyArchive);
    }

    let size = archive_tool::total_size(&entries)?;
    check_entries(&entries, &destination)?;

    tool.extract(archive, &destination).await?;

    tracing::debug!(entries = entries.len(), size, "extracted archive");
    Ok(size)
}

/// Validate every entry name and symlink target against `destination`,
/// which must already be canonicalized.
pub fn check_entries(entries: &[ArchiveEntry], destination: &Path) -> Result<(), PackagingError> {
    for entry in entries {
        if !fs_utils::is_safe_entry_name(&entry.name) {
            return Err(PackagingError::invalid_archive(format!(
                "entry has an unsafe path: {:?}",
                entry.name
            )));
        }
    }

    let links = entries
        .iter()
        .filter_map(|entry| {
            let target = entry.link_target.as_ref()?;
            Some((normalized_entry_name(&entry.name), target.clone()))
        })
        .collect::<HashMap<_, _>>();

    for entry in entries {
        if entry.kind != EntryKind::Symlink {
            continue;
        }

        let target = entry.link_target.as_deref().unwrap_or_default();
        let escape = || PackagingError::SymlinkEscape {
            entry: entry.name.clone(),
            target: target.to_string(),
        };

        let resolved = fs_utils::resolve_archive_symlink(&entry.name, target, &links)
            .ok_or_else(escape)?;
        let resolved_path = resolved
            .iter()
            .fold(destination.to_owned(), |path, component| path.join(component));
        if !fs_utils::is_within(destination, &resolved_path) {
            return Err(escape());
        }
    }

    Ok(())
}

fn normalized_entry_name(name: &str) -> String {
    name.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::error::ErrorKind;

    fn file(name: &str) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            kind: EntryKind::File,
            mode: Some(0o100_644),
            size: 1,
            link_target: None,
        }
    }

    fn symlink(name: &str, target: &str) -> ArchiveEntry {
        ArchiveEntry {
            name: name.to_string(),
            kind: EntryKind::Symlink,
            mode: Some(0o120_777),
            size: target.len() as u64,
            link_target: Some(target.to_string()),
        }
    }

    fn check(entries: &[ArchiveEntry]) -> Result<(), ErrorKind> {
        check_entries(entries, &PathBuf::from("/scratch/app")).map_err(|error| error.kind())
    }

    #[test]
    fn test_check_entries_accepts_inside_links() {
        assert_eq!(check(&[file("a/b"), symlink("a/link", "b")]), Ok(()));
        assert_eq!(check(&[file("a/b"), symlink("a/c/link", "../b")]), Ok(()));
        assert_eq!(check(&[symlink("./link", "a")]), Ok(()));
    }

    #[test]
    fn test_check_entries_rejects_escaping_links() {
        assert_eq!(
            check(&[symlink("link", "../outside")]),
            Err(ErrorKind::SymlinkEscape)
        );
        assert_eq!(
            check(&[symlink("link", "/etc/passwd")]),
            Err(ErrorKind::SymlinkEscape)
        );
        assert_eq!(
            check(&[symlink("a/up", ".."), symlink("a/link", "up/../x")]),
            Err(ErrorKind::SymlinkEscape)
        );
    }

    #[test]
    fn test_check_entries_rejects_unsafe_names() {
        assert_eq!(check(&[file("../evil")]), Err(ErrorKind::InvalidArchive));
        assert_eq!(check(&[file("/evil")]), Err(ErrorKind::InvalidArchive));
    }
}
