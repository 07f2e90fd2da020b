use std::path::{Path, PathBuf};

use futures::{StreamExt as _, TryStreamExt as _};

use crate::{
    archive_tool::{ArchiveTool, EntrySelection},
    blobstore::AppBitsCache,
    error::PackagingError,
    fingerprints::{Fingerprint, FingerprintSet},
    fs_utils,
};

/// Download every fingerprinted file from the app bits cache into
/// `cache_fetch_root`, at its destination path and with its mode. Fails
/// with `StaleFingerprint` as soon as one claimed file is missing from the
/// cache; outstanding downloads are dropped.
#[tracing::instrument(skip(cache, fingerprints), fields(fingerprints = fingerprints.len()))]
pub async fn fetch_cached_files(
    cache: &AppBitsCache,
    fingerprints: &FingerprintSet,
    cache_fetch_root: &Path,
    concurrency: usize,
) -> Result<(), PackagingError> {
    futures::stream::iter(fingerprints)
        .map(Ok)
        .try_for_each_concurrent(concurrency.max(1), |fingerprint| {
            fetch_cached_file(cache, fingerprint, cache_fetch_root)
        })
        .await
}

async fn fetch_cached_file(
    cache: &AppBitsCache,
    fingerprint: &Fingerprint,
    cache_fetch_root: &Path,
) -> Result<(), PackagingError> {
    let destination = cache_fetch_root.join(&fingerprint.destination_path);
    let found = cache
        .fetch_by_hash(&fingerprint.content_hash, &destination, fingerprint.mode)
        .await?;
    if !found {
        return Err(PackagingError::StaleFingerprint {
            path: fingerprint.destination_path.clone(),
            sha1: fingerprint.content_hash.clone(),
        });
    }

    Ok(())
}

/// Add the files under `cache_fetch_root` to `archive`, keeping their
/// relative paths. Files that were already extracted from the upload into
/// `extracted_root` are part of the archive already and are not added
/// again. Does nothing if there is nothing new to add.
#[tracing::instrument(skip(tool))]
pub async fn assemble(
    tool: &dyn ArchiveTool,
    extracted_root: &Path,
    cache_fetch_root: &Path,
    archive: &Path,
) -> Result<(), PackagingError> {
    let extracted_root = extracted_root.to_owned();
    let fetch_root = cache_fetch_root.to_owned();
    let skipped =
        tokio::task::spawn_blocking(move || prune_already_extracted(&extracted_root, &fetch_root))
            .await
            .map_err(|error| PackagingError::Io {
                context: "assemble task failed".to_string(),
                source: std::io::Error::other(error),
            })??;
    if skipped > 0 {
        tracing::debug!(skipped, "skipping cached files already in the upload");
    }

    let is_empty = fs_utils::is_empty_dir(cache_fetch_root)
        .await
        .map_err(|source| PackagingError::Io {
            context: "failed to read cached resources".to_string(),
            source,
        })?;
    if is_empty {
        tracing::debug!("no cached files to add");
        return Ok(());
    }

    tool.add_entries(archive, cache_fetch_root, EntrySelection::All)
        .await?;
    Ok(())
}

/// Remove files from `fetch_root` that also exist in `extracted_root`, along
/// with any directories left empty. Returns the number of files removed.
fn prune_already_extracted(
    extracted_root: &Path,
    fetch_root: &Path,
) -> Result<usize, PackagingError> {
    let walk_error = |error: walkdir::Error| PackagingError::Io {
        context: "failed to walk cached resources".to_string(),
        source: error.into(),
    };

    let mut duplicates: Vec<PathBuf> = vec![];
    for entry in walkdir::WalkDir::new(fetch_root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_dir() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(fetch_root) else {
            continue;
        };
        if std::fs::symlink_metadata(extracted_root.join(relative)).is_ok() {
            duplicates.push(entry.into_path());
        }
    }

    for duplicate in &duplicates {
        std::fs::remove_file(duplicate).map_err(|source| PackagingError::Io {
            context: "failed to remove duplicate cached file".to_string(),
            source,
        })?;
    }

    if !duplicates.is_empty() {
        let directories = walkdir::WalkDir::new(fetch_root)
            .min_depth(1)
            .contents_first(true)
            .follow_links(false);
        for entry in directories {
            let entry = entry.map_err(walk_error)?;
            if entry.file_type().is_dir() {
                // Fails if the directory still has files, which is fine
                let _ = std::fs::remove_dir(entry.path());
            }
        }
    }

    Ok(duplicates.len())
}
