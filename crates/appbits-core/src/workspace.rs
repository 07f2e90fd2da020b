use std::path::{Path, PathBuf};

use crate::error::{IoContext as _, PackagingError};

/// Workspace name prefix for the local packager.
pub const LOCAL_WORKSPACE_PREFIX: &str = "local_bits_packer";

/// Workspace name prefix for the bits service packager.
pub const BITS_SERVICE_WORKSPACE_PREFIX: &str = "bits_service_packer";

/// A temporary directory tree owned by a single packaging request. It is
/// removed when the workspace is closed or dropped, whichever comes first.
#[derive(Debug)]
pub struct ScratchWorkspace {
    dir: Option<tempfile::TempDir>,
    root: PathBuf,
}

impl ScratchWorkspace {
    /// Create a uniquely-named workspace starting with `prefix` under
    /// `tmp_dir` (or the system temp dir), with its extraction and
    /// cache-fetch subdirectories in place.
    pub async fn create(tmp_dir: Option<&Path>, prefix: &str) -> Result<Self, PackagingError> {
        let tmp_dir = tmp_dir.map_or_else(std::env::temp_dir, Path::to_owned);
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .io_context(|| "failed to create temp dir")?;

        let prefix = prefix.to_owned();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&prefix)
                .tempdir_in(tmp_dir)
        })
        .await
        .map_err(|error| PackagingError::Io {
            context: "workspace task failed".to_string(),
            source: std::io::Error::other(error),
        })?
        .io_context(|| "failed to create scratch workspace")?;

        let workspace = Self {
            root: dir.path().to_owned(),
            dir: Some(dir),
        };
        tokio::fs::create_dir(workspace.application_contents_dir())
            .await
            .io_context(|| "failed to create scratch workspace")?;
        tokio::fs::create_dir(workspace.cached_resources_dir())
            .await
            .io_context(|| "failed to create scratch workspace")?;

        tracing::debug!(root = %workspace.root.display(), "created scratch workspace");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Uploaded application files are extracted here.
    pub fn application_contents_dir(&self) -> PathBuf {
        self.root.join("application_contents")
    }

    /// Files fetched from the app bits cache are placed here.
    pub fn cached_resources_dir(&self) -> PathBuf {
        self.root.join("cached_resources")
    }

    /// The package being assembled.
    pub fn package_path(&self) -> PathBuf {
        self.root.join("package.zip")
    }

    /// Scratch file for downloads, such as bundles returned by the bits
    /// service.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove the workspace now rather than on drop.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        // Extracted archives can contain read-only directories, which
        // would stop us from deleting their contents
        make_owner_writable(dir.path());

        match dir.close() {
            Ok(()) => {
                tracing::debug!(root = %self.root.display(), "removed scratch workspace");
            }
            Err(error) => {
                tracing::warn!(
                    root = %self.root.display(),
                    %error,
                    "failed to remove scratch workspace"
                );
            }
        }
    }
}

impl Drop for ScratchWorkspace {
    fn drop(&mut self) {
        self.remove();
    }
}

fn make_owner_writable(root: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    let directories = walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_dir());
    for entry in directories {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mode = metadata.permissions().mode();
        if mode & 0o700 != 0o700 {
            let _ = std::fs::set_permissions(
                entry.path(),
                std::fs::Permissions::from_mode(mode | 0o700),
            );
        }
    }
}
