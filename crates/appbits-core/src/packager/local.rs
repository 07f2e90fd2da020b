use std::{os::unix::fs::PermissionsExt as _, path::Path, sync::Arc, time::Duration};

use crate::{
    archive_tool::ArchiveTool,
    assembler,
    blobstore::{AppBitsCache, PackageBlobstore},
    config::PackagerConfig,
    digest::{self, Checksums},
    error::{IoContext as _, PackagingError},
    extractor,
    fingerprints::FingerprintSet,
    normalizer, size,
    workspace::{LOCAL_WORKSPACE_PREFIX, ScratchWorkspace},
};

/// Packages uploads on this machine, using the app bits cache directly.
#[derive(Debug, Clone)]
pub struct LocalBitsPacker {
    tool: Arc<dyn ArchiveTool>,
    package_blobstore: PackageBlobstore,
    app_bits_cache: AppBitsCache,
    tmp_dir: Option<std::path::PathBuf>,
    max_package_size: Option<u64>,
    directory_delete_batch_size: usize,
    cache_fetch_concurrency: usize,
    timeout: Option<Duration>,
}

impl LocalBitsPacker {
    pub fn new(
        config: &PackagerConfig,
        tool: Arc<dyn ArchiveTool>,
        package_blobstore: PackageBlobstore,
        app_bits_cache: AppBitsCache,
    ) -> Self {
        Self {
            tool,
            package_blobstore,
            app_bits_cache,
            tmp_dir: config.tmp_dir.clone(),
            max_package_size: config.max_package_size,
            directory_delete_batch_size: config.directory_delete_batch_size,
            cache_fetch_concurrency: config.cache_fetch_concurrency,
            timeout: config.timeout(),
        }
    }

    #[tracing::instrument(skip(self, fingerprints))]
    pub async fn send_package_to_blobstore(
        &self,
        blobstore_key: &str,
        uploaded_archive: &Path,
        fingerprints: &serde_json::Value,
    ) -> Result<Checksums, PackagingError> {
        let fingerprints = FingerprintSet::parse(fingerprints)?;
        super::with_deadline(
            self.timeout,
            self.package(blobstore_key, uploaded_archive, &fingerprints),
        )
        .await
    }

    async fn package(
        &self,
        blobstore_key: &str,
        uploaded_archive: &Path,
        fingerprints: &FingerprintSet,
    ) -> Result<Checksums, PackagingError> {
        make_owner_writable(uploaded_archive).await?;

        let workspace =
            ScratchWorkspace::create(self.tmp_dir.as_deref(), LOCAL_WORKSPACE_PREFIX).await?;
        let package_path = workspace.package_path();
        let contents_dir = workspace.application_contents_dir();
        let cached_dir = workspace.cached_resources_dir();

        tokio::fs::copy(uploaded_archive, &package_path)
            .await
            .io_context(|| "failed to copy uploaded package")?;

        let uploaded_size = extractor::extract(&*self.tool, &package_path, &contents_dir).await?;
        tracing::debug!(uploaded_size, "extracted uploaded package");

        self.app_bits_cache.cp_r_to_blobstore(&contents_dir).await?;

        assembler::fetch_cached_files(
            &self.app_bits_cache,
            fingerprints,
            &cached_dir,
            self.cache_fetch_concurrency,
        )
        .await?;
        assembler::assemble(&*self.tool, &contents_dir, &cached_dir, &package_path).await?;

        normalizer::normalize(&*self.tool, &package_path, self.directory_delete_batch_size)
            .await?;
        let package_size = size::validate(&*self.tool, &package_path, self.max_package_size).await?;

        self.package_blobstore
            .cp_to_blobstore(&package_path, blobstore_key)
            .await?;
        let checksums = digest::digest_file(&package_path).await?;

        tracing::info!(
            blobstore_key,
            package_size,
            sha1 = %checksums.sha1,
            "stored package"
        );

        workspace.close();
        Ok(checksums)
    }
}

/// Uploads can arrive read-only, and the package is edited in place after
/// it's copied.
async fn make_owner_writable(path: &Path) -> Result<(), PackagingError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(PackagingError::ArchiveNotFound {
                path: path.to_owned(),
            });
        }
        Err(error) => return Err(error).io_context(|| "failed to read uploaded package"),
    };

    let mode = metadata.permissions().mode();
    if mode & 0o200 == 0 {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o200))
            .await
            .io_context(|| "failed to make uploaded package writable")?;
    }

    Ok(())
}
