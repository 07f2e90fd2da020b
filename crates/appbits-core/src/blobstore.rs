use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use futures::{StreamExt as _, TryStreamExt as _};
use tokio::io::AsyncWriteExt as _;

use crate::error::{IoContext as _, PackagingError};

/// Where a blob store keeps its objects.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum BlobstoreConfig {
    Local { path: PathBuf },
    Memory,
}

impl BlobstoreConfig {
    pub fn build(&self) -> anyhow::Result<Arc<dyn object_store::ObjectStore>> {
        match self {
            Self::Local { path } => {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("failed to create blobstore dir {}", path.display()))?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(path)
                    .with_context(|| format!("failed to open blobstore at {}", path.display()))?;
                Ok(Arc::new(store))
            }
            Self::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        }
    }
}

/// Blob store holding finished packages, keyed by an opaque caller-chosen key.
#[derive(Debug, Clone)]
pub struct PackageBlobstore {
    store: Arc<dyn object_store::ObjectStore>,
}

impl PackageBlobstore {
    pub fn new(store: Arc<dyn object_store::ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn object_store::ObjectStore> {
        &self.store
    }

    /// Upload a local file under `key`, replacing anything stored there.
    #[tracing::instrument(skip(self))]
    pub async fn cp_to_blobstore(
        &self,
        local_path: &Path,
        key: &str,
    ) -> Result<(), PackagingError> {
        let path = object_store::path::Path::from(key);
        let mut file = tokio::fs::File::open(local_path)
            .await
            .io_context(|| "failed to open package for upload")?;

        let mut writer = object_store::buffered::BufWriter::new(self.store.clone(), path);
        let result = async {
            tokio::io::copy(&mut file, &mut writer).await?;
            writer.shutdown().await
        }
        .await;

        if let Err(error) = result {
            if let Err(abort_error) = writer.abort().await {
                tracing::warn!(error = %abort_error, "failed to abort package upload");
            }
            return Err(transfer_error(error));
        }

        tracing::debug!("uploaded package");
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, PackagingError> {
        exists(&self.store, &object_store::path::Path::from(key)).await
    }
}

/// The global content-addressable cache of individual application files,
/// keyed by the sha1 of their contents.
#[derive(Debug, Clone)]
pub struct AppBitsCache {
    store: Arc<dyn object_store::ObjectStore>,
    max_resource_size: Option<u64>,
    upload_concurrency: usize,
}

impl AppBitsCache {
    pub fn new(store: Arc<dyn object_store::ObjectStore>) -> Self {
        Self {
            store,
            max_resource_size: None,
            upload_concurrency: 10,
        }
    }

    /// Files larger than this are left out of the cache when seeding it.
    #[must_use]
    pub const fn with_max_resource_size(mut self, max_resource_size: Option<u64>) -> Self {
        self.max_resource_size = max_resource_size;
        self
    }

    #[must_use]
    pub fn with_upload_concurrency(mut self, upload_concurrency: usize) -> Self {
        self.upload_concurrency = upload_concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn object_store::ObjectStore> {
        &self.store
    }

    pub async fn exists(&self, sha1: &str) -> Result<bool, PackagingError> {
        exists(&self.store, &cache_key(sha1)).await
    }

    /// Download the blob with this sha1 to `destination` and give it `mode`.
    /// Returns `false` without touching the filesystem if no such blob
    /// exists.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_by_hash(
        &self,
        sha1: &str,
        destination: &Path,
        mode: u32,
    ) -> Result<bool, PackagingError> {
        let object = match self.store.get(&cache_key(sha1)).await {
            Ok(object) => object,
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(error) => return Err(error.into()),
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| "failed to create directory for cached file")?;
        }

        let stream = object.into_stream();
        let mut reader = tokio_util::io::StreamReader::new(stream);
        let mut file = tokio::fs::File::create(destination)
            .await
            .io_context(|| "failed to create cached file")?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(transfer_error)?;
        file.flush().await.io_context(|| "failed to write cached file")?;

        tokio::fs::set_permissions(destination, std::fs::Permissions::from_mode(mode))
            .await
            .io_context(|| "failed to set cached file permissions")?;

        Ok(true)
    }

    /// Add every regular file under `directory` to the cache. Files already
    /// cached are left alone and symlinks are skipped. Returns the number of
    /// files newly added.
    #[tracing::instrument(skip(self))]
    pub async fn cp_r_to_blobstore(&self, directory: &Path) -> Result<usize, PackagingError> {
        let directory = directory.to_owned();
        let max_resource_size = self.max_resource_size;
        let files = tokio::task::spawn_blocking(move || {
            collect_cacheable_files(&directory, max_resource_size)
        })
        .await
        .map_err(|error| PackagingError::Io {
            context: "cache walk task failed".to_string(),
            source: std::io::Error::other(error),
        })??;

        let added = futures::stream::iter(files)
            .map(|file| self.add_file(file))
            .buffer_unordered(self.upload_concurrency)
            .try_fold(0, |added, did_add| async move { Ok(added + usize::from(did_add)) })
            .await?;

        tracing::debug!(added, "seeded app bits cache");
        Ok(added)
    }

    async fn add_file(&self, file: PathBuf) -> Result<bool, PackagingError> {
        let hash_path = file.clone();
        let sha1 = tokio::task::spawn_blocking(move || crate::digest::sha1_file_sync(&hash_path))
            .await
            .map_err(|error| PackagingError::Io {
                context: "hash task failed".to_string(),
                source: std::io::Error::other(error),
            })?
            .io_context(|| "failed to hash file for cache")?;
        let key = cache_key(&sha1);

        // Another upload may still write the blob first, but this avoids
        // reading the file when it's already cached
        if exists(&self.store, &key).await? {
            return Ok(false);
        }

        let contents = tokio::fs::read(&file)
            .await
            .io_context(|| "failed to read file for cache")?;
        let put_result = self
            .store
            .put_opts(
                &key,
                contents.into(),
                object_store::PutOptions {
                    mode: object_store::PutMode::Create,
                    ..Default::default()
                },
            )
            .await;

        match put_result {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

/// Cache keys are partitioned by the first two byte pairs of the hash, so
/// `abcdef..` is stored at `ab/cd/abcdef..`.
pub fn cache_key(sha1: &str) -> object_store::path::Path {
    let first = sha1.get(0..2).unwrap_or_default();
    let second = sha1.get(2..4).unwrap_or_default();
    object_store::path::Path::from_iter([first, second, sha1])
}

async fn exists(
    store: &Arc<dyn object_store::ObjectStore>,
    path: &object_store::path::Path,
) -> Result<bool, PackagingError> {
    match store.head(path).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::NotFound { .. }) => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn collect_cacheable_files(
    directory: &Path,
    max_resource_size: Option<u64>,
) -> Result<Vec<PathBuf>, PackagingError> {
    let mut files = vec![];
    for entry in walkdir::WalkDir::new(directory).follow_links(false) {
        let entry = entry.map_err(|error| PackagingError::Io {
            context: "failed to walk application files".to_string(),
            source: error.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        if let Some(max_resource_size) = max_resource_size {
            let metadata = entry.metadata().map_err(|error| PackagingError::Io {
                context: "failed to read file metadata".to_string(),
                source: error.into(),
            })?;
            if metadata.len() > max_resource_size {
                continue;
            }
        }

        files.push(entry.into_path());
    }

    Ok(files)
}

/// Transfers go through `AsyncRead`/`AsyncWrite`, which wrap store errors in
/// `std::io::Error`. Unwrap them again so they keep their own kind.
fn transfer_error(error: std::io::Error) -> PackagingError {
    match error.downcast::<object_store::Error>() {
        Ok(store_error) => PackagingError::Blobstore(store_error),
        Err(error) => PackagingError::Io {
            context: "failed to transfer blob".to_string(),
            source: error,
        },
    }
}
