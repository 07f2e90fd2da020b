use std::{future::Future, path::Path, sync::Arc, time::Duration};

use anyhow::Context as _;

use crate::{
    blobstore::{AppBitsCache, PackageBlobstore},
    config::{BackendConfig, PackagerConfig},
    digest::Checksums,
    error::PackagingError,
};

pub mod bits_service;
pub mod local;

pub use bits_service::{BitsServiceClient, BitsServicePacker};
pub use local::LocalBitsPacker;

/// Turns an uploaded application archive plus the client's cache
/// fingerprints into a package in the package blobstore. Both backends
/// return the digests of the stored package.
#[derive(Debug, Clone)]
pub enum Packager {
    Local(LocalBitsPacker),
    BitsService(BitsServicePacker),
}

impl Packager {
    /// Build the packager selected by `config.backend`, opening the blob
    /// stores it needs.
    pub fn from_config(config: &PackagerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let package_store = config
            .package_store
            .build()
            .context("failed to open package blobstore")?;
        let package_blobstore = PackageBlobstore::new(package_store);

        match &config.backend {
            BackendConfig::Local => {
                let cache_store = config
                    .app_bits_cache
                    .build()
                    .context("failed to open app bits cache")?;
                let cache = AppBitsCache::new(cache_store)
                    .with_max_resource_size(config.max_resource_size)
                    .with_upload_concurrency(config.cache_fetch_concurrency);
                let tool = config.archive_tool.build();
                Ok(Self::Local(LocalBitsPacker::new(
                    config,
                    tool,
                    package_blobstore,
                    cache,
                )))
            }
            BackendConfig::BitsService {
                url,
                username,
                password,
            } => {
                let credentials = username
                    .as_ref()
                    .map(|username| (username.clone(), password.clone()));
                let client = BitsServiceClient::new(url.clone(), credentials);
                Ok(Self::BitsService(BitsServicePacker::new(
                    config,
                    Arc::new(client),
                    package_blobstore,
                )))
            }
        }
    }

    /// Package `uploaded_archive` together with the cached files named by
    /// `fingerprints` and store the result under `blobstore_key`.
    pub async fn send_package_to_blobstore(
        &self,
        blobstore_key: &str,
        uploaded_archive: &Path,
        fingerprints: &serde_json::Value,
    ) -> Result<Checksums, PackagingError> {
        match self {
            Self::Local(packer) => {
                packer
                    .send_package_to_blobstore(blobstore_key, uploaded_archive, fingerprints)
                    .await
            }
            Self::BitsService(packer) => {
                packer
                    .send_package_to_blobstore(blobstore_key, uploaded_archive, fingerprints)
                    .await
            }
        }
    }
}

/// Run `future` with an optional deadline. Dropping the future on timeout
/// kills any running tool and releases its scratch workspace.
pub(crate) async fn with_deadline<T>(
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, PackagingError>>,
) -> Result<T, PackagingError> {
    let Some(timeout) = timeout else {
        return future.await;
    };

    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(?timeout, "packaging timed out");
            Err(PackagingError::Timeout { after: timeout })
        }
    }
}
