use std::{path::Path, sync::Arc, time::Duration};

use futures::TryStreamExt as _;
use tokio::io::AsyncWriteExt as _;

use crate::{
    blobstore::PackageBlobstore,
    config::PackagerConfig,
    digest::{self, Checksums},
    error::{IoContext as _, PackagingError},
    fingerprints::FingerprintSet,
    workspace::{BITS_SERVICE_WORKSPACE_PREFIX, ScratchWorkspace},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for the bits service's resource bundling endpoint.
#[derive(Clone)]
pub struct BitsServiceClient {
    client: reqwest_middleware::ClientWithMiddleware,
    url: url::Url,
    credentials: Option<(String, Option<String>)>,
}

impl BitsServiceClient {
    pub fn new(url: url::Url, credentials: Option<(String, Option<String>)>) -> Self {
        // Bundle requests carry a streamed multipart body, which retry
        // middleware can't replay, so the client has none
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        let client = reqwest_middleware::ClientBuilder::new(client).build();

        Self::new_with_client(client, url, credentials)
    }

    pub const fn new_with_client(
        client: reqwest_middleware::ClientWithMiddleware,
        url: url::Url,
        credentials: Option<(String, Option<String>)>,
    ) -> Self {
        Self {
            client,
            url,
            credentials,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<url::Url, PackagingError> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|()| PackagingError::BitsService {
                message: format!("invalid bits service URL {}", self.url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Ask the service to bundle `application` with the cached resources
    /// named by `fingerprints`, writing the returned zip to `destination`.
    #[tracing::instrument(skip(self, fingerprints))]
    pub async fn bundles(
        &self,
        fingerprints: &FingerprintSet,
        application: &Path,
        destination: &Path,
    ) -> Result<(), PackagingError> {
        let application_file = tokio::fs::File::open(application)
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => PackagingError::ArchiveNotFound {
                    path: application.to_owned(),
                },
                _ => PackagingError::Io {
                    context: "failed to open uploaded package".to_string(),
                    source: error,
                },
            })?;
        let application_length = application_file
            .metadata()
            .await
            .io_context(|| "failed to read uploaded package")?
            .len();
        let application_body =
            reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(application_file));

        let form = reqwest::multipart::Form::new()
            .text("resources", fingerprints.to_json())
            .part(
                "application",
                reqwest::multipart::Part::stream_with_length(application_body, application_length)
                    .file_name("application.zip")
                    .mime_str("application/zip")
                    .map_err(service_error)?,
            );

        let request = self
            .client
            .post(self.endpoint(&["app_stash", "bundles"])?)
            .multipart(form);
        let request = match &self.credentials {
            Some((username, password)) => request.basic_auth(username, password.as_ref()),
            None => request,
        };

        let response = request.send().await.map_err(service_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PackagingError::BitsService {
                message: format!("bundles request failed with status {status}: {body}"),
            });
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = tokio_util::io::StreamReader::new(stream);
        let mut file = tokio::fs::File::create(destination)
            .await
            .io_context(|| "failed to create bundle file")?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|error| PackagingError::BitsService {
                message: format!("failed to download bundle: {error}"),
            })?;
        file.flush().await.io_context(|| "failed to write bundle file")?;

        Ok(())
    }
}

impl std::fmt::Debug for BitsServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitsServiceClient")
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

fn service_error(error: impl std::fmt::Display) -> PackagingError {
    PackagingError::BitsService {
        message: error.to_string(),
    }
}

/// Delegates bundling to the bits service, then stores the bundle it returns.
#[derive(Debug, Clone)]
pub struct BitsServicePacker {
    client: Arc<BitsServiceClient>,
    package_blobstore: PackageBlobstore,
    tmp_dir: Option<std::path::PathBuf>,
    timeout: Option<Duration>,
}

impl BitsServicePacker {
    pub fn new(
        config: &PackagerConfig,
        client: Arc<BitsServiceClient>,
        package_blobstore: PackageBlobstore,
    ) -> Self {
        Self {
            client,
            package_blobstore,
            tmp_dir: config.tmp_dir.clone(),
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
        let workspace =
            ScratchWorkspace::create(self.tmp_dir.as_deref(), BITS_SERVICE_WORKSPACE_PREFIX)
                .await?;
        let bundle_path = workspace.file_path("bundle.zip");

        self.client
            .bundles(fingerprints, uploaded_archive, &bundle_path)
            .await?;

        let checksums = digest::digest_file(&bundle_path).await?;
        self.package_blobstore
            .cp_to_blobstore(&bundle_path, blobstore_key)
            .await?;

        tracing::info!(blobstore_key, sha1 = %checksums.sha1, "stored bundle");

        workspace.close();
        Ok(checksums)
    }
}
