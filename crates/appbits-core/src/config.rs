use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;

use crate::{
    archive_tool::ArchiveToolConfig, blobstore::BlobstoreConfig,
    normalizer::DEFAULT_DIRECTORY_DELETE_BATCH_SIZE, size::DEFAULT_MAX_PACKAGE_SIZE,
};

const DEFAULT_CACHE_FETCH_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PackagerConfig {
    /// Parent directory for scratch workspaces. Defaults to the system temp
    /// directory.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,

    /// Largest allowed uncompressed package size in bytes. `0` disables
    /// the check.
    #[serde(default = "default_max_package_size")]
    pub max_package_size: Option<u64>,

    /// Files larger than this aren't added to the app bits cache.
    #[serde(default)]
    pub max_resource_size: Option<u64>,

    #[serde(default = "default_directory_delete_batch_size")]
    pub directory_delete_batch_size: usize,

    #[serde(default = "default_cache_fetch_concurrency")]
    pub cache_fetch_concurrency: usize,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub archive_tool: ArchiveToolConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default = "default_package_store")]
    pub package_store: BlobstoreConfig,

    #[serde(default = "default_app_bits_cache")]
    pub app_bits_cache: BlobstoreConfig,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            tmp_dir: None,
            max_package_size: default_max_package_size(),
            max_resource_size: None,
            directory_delete_batch_size: default_directory_delete_batch_size(),
            cache_fetch_concurrency: default_cache_fetch_concurrency(),
            timeout_secs: None,
            archive_tool: ArchiveToolConfig::default(),
            backend: BackendConfig::default(),
            package_store: default_package_store(),
            app_bits_cache: default_app_bits_cache(),
        }
    }
}

impl PackagerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.directory_delete_batch_size > 0,
            "directory_delete_batch_size must be at least 1"
        );
        anyhow::ensure!(
            self.cache_fetch_concurrency > 0,
            "cache_fetch_concurrency must be at least 1"
        );
        Ok(())
    }
}

/// Which packager does the bundling.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Local,
    BitsService {
        url: url::Url,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

/// Load a config file, returning `None` if it doesn't exist.
pub async fn load_from_path(path: &Path) -> anyhow::Result<Option<PackagerConfig>> {
    let config = match tokio::fs::read_to_string(path).await {
        Ok(config) => config,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read config from {}", path.display()));
        }
    };

    let config: PackagerConfig = toml::from_str(&config)
        .with_context(|| format!("failed to parse config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config in {}", path.display()))?;

    Ok(Some(config))
}

#[expect(clippy::unnecessary_wraps)]
const fn default_max_package_size() -> Option<u64> {
    Some(DEFAULT_MAX_PACKAGE_SIZE)
}

const fn default_directory_delete_batch_size() -> usize {
    DEFAULT_DIRECTORY_DELETE_BATCH_SIZE
}

const fn default_cache_fetch_concurrency() -> usize {
    DEFAULT_CACHE_FETCH_CONCURRENCY
}

fn default_package_store() -> BlobstoreConfig {
    BlobstoreConfig::Local {
        path: std::env::temp_dir().join("appbits").join("packages"),
    }
}

fn default_app_bits_cache() -> BlobstoreConfig {
    BlobstoreConfig::Local {
        path: std::env::temp_dir().join("appbits").join("app_bits_cache"),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: PackagerConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_package_size, Some(512 * 1024 * 1024));
        assert_eq!(config.directory_delete_batch_size, 10);
        assert_eq!(config.cache_fetch_concurrency, 10);
        assert_eq!(config.timeout(), None);
        assert_matches!(config.archive_tool, ArchiveToolConfig::Command { .. });
        assert_matches!(config.backend, BackendConfig::Local);
    }

    #[test]
    fn test_full_config() {
        let config: PackagerConfig = toml::from_str(
            r#"
            tmp_dir = "/var/tmp/appbits"
            max_package_size = 0
            directory_delete_batch_size = 25
            timeout_secs = 60

            [archive_tool]
            kind = "native"

            [backend]
            kind = "bits_service"
            url = "http://bits.example.com"
            username = "admin"
            password = "secret"

            [package_store]
            kind = "local"
            path = "/var/vcap/packages"

            [app_bits_cache]
            kind = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.tmp_dir, Some(PathBuf::from("/var/tmp/appbits")));
        assert_eq!(config.max_package_size, Some(0));
        assert_eq!(config.directory_delete_batch_size, 25);
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
        assert_matches!(config.archive_tool, ArchiveToolConfig::Native);
        assert_matches!(
            config.backend,
            BackendConfig::BitsService { ref url, username: Some(_), password: Some(_) }
                if url.host_str() == Some("bits.example.com")
        );
        assert_matches!(config.package_store, BlobstoreConfig::Local { .. });
        assert_matches!(config.app_bits_cache, BlobstoreConfig::Memory);
    }

    #[tokio::test]
    async fn test_load_from_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let missing = load_from_path(&dir.path().join("missing.toml")).await?;
        assert!(missing.is_none());

        let invalid_path = dir.path().join("invalid.toml");
        tokio::fs::write(&invalid_path, "directory_delete_batch_size = 0").await?;
        assert!(load_from_path(&invalid_path).await.is_err());

        let valid_path = dir.path().join("config.toml");
        tokio::fs::write(&valid_path, "cache_fetch_concurrency = 4").await?;
        let config = load_from_path(&valid_path).await?.unwrap();
        assert_eq!(config.cache_fetch_concurrency, 4);

        Ok(())
    }
}
