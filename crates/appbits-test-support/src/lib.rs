use std::{
    io::Write as _,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use appbits_core::{
    archive_tool::{ArchiveEntry, ArchiveTool, EntryKind, EntrySelection, NativeArchiveTool},
    blobstore::{AppBitsCache, BlobstoreConfig, PackageBlobstore},
    config::PackagerConfig,
    error::PackagingError,
    packager::LocalBitsPacker,
};
use sha1::Digest as _;

pub async fn packager_test() -> (LocalBitsPacker, TestContext) {
    packager_test_with(Arc::new(NativeArchiveTool), |_| {}).await
}

pub async fn packager_test_with(
    tool: Arc<dyn ArchiveTool>,
    configure: impl FnOnce(&mut PackagerConfig),
) -> (LocalBitsPacker, TestContext) {
    appbits_core::reporter::start_test_reporter();

    let context = TestContext::new().await;
    let mut config = context.config();
    configure(&mut config);

    let packer = LocalBitsPacker::new(
        &config,
        tool,
        context.package_blobstore(),
        context.app_bits_cache(),
    );
    (packer, context)
}

pub struct TestContext {
    temp: tempfile::TempDir,
    pub package_store: Arc<object_store::memory::InMemory>,
    pub app_bits_cache_store: Arc<object_store::memory::InMemory>,
}

impl TestContext {
    pub async fn new() -> Self {
        let temp = tempfile::Builder::new()
            .prefix("appbits-test")
            .tempdir()
            .expect("failed to create temp dir");
        let context = Self {
            temp,
            package_store: Arc::new(object_store::memory::InMemory::new()),
            app_bits_cache_store: Arc::new(object_store::memory::InMemory::new()),
        };
        tokio::fs::create_dir_all(context.scratch_dir())
            .await
            .expect("failed to create scratch dir");
        context
    }

    /// Config pointing scratch workspaces at this context's scratch dir and
    /// using the in-process archive tool.
    pub fn config(&self) -> PackagerConfig {
        PackagerConfig {
            tmp_dir: Some(self.scratch_dir()),
            archive_tool: appbits_core::archive_tool::ArchiveToolConfig::Native,
            package_store: BlobstoreConfig::Memory,
            app_bits_cache: BlobstoreConfig::Memory,
            ..Default::default()
        }
    }

    pub fn package_blobstore(&self) -> PackageBlobstore {
        PackageBlobstore::new(self.package_store.clone())
    }

    pub fn app_bits_cache(&self) -> AppBitsCache {
        AppBitsCache::new(self.app_bits_cache_store.clone())
    }

    pub fn path(&self, path: impl AsRef<Path>) -> PathBuf {
        let temp_path = self
            .temp
            .path()
            .canonicalize()
            .expect("failed to canonicalize temp path");
        temp_path.join(path)
    }

    /// Parent of every scratch workspace created by packagers from
    /// [`Self::config`].
    pub fn scratch_dir(&self) -> PathBuf {
        self.path("scratch")
    }

    /// Names of scratch workspaces that are still on disk.
    pub async fn leftover_workspaces(&self) -> Vec<String> {
        let mut entries = tokio::fs::read_dir(self.scratch_dir()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names
    }

    pub async fn mkdir(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = self.path(path.as_ref());
        tokio::fs::create_dir_all(&path).await.unwrap();
        path
    }

    pub async fn write_file(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.path(path.as_ref());

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }

        tokio::fs::write(&path, contents.as_ref()).await.unwrap();

        path
    }

    pub async fn write_symlink(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> PathBuf {
        let dst = self.path(dst.as_ref());

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }

        tokio::fs::symlink(&src, &dst).await.unwrap();

        dst
    }

    /// Write a zip fixture into the temp dir.
    pub fn write_zip(&self, path: impl AsRef<Path>, fixture: &ZipFixture) -> PathBuf {
        let path = self.path(path);
        fixture.write(&path);
        path
    }

    /// Store `contents` in the app bits cache, returning its sha1.
    pub async fn cache_blob(&self, contents: impl AsRef<[u8]>) -> String {
        let contents = contents.as_ref().to_vec();
        let sha1 = sha1_hex(&contents);
        object_store::ObjectStore::put(
            &*self.app_bits_cache_store,
            &appbits_core::blobstore::cache_key(&sha1),
            contents.into(),
        )
        .await
        .unwrap();
        sha1
    }

    /// Download a stored package into the temp dir.
    pub async fn stored_package(&self, key: &str) -> PathBuf {
        let object =
            object_store::ObjectStore::get(&*self.package_store, &object_store::path::Path::from(key))
                .await
                .unwrap();
        let bytes = object.bytes().await.unwrap();

        let path = self.path(format!("stored-{}.zip", key.replace('/', "_")));
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }
}

pub fn sha1_hex(contents: impl AsRef<[u8]>) -> String {
    hex::encode(sha1::Sha1::digest(contents.as_ref()))
}

/// Entry names of an archive, in archive order.
pub async fn archive_entry_names(archive: &Path) -> Vec<String> {
    appbits_core::archive_tool::read_entries(archive)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}

/// Returns true if the Info-ZIP `zip` and `unzip` binaries can be run.
pub async fn command_tools_available() -> bool {
    for (program, arg) in [("zip", "-v"), ("unzip", "-v")] {
        let status = tokio::process::Command::new(program)
            .arg(arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await;
        if !status.is_ok_and(|status| status.success()) {
            return false;
        }
    }

    true
}

#[derive(Debug, Clone)]
enum FixtureEntry {
    File {
        name: String,
        contents: Vec<u8>,
        mode: u32,
    },
    Directory {
        name: String,
        mode: u32,
    },
    Symlink {
        name: String,
        target: String,
    },

    /// A directory-like name stored without the directory attribute, as
    /// written by some Windows tools.
    BareDirectory {
        name: String,
    },
}

/// Builder for zip archives used as test inputs.
#[derive(Debug, Clone, Default)]
pub struct ZipFixture {
    entries: Vec<FixtureEntry>,
}

impl ZipFixture {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn file(self, name: &str, contents: impl AsRef<[u8]>) -> Self {
        self.file_with_mode(name, contents, 0o644)
    }

    #[must_use]
    pub fn file_with_mode(mut self, name: &str, contents: impl AsRef<[u8]>, mode: u32) -> Self {
        self.entries.push(FixtureEntry::File {
            name: name.to_string(),
            contents: contents.as_ref().to_vec(),
            mode,
        });
        self
    }

    #[must_use]
    pub fn dir(mut self, name: &str) -> Self {
        self.entries.push(FixtureEntry::Directory {
            name: name.to_string(),
            mode: 0o755,
        });
        self
    }

    #[must_use]
    pub fn bare_dir(mut self, name: &str) -> Self {
        self.entries.push(FixtureEntry::BareDirectory {
            name: name.to_string(),
        });
        self
    }

    #[must_use]
    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        self.entries.push(FixtureEntry::Symlink {
            name: name.to_string(),
            target: target.to_string(),
        });
        self
    }

    pub fn write(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }

        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for entry in &self.entries {
            match entry {
                FixtureEntry::File {
                    name,
                    contents,
                    mode,
                } => {
                    writer
                        .start_file(name.as_str(), options.unix_permissions(*mode))
                        .unwrap();
                    writer.write_all(contents).unwrap();
                }
                FixtureEntry::Directory { name, mode } => {
                    writer
                        .add_directory(name.as_str(), options.unix_permissions(*mode))
                        .unwrap();
                }
                FixtureEntry::Symlink { name, target } => {
                    writer
                        .add_symlink(name.as_str(), target.as_str(), options)
                        .unwrap();
                }
                FixtureEntry::BareDirectory { name } => {
                    writer
                        .start_file(name.as_str(), options.unix_permissions(0o600))
                        .unwrap();
                }
            }
        }

        writer.finish().unwrap();
    }
}

/// `hi`, `bye` and `subdir/greeting`, 17 bytes in total.
pub fn good_zip() -> ZipFixture {
    ZipFixture::new()
        .file("hi", "hi\n")
        .file("bye", "bye\n")
        .dir("subdir/")
        .file("subdir/greeting", "greetings\n")
}

pub const GOOD_ZIP_SIZE: u64 = 17;

/// `folder_0/` to `folder_20/`, each holding an `empty_file`.
pub fn many_dirs_zip() -> ZipFixture {
    (0..21).fold(ZipFixture::new(), |fixture, i| {
        fixture
            .dir(&format!("folder_{i}/"))
            .file(&format!("folder_{i}/empty_file"), "")
    })
}

/// Counts calls to the wrapped tool.
#[derive(Debug)]
pub struct CountingArchiveTool {
    inner: Arc<dyn ArchiveTool>,
    pub extracts: AtomicUsize,
    pub adds: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl CountingArchiveTool {
    pub fn new(inner: Arc<dyn ArchiveTool>) -> Self {
        Self {
            inner,
            extracts: AtomicUsize::new(0),
            adds: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn adds(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn extracts(&self) -> usize {
        self.extracts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ArchiveTool for CountingArchiveTool {
    async fn list_entries(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, PackagingError> {
        self.inner.list_entries(archive).await
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(archive, destination).await
    }

    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add_entries(archive, source_dir, selection).await
    }

    async fn delete_entries(
        &self,
        archive: &Path,
        names: &[String],
    ) -> Result<(), PackagingError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_entries(archive, names).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Extract,
    AddEntries,
    DeleteEntries,
}

/// Lists archives normally, but fails one operation the way a crashing
/// external tool would.
#[derive(Debug)]
pub struct FailingArchiveTool {
    pub fail_on: Operation,
}

impl FailingArchiveTool {
    fn failure(&self, operation: Operation) -> Result<(), PackagingError> {
        if operation == self.fail_on {
            Err(PackagingError::ToolFailure {
                action: "Tool exploded".to_string(),
                command: format!("{operation:?}"),
                stdout: "partial output".to_string(),
                stderr: "something broke".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl ArchiveTool for FailingArchiveTool {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError> {
        self.failure(Operation::Extract)?;
        NativeArchiveTool.extract(archive, destination).await
    }

    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError> {
        self.failure(Operation::AddEntries)?;
        NativeArchiveTool
            .add_entries(archive, source_dir, selection)
            .await
    }

    async fn delete_entries(
        &self,
        archive: &Path,
        names: &[String],
    ) -> Result<(), PackagingError> {
        self.failure(Operation::DeleteEntries)?;
        NativeArchiveTool.delete_entries(archive, names).await
    }
}

/// Sleeps before every extraction, for exercising deadlines.
#[derive(Debug)]
pub struct SlowArchiveTool {
    pub delay: Duration,
}

#[async_trait::async_trait]
impl ArchiveTool for SlowArchiveTool {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError> {
        tokio::time::sleep(self.delay).await;
        NativeArchiveTool.extract(archive, destination).await
    }

    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError> {
        NativeArchiveTool
            .add_entries(archive, source_dir, selection)
            .await
    }

    async fn delete_entries(
        &self,
        archive: &Path,
        names: &[String],
    ) -> Result<(), PackagingError> {
        NativeArchiveTool.delete_entries(archive, names).await
    }
}

/// Lists made-up file entries with the given sizes, as a crafted zip64
/// central directory could. Everything else goes to the native tool.
#[derive(Debug)]
pub struct DeclaredSizesArchiveTool {
    pub sizes: Vec<u64>,
}

#[async_trait::async_trait]
impl ArchiveTool for DeclaredSizesArchiveTool {
    async fn list_entries(&self, _archive: &Path) -> Result<Vec<ArchiveEntry>, PackagingError> {
        let entries = self
            .sizes
            .iter()
            .enumerate()
            .map(|(index, size)| ArchiveEntry {
                name: format!("file_{index}"),
                kind: EntryKind::File,
                mode: Some(0o100_644),
                size: *size,
                link_target: None,
            })
            .collect();
        Ok(entries)
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError> {
        NativeArchiveTool.extract(archive, destination).await
    }

    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError> {
        NativeArchiveTool
            .add_entries(archive, source_dir, selection)
            .await
    }

    async fn delete_entries(
        &self,
        archive: &Path,
        names: &[String],
    ) -> Result<(), PackagingError> {
        NativeArchiveTool.delete_entries(archive, names).await
    }
}
