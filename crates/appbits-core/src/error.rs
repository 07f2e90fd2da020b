use std::path::PathBuf;

/// Stable identifier for each way a packaging request can fail. Callers
/// should match on this rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    DestinationMissing,
    ArchiveNotFound,
    EmptyArchive,
    InvalidArchive,
    SymlinkEscape,
    MalformedFingerprints,
    StaleFingerprint,
    PackageTooLarge,
    ToolFailure,
    Blobstore,
    BitsService,
    Timeout,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("destination does not exist")]
    DestinationMissing { path: PathBuf },

    #[error("zip not found")]
    ArchiveNotFound { path: PathBuf },

    #[error("zipfile is empty")]
    EmptyArchive,

    #[error("invalid zip archive: {reason}")]
    InvalidArchive { reason: String },

    #[error("symlink(s) point outside of root folder: {entry:?} -> {target:?}")]
    SymlinkEscape { entry: String, target: String },

    #[error("malformed fingerprints: {reason}")]
    MalformedFingerprints { reason: String },

    #[error("cached file {path:?} with sha1 {sha1} is no longer in the cache")]
    StaleFingerprint { path: String, sha1: String },

    #[error("package may not be larger than {max} bytes (got {size} bytes)")]
    PackageTooLarge { size: u64, max: u64 },

    /// `command` is kept for logs; only `action` and the captured output
    /// are rendered.
    #[error("{action}\n STDOUT: {stdout:?}\n STDERR: {stderr:?}")]
    ToolFailure {
        action: String,
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("blobstore error: {0}")]
    Blobstore(#[from] object_store::Error),

    #[error("bits service error: {message}")]
    BitsService { message: String },

    #[error("packaging did not finish within {after:?}")]
    Timeout { after: std::time::Duration },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PackagingError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DestinationMissing { .. } => ErrorKind::DestinationMissing,
            Self::ArchiveNotFound { .. } => ErrorKind::ArchiveNotFound,
            Self::EmptyArchive => ErrorKind::EmptyArchive,
            Self::InvalidArchive { .. } => ErrorKind::InvalidArchive,
            Self::SymlinkEscape { .. } => ErrorKind::SymlinkEscape,
            Self::MalformedFingerprints { .. } => ErrorKind::MalformedFingerprints,
            Self::StaleFingerprint { .. } => ErrorKind::StaleFingerprint,
            Self::PackageTooLarge { .. } => ErrorKind::PackageTooLarge,
            Self::ToolFailure { .. } => ErrorKind::ToolFailure,
            Self::Blobstore(_) => ErrorKind::Blobstore,
            Self::BitsService { .. } => ErrorKind::BitsService,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFingerprints {
            reason: reason.into(),
        }
    }

    pub fn invalid_archive(reason: impl std::fmt::Display) -> Self {
        Self::InvalidArchive {
            reason: reason.to_string(),
        }
    }
}

impl From<zip::result::ZipError> for PackagingError {
    fn from(error: zip::result::ZipError) -> Self {
        match error {
            zip::result::ZipError::Io(source) => Self::Io {
                context: "failed to read zip archive".to_string(),
                source,
            },
            error => Self::invalid_archive(error),
        }
    }
}

/// Attach a short description to an I/O failure. Descriptions end up in
/// user-facing messages, so they shouldn't include scratch paths.
pub trait IoContext<T> {
    fn io_context<C>(self, context: impl FnOnce() -> C) -> Result<T, PackagingError>
    where
        C: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C>(self, context: impl FnOnce() -> C) -> Result<T, PackagingError>
    where
        C: Into<String>,
    {
        self.map_err(|source| PackagingError::Io {
            context: context().into(),
            source,
        })
    }
}
