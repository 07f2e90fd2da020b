pub mod archive_tool;
pub mod assembler;
pub mod blobstore;
pub mod config;
pub mod digest;
pub mod error;
pub mod extractor;
pub mod fingerprints;
pub mod fs_utils;
pub mod normalizer;
pub mod packager;
pub mod process;
pub mod reporter;
pub mod size;
pub mod workspace;

pub use error::{ErrorKind, PackagingError};
pub use packager::Packager;

pub const USER_AGENT: &str = concat!("appbits/", env!("CARGO_PKG_VERSION"));
