use std::{io::Read as _, path::Path};

use sha1::Digest as _;

use crate::error::{IoContext as _, PackagingError};

/// Digests of a finished package, as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Checksums {
    pub sha1: String,
    pub sha256: String,
}

impl Checksums {
    pub fn entries(&self) -> [ChecksumEntry; 2] {
        [
            ChecksumEntry {
                r#type: ChecksumType::Sha1,
                value: self.sha1.clone(),
            },
            ChecksumEntry {
                r#type: ChecksumType::Sha256,
                value: self.sha256.clone(),
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    Sha1,
    Sha256,
}

/// A single `{type, value}` checksum, the shape used when checksums are
/// reported as a list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "RawChecksumEntry")]
pub struct ChecksumEntry {
    pub r#type: ChecksumType,
    pub value: String,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChecksumEntry {
    r#type: ChecksumType,
    value: String,
}

impl TryFrom<RawChecksumEntry> for ChecksumEntry {
    type Error = String;

    fn try_from(raw: RawChecksumEntry) -> Result<Self, Self::Error> {
        if !(1..=500).contains(&raw.value.len()) {
            return Err("value must be between 1 and 500 characters".to_string());
        }

        Ok(Self {
            r#type: raw.r#type,
            value: raw.value,
        })
    }
}

/// Compute the sha1 and sha256 digests of a file in a single pass.
pub async fn digest_file(path: &Path) -> Result<Checksums, PackagingError> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path).io_context(|| "failed to open package")?;
        let mut sha1 = sha1::Sha1::new();
        let mut sha256 = sha2::Sha256::new();

        let mut buffer = vec![0; 1024 * 1024];
        loop {
            let length = file
                .read(&mut buffer)
                .io_context(|| "failed to read package")?;
            if length == 0 {
                break;
            }

            let buffer = &buffer[..length];
            sha1.update(buffer);
            sha256.update(buffer);
        }

        Ok(Checksums {
            sha1: hex::encode(sha1.finalize()),
            sha256: hex::encode(sha256.finalize()),
        })
    })
    .await
    .map_err(|error| PackagingError::Io {
        context: "digest task failed".to_string(),
        source: std::io::Error::other(error),
    })?
}

/// sha1 of a file, as a lowercase hex string. This is the key used in the
/// app bits cache.
pub fn sha1_file_sync(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = sha1::Sha1::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
