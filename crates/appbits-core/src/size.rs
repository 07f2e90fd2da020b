use std::path::Path;

use crate::{archive_tool::ArchiveTool, error::PackagingError};

/// Default cap on the total uncompressed size of a package: 512 MiB.
pub const DEFAULT_MAX_PACKAGE_SIZE: u64 = 512 * 1024 * 1024;

/// Check the uncompressed size of the final package against `max_size`,
/// returning the size. `None` or `Some(0)` disables the check.
#[tracing::instrument(skip(tool))]
pub async fn validate(
    tool: &dyn ArchiveTool,
    archive: &Path,
    max_size: Option<u64>,
) -> Result<u64, PackagingError> {
    let size = tool.measure_size(archive).await?;

    match max_size {
        Some(max) if max > 0 && size > max => {
            tracing::debug!(size, max, "package is too large");
            Err(PackagingError::PackageTooLarge { size, max })
        }
        _ => Ok(size),
    }
}
