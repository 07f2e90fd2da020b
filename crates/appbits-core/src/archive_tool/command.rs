use std::path::{Path, PathBuf};

use super::{ArchiveTool, EntrySelection};
use crate::{
    error::{IoContext as _, PackagingError},
    process::{ToolCommand, run_tool},
};

/// Drives Info-ZIP's `zip` and `unzip` binaries. Listing and measuring read
/// the central directory in-process.
#[derive(Debug, Clone)]
pub struct CommandArchiveTool {
    zip_path: PathBuf,
    unzip_path: PathBuf,
}

impl Default for CommandArchiveTool {
    fn default() -> Self {
        Self::new("zip".into(), "unzip".into())
    }
}

impl CommandArchiveTool {
    pub const fn new(zip_path: PathBuf, unzip_path: PathBuf) -> Self {
        Self {
            zip_path,
            unzip_path,
        }
    }
}

#[async_trait::async_trait]
impl ArchiveTool for CommandArchiveTool {
    async fn extract(&self, archive: &Path, destination: &Path) -> Result<(), PackagingError> {
        let command = ToolCommand::new(&self.unzip_path, "Unzipping had errors")
            .args(["-qq", "-n"])
            .arg(archive)
            .arg("-d")
            .arg(destination);
        run_tool(command).await?;
        Ok(())
    }

    async fn add_entries(
        &self,
        archive: &Path,
        source_dir: &Path,
        selection: EntrySelection<'_>,
    ) -> Result<(), PackagingError> {
        // zip runs inside `source_dir`, so the archive path must not be
        // relative to our own working directory
        let archive = std::path::absolute(archive).io_context(|| "failed to resolve archive path")?;

        let command = ToolCommand::new(&self.zip_path, "Could not zip the package")
            .current_dir(source_dir);
        let command = match selection {
            EntrySelection::All => command.args(["-q", "-r", "--symlinks"]).arg(archive).arg("."),
            // Names come from the uploaded archive, so `--` keeps a name
            // like `-T` from being read as an option
            EntrySelection::Named(names) => command
                .args(["-q", "--symlinks", "-nw"])
                .arg(archive)
                .arg("--")
                .args(names.iter().map(|name| name.trim_end_matches('/'))),
        };
        run_tool(command).await?;
        Ok(())
    }

    async fn delete_entries(
        &self,
        archive: &Path,
        names: &[String],
    ) -> Result<(), PackagingError> {
        if names.is_empty() {
            return Ok(());
        }

        let command = ToolCommand::new(
            &self.zip_path,
            "Could not remove the directories from the package",
        )
        .args(["-q", "-nw", "-d"])
        .arg(archive)
        .arg("--")
        .args(names);
        run_tool(command).await?;
        Ok(())
    }
}
