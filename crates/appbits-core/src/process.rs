use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::error::PackagingError;

/// A single external tool invocation. Arguments are passed to the program
/// directly, never through a shell.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    action: String,
}

impl ToolCommand {
    /// `action` describes the invocation in error messages, e.g.
    /// "Unzipping had errors".
    pub fn new(program: impl Into<PathBuf>, action: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            current_dir: None,
            action: action.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Render the command line with shell quoting, for logs.
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(|arg| arg.as_os_str()))
            .map(|word| word.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        shlex::try_join(words.iter().map(String::as_str)).unwrap_or_else(|_| words.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a tool to completion, capturing its output. A nonzero exit status is
/// an error. Dropping the returned future kills the child process.
pub async fn run_tool(command: ToolCommand) -> Result<ToolOutput, PackagingError> {
    let command_line = command.display();
    tracing::debug!(command = %command_line, "running tool");

    let mut process = tokio::process::Command::new(&command.program);
    process
        .args(&command.args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(current_dir) = &command.current_dir {
        process.current_dir(current_dir);
    }

    let output = match process.output().await {
        Ok(output) => output,
        Err(error) => {
            tracing::warn!(command = %command_line, %error, "failed to spawn tool");
            return Err(PackagingError::ToolFailure {
                action: command.action,
                command: command_line,
                stdout: String::new(),
                stderr: error.to_string(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        tracing::debug!(command = %command_line, status = %output.status, "tool failed");
        return Err(PackagingError::ToolFailure {
            action: command.action,
            command: command_line,
            stdout,
            stderr,
        });
    }

    Ok(ToolOutput { stdout, stderr })
}
