use std::{path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use appbits_core::{
    Packager, PackagingError,
    config::PackagerConfig,
    fingerprints::FingerprintSet,
    reporter::ConsoleFormat,
};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(version)]
enum Args {
    /// Build a package from an uploaded archive and store it
    Package(PackageArgs),

    /// Print the uncompressed size of an archive
    Measure(MeasureArgs),

    /// Validate a fingerprints file
    CheckFingerprints(CheckFingerprintsArgs),
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let exit_code = match args {
        Args::Package(args) => rt.block_on(package(args))?,
        Args::Measure(args) => rt.block_on(measure(args))?,
        Args::CheckFingerprints(args) => rt.block_on(check_fingerprints(args))?,
    };

    Ok(exit_code)
}

#[derive(Debug, Parser)]
struct ConfigArgs {
    /// TOML config file. Defaults are used if it doesn't exist
    #[arg(short, long, default_value = "appbits.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl ConfigArgs {
    fn start_reporter(&self) {
        let format = if self.json_logs {
            ConsoleFormat::Json
        } else {
            ConsoleFormat::Plain
        };
        appbits_core::reporter::start_console_reporter(format);
    }

    async fn load(&self) -> anyhow::Result<PackagerConfig> {
        let config = appbits_core::config::load_from_path(&self.config).await?;
        match config {
            Some(config) => Ok(config),
            None => {
                tracing::debug!(path = %self.config.display(), "config not found, using defaults");
                Ok(PackagerConfig::default())
            }
        }
    }
}

#[derive(Debug, Parser)]
struct PackageArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Key to store the package under
    #[arg(short, long)]
    key: String,

    /// The uploaded application archive
    #[arg(short, long)]
    upload: PathBuf,

    /// JSON file listing cached files to add to the package
    #[arg(short, long)]
    fingerprints: Option<PathBuf>,
}

#[expect(clippy::print_stdout)]
async fn package(args: PackageArgs) -> anyhow::Result<ExitCode> {
    args.config.start_reporter();
    let config = args.config.load().await?;

    let fingerprints = match &args.fingerprints {
        Some(path) => {
            let fingerprints = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&fingerprints)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => serde_json::Value::Null,
    };

    let packager = Packager::from_config(&config)?;
    let result = packager
        .send_package_to_blobstore(&args.key, &args.upload, &fingerprints)
        .await;

    match result {
        Ok(checksums) => {
            println!("{}", serde_json::to_string_pretty(&checksums)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => Ok(report_error(&error)),
    }
}

#[derive(Debug, Parser)]
struct MeasureArgs {
    #[command(flatten)]
    config: ConfigArgs,

    archive: PathBuf,

    /// Fail if the archive is larger than the configured maximum
    #[arg(long)]
    check: bool,
}

#[expect(clippy::print_stdout)]
async fn measure(args: MeasureArgs) -> anyhow::Result<ExitCode> {
    args.config.start_reporter();
    let config = args.config.load().await?;
    let tool = config.archive_tool.build();

    let max_size = if args.check {
        config.max_package_size
    } else {
        None
    };
    match appbits_core::size::validate(&*tool, &args.archive, max_size).await {
        Ok(size) => {
            println!("{size}");
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => Ok(report_error(&error)),
    }
}

#[derive(Debug, Parser)]
struct CheckFingerprintsArgs {
    file: PathBuf,
}

#[expect(clippy::print_stdout)]
async fn check_fingerprints(args: CheckFingerprintsArgs) -> anyhow::Result<ExitCode> {
    let contents = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    match FingerprintSet::from_json_str(&contents) {
        Ok(fingerprints) => {
            println!("{} cached files", fingerprints.len());
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => Ok(report_error(&error)),
    }
}

#[expect(clippy::print_stderr)]
fn report_error(error: &PackagingError) -> ExitCode {
    eprintln!("error[{}]: {error}", error.kind());
    ExitCode::FAILURE
}
