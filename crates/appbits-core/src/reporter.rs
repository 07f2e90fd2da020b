use tracing_subscriber::{Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt as _};

const DEFAULT_TRACING_LEVEL: &str = "appbits=info";
const DEFAULT_DEBUG_TRACING_LEVEL: &str = "appbits=debug";

fn tracing_output_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_LEVEL.parse().expect("invalid filter"))
        .with_env_var("APPBITS_LOG")
        .from_env_lossy()
}

fn tracing_debug_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(DEFAULT_DEBUG_TRACING_LEVEL.parse().expect("invalid filter"))
        .with_env_var("APPBITS_LOG_DEBUG")
        .from_env_lossy()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    #[default]
    Plain,
    Json,
}

/// Log to stderr, leaving stdout for command output.
pub fn start_console_reporter(format: ConsoleFormat) {
    let fmt_layer = match format {
        ConsoleFormat::Plain => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .without_time()
            .with_filter(tracing_output_filter())
            .boxed(),
        ConsoleFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(tracing_output_filter())
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).init();
}

/// Send test logs as JSON to the file named by `APPBITS_LOG_OUTPUT`, if
/// set. Safe to call from every test; the subscriber is installed once.
pub fn start_test_reporter() {
    static TEST_TRACING_SUBSCRIBER: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    if let Some(debug_output_path) = std::env::var_os("APPBITS_LOG_OUTPUT") {
        TEST_TRACING_SUBSCRIBER.get_or_init(|| {
            let debug_output = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(debug_output_path)
                .expect("failed to open debug output path");
            tracing_subscriber::fmt()
                .json()
                .with_writer(debug_output)
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .with_env_filter(tracing_debug_filter())
                .init();
        });
    }
}
