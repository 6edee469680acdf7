use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shelld_daemon::Config;

/// Exposes a single persistent interactive shell over HTTP, locked to one
/// client at a time.
#[derive(Parser, Debug)]
#[command(name = "shelld", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "SHELLD_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

// Logs go to stderr, or append to the file named by SHELLD_LOG. The daemon
// drives one shell and logs little outside lifecycle transitions, so a
// mutex-guarded file handle is plenty; RUST_LOG overrides the default level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(path) = std::env::var_os("SHELLD_LOG").map(PathBuf::from) {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.with_ansi(false).with_writer(Mutex::new(file)).init();
                return;
            }
            Err(err) => {
                eprintln!(
                    "warning: failed to open log file {}: {}",
                    path.display(),
                    err
                );
            }
        }
    }

    builder
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let Some(config_path) = cli.config else {
        eprintln!("the configuration file path is required (use --config or SHELLD_CONFIG)");
        return ExitCode::FAILURE;
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "the configuration could not be loaded");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = shelld_daemon::run(config).await {
        tracing::error!(error = %err, "the server encountered an error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
