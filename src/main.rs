use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tm_isync_adapter::config::Config;
use tm_isync_adapter::daemon::Daemon;
use tm_isync_adapter::error::AdapterError;
use tm_isync_adapter::logging;

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_STATE_STORE_CORRUPT: u8 = 2;
const EXIT_FATAL_RUNTIME: u8 = 3;

/// Bidirectional sync daemon between a cloud-drive mount and a
/// case-file upload endpoint.
#[derive(Parser, Debug)]
#[command(name = "tm-isync-adapter", version)]
struct Args {
    /// Path to config.json.
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Directory for state.json and persisted logs. Defaults to
    /// `TM_ISYNC_HOME` when set (the installer's override point), else
    /// the current directory.
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let data_dir = args
        .data_dir
        .or_else(|| std::env::var_os("TM_ISYNC_HOME").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let log_dir = data_dir.join("logs");
    let _logging_guard = match logging::init(&log_dir, config.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(EXIT_FATAL_RUNTIME);
        }
    };

    let daemon = Daemon::new(config, data_dir);
    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon exited with error");
            let code = match e {
                AdapterError::StateStoreCorrupt(_) => EXIT_STATE_STORE_CORRUPT,
                AdapterError::Config { .. } => EXIT_CONFIG_ERROR,
                _ => EXIT_FATAL_RUNTIME,
            };
            ExitCode::from(code)
        }
    }
}
