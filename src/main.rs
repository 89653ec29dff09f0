use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use incidentd::config::{Config, init_logging};

#[derive(Parser)]
#[command(name = "incidentd")]
#[command(about = "incidentd - notification routing daemon", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = init_logging(&config.logging) {
        eprintln!("logging setup error: {err}");
        return ExitCode::FAILURE;
    }

    match incidentd::daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
