//! netmirage-core: build or destroy an emulated network

use clap::Parser;
use netmirage::config::{Cli, Settings};
use netmirage::{logging, setup};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration problems are reported before logging exists
    let settings = match Settings::resolve(cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(settings.verbosity, settings.log_file.as_deref()) {
        eprintln!("Could not open log file: {}", e);
        return ExitCode::FAILURE;
    }

    match setup::run(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
