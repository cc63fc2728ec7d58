use std::process::ExitCode;

use clap::Parser;
use swapmarket::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    swapmarket::init_logging();
    match swapmarket::run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
