use std::process::ExitCode;

use clap::Parser;
use digit_recognizer::server::{self, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    server::install_logger();

    match server::run(ServerConfig::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
