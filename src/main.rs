//! tinyrelay - durable per-agent mailbox relay daemon.

use clap::Parser;
use std::process::ExitCode;

use tinyrelay::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; keep the guard alive for the process lifetime.
    let _guard = match tinyrelay::logging::init() {
        Ok((guard, _path)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let args = Commands::parse();

    match args.run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
