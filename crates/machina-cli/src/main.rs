mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.log_format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .init(),
        "" => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .init(),
        other => {
            eprintln!("unknown --log-format {:?} (expected \"\" or \"json\")", other);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::Create { machine_config } => commands::create(machine_config).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
