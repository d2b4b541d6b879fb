use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "machina",
    about = "Declarative machine lifecycle controller — one-shot provisioning driver",
    version
)]
pub struct Cli {
    /// Log output format: "" (plain) or "json".
    #[arg(long, global = true, default_value = "")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision every machine in the manifest once and write machines.json.
    Create {
        /// Path to the YAML machine manifest.
        #[arg(long = "machine-config", default_value = "./machines.yaml")]
        machine_config: PathBuf,
    },
}
