use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

mod commands;
mod config;
mod descriptor;
mod facades;
mod ipc;
mod logging;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(long, short, default_value = "/etc/opsgate/config.yaml")]
    config: PathBuf,

    #[clap(long, short, action = ArgAction::Count)]
    debug: u8,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session worker from a session descriptor.
    Run {
        /// JSON session descriptor handed over by the supervising agent.
        #[clap(long)]
        session: PathBuf,
    },
    /// Validate the configuration file and exit.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli);

    match &cli.command {
        Commands::Run { session } => commands::run::command(&cli, session).await,
        Commands::Check => commands::check::command(&cli).await,
    }
}
