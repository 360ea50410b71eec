mod cli;
mod commands;
mod config;
mod logging;
mod ui;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let core = commands::build_core(&cli.connection)?;
    let outcome = match cli.command {
        Command::Enumerate => commands::enumerate::run(&core).await,
        Command::Call(args) => commands::call::run(&core, args).await,
        Command::Serve => commands::serve::run(&core).await,
    };
    core.dispose().await;
    outcome
}
