//! fragproxy CLI
//!
//! Command-line entry point for the local forwarding proxy.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use args::{Args, Command};
use commands::run::RunArgs;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let run_args = match &args.command {
        Some(Command::Run(run_args)) => run_args.clone(),
        None => RunArgs::default(),
    };

    let config = commands::run::prepare_config(
        &run_args,
        args.config.as_deref(),
        args.blacklist.as_deref(),
    )?;

    logging::init(&args, &config)?;

    let result = commands::run::execute(config).await;

    if let Err(ref e) = result {
        error!("fatal error: {e:#}");
    }

    result
}
