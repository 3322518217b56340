//! mash - build formulae from source

use std::process::ExitCode;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use mash_cli::cmd::{self, Context};
use mash_cli::ui::Output;
use mash_cli::{CacheCommands, Cli, Commands};
use mash_core::Outcome;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_with_options(std::env::args());

    match run(cli).await {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Partial) => ExitCode::from(2),
        Ok(Outcome::Failed | Outcome::Cancelled) => ExitCode::FAILURE,
        Err(e) => {
            Output::new().error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let ctx = Context::load(&cli)?;

    match &cli.command {
        Commands::Install { names, build } => {
            return cmd::install::install(&ctx, names, build, &cli.options).await;
        }
        Commands::Plan { names, build, json } => {
            cmd::plan::plan(&ctx, names, build, &cli.options, *json)?;
        }
        Commands::Uninstall { name } => cmd::uninstall::uninstall(&ctx, name)?,
        Commands::Info { name } => cmd::info::info(&ctx, name)?,
        Commands::List => cmd::list::list(&ctx)?,
        Commands::Cache { command } => match command {
            CacheCommands::List => cmd::cache::list(&ctx)?,
            CacheCommands::Verify => cmd::cache::verify(&ctx)?,
        },
    }
    Ok(Outcome::Success)
}
