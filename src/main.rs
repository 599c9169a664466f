//! OpenPath - allow-list enforcement agent for shared Linux endpoints.

use anyhow::Result;
use clap::Parser;

use openpath::cli::{Cli, Commands};
use openpath::config::Config;
use openpath::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The agent log path lives in the config; a broken config still gets
    // stderr logging so the error is visible
    let log_file = Config::load_or_default(&cli.config)
        .ok()
        .and_then(|c| c.log_file);
    let log_file = match cli.command {
        Commands::Run | Commands::Update | Commands::Watchdog | Commands::Captive
        | Commands::FailOpen { .. } | Commands::Enforce => log_file,
        _ => None,
    };
    logging::init(logging::level_for(cli.verbose, cli.quiet), log_file.as_deref())?;

    match cli.command {
        Commands::Run => openpath::commands::run::run(&cli.config).await,
        Commands::Update => openpath::commands::update::run(&cli.config).await,
        Commands::Watchdog => openpath::commands::watchdog::run(&cli.config).await,
        Commands::Captive => openpath::commands::captive::run(&cli.config).await,
        Commands::Status => openpath::commands::status::run(&cli.config).await,
        Commands::Check { domain } => openpath::commands::check::run(&domain, &cli.config).await,
        Commands::FailOpen { reason } => openpath::commands::fail_open::run(reason, &cli.config).await,
        Commands::Enforce => openpath::commands::enforce::run(&cli.config).await,
        Commands::Version => {
            println!("openpath {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
