//! Convoy daemon entry point.

use clap::Parser;
use log::info;

use convoy::cli::{run_client, Cli, Command};
use convoy::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Load configuration
    let cfg = Config::load(&cli.overrides)?;

    match cli.command {
        Command::Daemon => convoy::daemon::run(cfg).await,
        command => {
            info!("Running {:?} against {:?}", command, cli.host);
            run_client(&cfg, cli.host.as_deref(), command).await
        }
    }
}
