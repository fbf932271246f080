use clap::Parser;
use dotenvy::dotenv;
use log::*;

mod cli;
mod commands;
mod config;
mod errors;
mod file_kv;
mod formatting;
mod http_source;
mod observer;

use crate::{
    cli::{Arguments, Command},
    config::AgentConfig,
};

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();
    let cli = Arguments::parse();
    let config = match cli.apply_to(AgentConfig::from_env_or_default()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        },
    };
    info!("🚀️ Running {:?}", cli.command);
    let result = match cli.command {
        Command::Watch { no_schedule } => commands::watch(config, no_schedule).await,
        Command::List => commands::list(config).await,
        Command::Accept { order_id } => commands::accept(config, order_id).await,
        Command::UpstreamSync => commands::upstream_sync(config).await,
        Command::Schedule => commands::schedule(config),
    };
    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
