use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jobsync_common::Secret;

use crate::{
    config::{parse_api_url, AgentConfig},
    errors::AgentError,
};

#[derive(Parser, Debug)]
#[command(version, about = "Keeps a partner's job orders in sync with the order service")]
pub struct Arguments {
    /// Base url of the order service. Overrides JOBSYNC_API_URL
    #[arg(short = 'u', long = "api-url")]
    api_url: Option<String>,
    /// The subject token to authenticate with. Overrides JOBSYNC_SUBJECT_TOKEN
    #[arg(short = 't', long = "token")]
    token: Option<String>,
    /// A state file shared with other agent processes. Overrides JOBSYNC_KV_PATH
    #[arg(short = 'k', long = "kv-path")]
    kv_path: Option<PathBuf>,
    /// The id this process uses in the shared state file. Overrides JOBSYNC_CONTEXT_ID
    #[arg(long = "context-id")]
    context_id: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Keep fetching orders on a schedule and print changes until interrupted
    #[clap(name = "watch")]
    Watch {
        /// Follow the schedule set by other processes, but do not switch automatic fetching on
        #[arg(long = "no-schedule")]
        no_schedule: bool,
    },
    /// Fetch the orders once and print them
    #[clap(name = "list")]
    List,
    /// Accept an order for the signed-in subject
    #[clap(name = "accept")]
    Accept { order_id: String },
    /// Ask the order service to refresh from the upstream system of record
    #[clap(name = "upstream-sync")]
    UpstreamSync,
    /// Print the persisted schedule shared by the agent processes
    #[clap(name = "schedule")]
    Schedule,
}

impl Arguments {
    /// Applies the command line flags on top of the environment configuration.
    pub fn apply_to(&self, mut config: AgentConfig) -> Result<AgentConfig, AgentError> {
        if let Some(url) = &self.api_url {
            config.api_url = parse_api_url(url)?;
        }
        if let Some(token) = self.token.as_ref().filter(|t| !t.trim().is_empty()) {
            config.subject_token = Some(Secret::new(token.trim().to_string()));
        }
        if let Some(path) = &self.kv_path {
            config.kv_path = Some(path.clone());
        }
        if let Some(id) = &self.context_id {
            config.context_id = Some(id.clone());
        }
        Ok(config)
    }
}
