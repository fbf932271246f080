use std::{env, path::PathBuf, time::Duration};

use jobsync_common::{helpers::env_or_default, Secret};
use jobsync_engine::{order_types::SubjectToken, EngineConfig};
use log::*;
use url::Url;

use crate::errors::AgentError;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8480/api/";
const DEFAULT_KV_POLL_MS: u64 = 250;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Base url of the order service. Routes are joined onto it, so it should end with a slash.
    pub api_url: Url,
    pub subject_token: Option<Secret<String>>,
    /// A file shared by every agent process on this machine. Without one, each process schedules on its own.
    pub kv_path: Option<PathBuf>,
    /// The context id this process writes to the shared file as. A random id is used when unset.
    pub context_id: Option<String>,
    pub kv_poll_interval: Duration,
    pub engine: EngineConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            subject_token: None,
            kv_path: None,
            context_id: None,
            kv_poll_interval: Duration::from_millis(DEFAULT_KV_POLL_MS),
            engine: EngineConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_env_or_default() -> Self {
        let api_url = env::var("JOBSYNC_API_URL")
            .ok()
            .and_then(|s| match parse_api_url(&s) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("🪛️ {e} Using the default, {DEFAULT_API_URL}, instead.");
                    None
                },
            })
            .unwrap_or_else(default_api_url);
        let subject_token = non_empty_var("JOBSYNC_SUBJECT_TOKEN").map(Secret::new);
        if subject_token.is_none() {
            warn!("🪛️ JOBSYNC_SUBJECT_TOKEN is not set. Orders cannot be fetched until a token is supplied.");
        }
        let kv_path = non_empty_var("JOBSYNC_KV_PATH").map(PathBuf::from);
        let context_id = non_empty_var("JOBSYNC_CONTEXT_ID");
        let kv_poll_interval = Duration::from_millis(env_or_default("JOBSYNC_KV_POLL_MS", DEFAULT_KV_POLL_MS).max(10));
        info!("🪛️ Order service at {api_url}. Shared state file: {kv_path:?}");
        Self {
            api_url,
            subject_token,
            kv_path,
            context_id,
            kv_poll_interval,
            engine: EngineConfig::from_env_or_default(),
        }
    }

    pub fn subject_token(&self) -> Option<SubjectToken> {
        self.subject_token.as_ref().map(|s| SubjectToken::new(s.reveal().as_str()))
    }
}

/// Parses a base url, adding the trailing slash `Url::join` needs to keep the last path segment.
pub fn parse_api_url(value: &str) -> Result<Url, AgentError> {
    let value = value.trim();
    let value = if value.ends_with('/') { value.to_string() } else { format!("{value}/") };
    Url::parse(&value).map_err(|e| AgentError::InvalidConfiguration(format!("'{value}' is not a valid API url. {e}")))
}

fn default_api_url() -> Url {
    Url::parse(DEFAULT_API_URL).unwrap_or_else(|_| unreachable!("DEFAULT_API_URL is a valid url"))
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
