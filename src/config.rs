use crate::auth::RedditCredentials;
use crate::types::{RelayError, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_USER_AGENT: &str = "forum-relay";
const DISCORD_API_BASE: &str = "https://discord.com/api/v10/";

/// Command-line surface; everything secret comes from the environment.
#[derive(Debug, Parser)]
#[command(name = "forum-relay", about = "Relays forum and subreddit updates into threads")]
pub struct Cli {
    /// Path to a JSON proxy list file (array of host:port[:user:pass], or
    /// an object with a proxyFetchUrl)
    #[arg(long)]
    pub proxies: Option<PathBuf>,

    /// Override the poll interval in seconds
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// SQLite database holding cursors and topic records
    #[arg(long, default_value = "sqlite://relay.db")]
    pub database: String,
}

/// Everything the pipeline needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub discord_token: String,
    pub forum_channel: String,
    pub forum_reddit_tag: String,
    pub forum_discourse_tag: String,

    pub reddit: RedditCredentials,
    /// Public Reddit base scoped to the watched subreddit.
    pub reddit_base: Url,
    /// Authenticated API base scoped to the watched subreddit.
    pub reddit_oauth_base: Url,
    pub discourse_base: Url,

    pub discord_api_base: Url,
    pub user_agent: String,
    pub poll_interval: Duration,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            discord_token: require("DISCORD_TOKEN")?,
            forum_channel: require("FORUM_CHANNEL")?,
            forum_reddit_tag: require("FORUM_REDDIT_TAG")?,
            forum_discourse_tag: require("FORUM_DISCOURSE_TAG")?,
            reddit: RedditCredentials {
                username: require("REDDIT_USER")?,
                password: require("REDDIT_PASSWORD")?,
                client_id: require("REDDIT_CLIENT_ID")?,
                client_secret: require("REDDIT_CLIENT_SECRET")?,
            },
            reddit_base: base_url("REDDIT_URL", "https://www.reddit.com/r/fsharp")?,
            reddit_oauth_base: base_url("REDDIT_OAUTH_URL", "https://oauth.reddit.com/r/fsharp")?,
            discourse_base: base_url("DISCOURSE_URL", "https://forums.fsharp.org")?,
            discord_api_base: Url::parse(DISCORD_API_BASE)?,
            user_agent: env::var("USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            poll_interval: Duration::from_secs(
                env::var("POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
        })
    }

    /// Token endpoint lives at the site root, not under the subreddit.
    pub fn reddit_token_url(&self) -> Result<Url> {
        Ok(self.reddit_base.join("/api/v1/access_token")?)
    }
}

fn require(name: &str) -> Result<String> {
    env::var(name).map_err(|_| RelayError::Config(format!("missing environment variable {name}")))
}

/// Read a base URL, normalized with a trailing slash so relative joins
/// stay inside the configured path.
fn base_url(name: &str, default: &str) -> Result<Url> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let normalized = format!("{}/", raw.trim_end_matches('/'));
    Url::parse(&normalized)
        .map_err(|e| RelayError::Config(format!("invalid URL in {name}: {e}")))
}
