use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use url::Url;

pub const APP_NAME: &str = "casechat";
pub const API_PREFIX: &str = "/api/v1";

#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about = "Case chat relay and terminal client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP back end (chat relay, history, cases, health)
    Serve(ServeArgs),
    /// Chat about a case from the terminal against a running back end
    Chat(ChatArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "CASECHAT_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Base URL of the drafting worker API
    #[arg(long, env = "WORKER_API_URL")]
    pub worker_api_url: String,

    /// SQLite database file (defaults to the XDG data directory)
    #[arg(long, env = "CASECHAT_DATABASE")]
    pub database: Option<PathBuf>,

    /// Restrict CORS to a single origin instead of allowing any
    #[arg(long, env = "CASECHAT_ALLOW_ORIGIN")]
    pub allow_origin: Option<String>,
}

impl ServeArgs {
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => default_db_path(),
        }
    }

    /// Validated worker base URL without a trailing slash.
    pub fn worker_base(&self) -> Result<String> {
        normalize_base_url(&self.worker_api_url)
    }
}

#[derive(Debug, Clone, Args)]
pub struct ChatArgs {
    /// Base URL of the casechat back end
    #[arg(long, env = "CASECHAT_SERVER", default_value = "http://127.0.0.1:3000")]
    pub server: String,

    /// Case to chat about
    #[arg(long = "case")]
    pub case_id: String,

    /// User id forwarded to the back end for history access
    #[arg(long, env = "CASECHAT_USER")]
    pub user: Option<String>,

    /// Workspace id forwarded to the back end for history access
    #[arg(long, env = "CASECHAT_WORKSPACE")]
    pub workspace: Option<String>,
}

fn default_db_path() -> Result<PathBuf> {
    let data_dir = match std::env::var("XDG_DATA_HOME") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => {
            let home = std::env::var("HOME").context("HOME not set")?;
            PathBuf::from(home).join(".local/share")
        }
    };
    Ok(data_dir.join(APP_NAME).join("casechat.db"))
}

pub fn normalize_base_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw).with_context(|| format!("Invalid base URL: {}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("Base URL must be http or https: {}", raw);
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}
