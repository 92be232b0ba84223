//! Node Configuration
//!
//! `NodeArgs` is the command line / environment surface of the binary. Library code only
//! ever sees the plain `NodeConfig` derived from it.

use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COOKIE_NAME: &str = "ermes-session-token";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MIGRATION_ATTEMPTS: usize = 10;

#[derive(Parser, Debug, Clone)]
#[command(name = "ermes-node", about = "Edge node serving mobile sessions")]
pub struct NodeArgs {
    /// Address the HTTP server binds to.
    #[arg(long, env = "ERMES_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// `redis://...` for a Redis 7 server, `memory://` for the in-process engine.
    #[arg(long, env = "ERMES_STORE_URI", default_value = "redis://127.0.0.1:6379")]
    pub store_uri: String,

    #[arg(long, env = "LOCATION_ID")]
    pub location_id: String,

    /// Public base URL of this node. Defaults to the one in the infrastructure tree.
    #[arg(long, env = "ERMES_GATEWAY")]
    pub gateway: Option<String>,

    #[arg(long, env = "ERMES_SESSION_TOKEN_COOKIE", default_value = DEFAULT_COOKIE_NAME)]
    pub cookie_name: String,

    #[arg(long, env = "ERMES_SESSION_DURATION", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,

    /// Where new clients go while this node rejects sessions. Defaults to the parent node.
    #[arg(long, env = "ERMES_REDIRECT_TO")]
    pub redirect_to: Option<String>,

    /// JSON infrastructure tree. Without it the tree is read from the store.
    #[arg(long, env = "ERMES_INFRASTRUCTURE")]
    pub infrastructure: Option<PathBuf>,

    #[arg(long, env = "ERMES_ACCEPT_OFFLOADING", default_value_t = true, action = ArgAction::Set)]
    pub accept_offloading: bool,

    /// Attempts made to lock a session before a migration gives up.
    #[arg(long, env = "ERMES_MIGRATION_ATTEMPTS", default_value_t = DEFAULT_MIGRATION_ATTEMPTS)]
    pub migration_attempts: usize,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub location_id: String,
    pub gateway: Option<String>,
    pub cookie_name: String,
    pub session_ttl: Duration,
    pub redirect_to: Option<String>,
    pub accept_offloading: bool,
    pub migration_attempts: usize,
}

impl NodeConfig {
    pub fn new(location_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            gateway: None,
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            redirect_to: None,
            accept_offloading: true,
            migration_attempts: DEFAULT_MIGRATION_ATTEMPTS,
        }
    }

    pub fn with_gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }
}

impl From<&NodeArgs> for NodeConfig {
    fn from(args: &NodeArgs) -> Self {
        Self {
            location_id: args.location_id.clone(),
            gateway: args.gateway.clone(),
            cookie_name: args.cookie_name.clone(),
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            redirect_to: args.redirect_to.clone(),
            accept_offloading: args.accept_offloading,
            migration_attempts: args.migration_attempts.max(1),
        }
    }
}
