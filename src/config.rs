//! Command-line and environment configuration
//!
//! Every flag falls back to an environment variable, so a `.env` file is
//! enough to run the relay.

use std::time::Duration;

use clap::Args;

use crate::relay::{RelayConfig, DEFAULT_DESCRIPTION, DEFAULT_NAME};
use crate::server::ServerConfig;
use crate::session::SessionCacheConfig;

/// The relay's own secret key.
#[derive(Args, Debug, Clone)]
pub struct SecretArgs {
    /// Relay secret key (hex)
    #[arg(long, env = "BURROW_SECRET", hide_env_values = true)]
    pub secret: String,
}

/// Where accounts and sessions are stored.
#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    #[arg(long, env = "BURROW_DATA_DIR", default_value = ".burrow")]
    pub data_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub secret: SecretArgs,

    #[command(flatten)]
    pub data: DataArgs,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Origin allowed to call the relay from a browser
    #[arg(long, env = "CLIENT_DOMAIN")]
    pub client_domain: Option<String>,

    #[arg(long, env = "RELAY_NAME", default_value = DEFAULT_NAME)]
    pub relay_name: String,

    #[arg(long, env = "RELAY_DESCRIPTION", default_value = DEFAULT_DESCRIPTION)]
    pub relay_description: String,

    #[arg(long, env = "RELAY_ICON")]
    pub relay_icon: Option<String>,

    /// Idle seconds before a cached session is dropped
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 3600)]
    pub session_ttl_secs: u64,

    #[arg(long, env = "MAX_SESSIONS", default_value_t = 10_000)]
    pub max_sessions: usize,

    /// Per-connection outbound queue length
    #[arg(long, env = "OUTBOUND_QUEUE", default_value_t = 256)]
    pub outbound_queue: usize,

    /// Log every frame sent and received
    #[arg(long, env = "LOG_RELAY_MESSAGES")]
    pub log_relay_messages: bool,

    /// Log every decrypted NIP-46 request and response
    #[arg(long, env = "LOG_NIP46_MESSAGES")]
    pub log_nip46_messages: bool,
}

impl ServeArgs {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            name: self.relay_name.clone(),
            description: self.relay_description.clone(),
            icon: self.relay_icon.clone(),
            sessions: SessionCacheConfig {
                ttl: Duration::from_secs(self.session_ttl_secs),
                max_entries: self.max_sessions,
            },
            outbound_queue: self.outbound_queue,
            log_relay_messages: self.log_relay_messages,
            log_nip46_messages: self.log_nip46_messages,
            ..RelayConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            client_domain: self.client_domain.clone(),
            ..ServerConfig::default()
        }
    }
}
