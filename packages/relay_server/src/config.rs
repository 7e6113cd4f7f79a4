use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use recoil_relay::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_PERSISTENCE_LIMIT, RelayConfig};

// =============================================================================
// Unified config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
//   relay.toml:      [relay]
//                    default_persistence_limit = 100
//
//   env var:         RECOIL_RELAY_RELAY__DEFAULT_PERSISTENCE_LIMIT=100
//                    (double underscore = nesting)

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
}

/// Listener tuning knobs (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Outbound messages buffered per port before broadcasts to it are dropped
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Relay tunables (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_persistence_limit")]
    pub default_persistence_limit: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            default_persistence_limit: default_persistence_limit(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7070
}

fn default_send_channel_capacity() -> usize {
    256
}

fn default_persistence_limit() -> usize {
    DEFAULT_PERSISTENCE_LIMIT
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

/// Build a figment that layers: defaults → config file → RECOIL_RELAY_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("RECOIL_RELAY_").split("__"))
}

/// Server runtime configuration derived from `[server]`
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub send_channel_capacity: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", fc.host, fc.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}:{}: {}", fc.host, fc.port, e))?;
        Ok(Self {
            addr,
            // A zero-capacity mpsc channel panics on creation
            send_channel_capacity: fc.send_channel_capacity.max(1),
        })
    }
}

impl RelayFileConfig {
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            default_persistence_limit: self.default_persistence_limit,
            max_message_bytes: self.max_message_bytes,
        }
    }
}
