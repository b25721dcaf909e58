//! Configuration with layered resolution using figment.
//!
//! Resolution order (highest priority last):
//! 1. User config: `~/.config/nvim-rpc/config.toml` (XDG) or platform config dir
//! 2. Project config: `.nvim-rpc.toml`
//! 3. Environment variables: `NVIM_RPC_*`, nested keys separated by `__`
//!    (e.g. `NVIM_RPC_CONNECTION__ADDRESS=/tmp/nvim.sock`)
//!
//! Command-line flags are applied on top by the binary.
//!
//! ```toml
//! [connection]
//! address = "127.0.0.1:6666"
//! nvim_path = "/usr/local/bin/nvim"
//!
//! [client]
//! sender_workers = 1
//! ```

use std::ops::Deref;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::client::ClientConfig;
use crate::connection::Address;
use crate::rpc::sender::DEFAULT_WORKERS;

/// File name of the project-level config.
pub const PROJECT_CONFIG: &str = ".nvim-rpc.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "NVIM_RPC_";

/// Boxed wrapper for figment::Error to reduce Result size on the stack.
#[derive(Debug)]
pub struct ConfigError(Box<figment::Error>);

impl Deref for ConfigError {
    type Target = figment::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}

/// Root configuration structure. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub client: ClientSection,
}

/// Where and how to reach Neovim.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Socket path or `host:port`. Discovered when unset.
    #[serde(default)]
    pub address: Option<String>,
    /// Binary spawned for `--embed`.
    #[serde(default = "default_nvim_path")]
    pub nvim_path: PathBuf,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: None,
            nvim_path: default_nvim_path(),
        }
    }
}

fn default_nvim_path() -> PathBuf {
    PathBuf::from("nvim")
}

/// `[client]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_sender_workers")]
    pub sender_workers: usize,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            sender_workers: default_sender_workers(),
        }
    }
}

fn default_sender_workers() -> usize {
    DEFAULT_WORKERS
}

impl Config {
    /// Load config with layered resolution (user → project → env).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::user_config_path(), Path::new(PROJECT_CONFIG))
    }

    /// Same as [`load`](Self::load) with explicit file locations.
    pub fn load_from(user_config: &Path, project_config: &Path) -> Result<Self, ConfigError> {
        Figment::new()
            // Layer 1: User config (lowest priority)
            .merge(Toml::file(user_config))
            // Layer 2: Project config
            .merge(Toml::file(project_config))
            // Layer 3: Environment variables (highest priority)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
    }

    /// The configured address, parsed.
    pub fn address(&self) -> Option<Address> {
        self.connection.address.as_deref().map(Address::parse)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            sender_workers: self.client.sender_workers,
        }
    }

    /// User config path: ~/.config/nvim-rpc/config.toml (XDG) or platform config dir.
    fn user_config_path() -> PathBuf {
        // Prefer XDG config location (~/.config) on all platforms
        if let Some(home) = dirs::home_dir() {
            let xdg_path = home.join(".config").join("nvim-rpc").join("config.toml");
            if xdg_path.exists() {
                return xdg_path;
            }
        }
        // Fall back to platform-specific config dir
        dirs::config_dir()
            .map(|p| p.join("nvim-rpc").join("config.toml"))
            .unwrap_or_default()
    }
}
