//! Configuration for the socksix server binary
//!
//! Provides configuration types and TOML parsing.

use crate::error::SocksixError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

fn default_listen() -> String {
    "0.0.0.0:1080".to_string()
}

fn default_relay_idle_timeout() -> u64 {
    crate::helper::DEFAULT_RELAY_IDLE_TIMEOUT_SECS
}

fn default_bind_accept_timeout() -> u64 {
    crate::helper::DEFAULT_BIND_ACCEPT_TIMEOUT_SECS
}

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// UDP listen address for client datagrams; disabled when absent
    #[serde(default)]
    pub udp_listen: Option<String>,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Use address-dependent filtering for UDP associations
    /// (Restricted Cone instead of Full Cone)
    #[serde(default)]
    pub address_dependent_filtering: bool,

    /// Reject requests split across packets on secondary mux streams
    #[serde(default)]
    pub ignore_fragmented_request: bool,

    /// Relay ICMP errors into UDP associations
    #[serde(default)]
    pub enable_icmp: bool,

    /// Idle timeout for relayed connections, in seconds
    #[serde(default = "default_relay_idle_timeout")]
    pub relay_idle_timeout_secs: u64,

    /// How long a single-accept BIND waits for its upstream, in seconds
    #[serde(default = "default_bind_accept_timeout")]
    pub bind_accept_timeout_secs: u64,
}

/// Authentication section
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Refuse anonymous clients
    #[serde(default)]
    pub required: bool,
    /// Expected username
    pub username: Option<String>,
    /// Expected password
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            udp_listen: None,
            auth: AuthConfig::default(),
            address_dependent_filtering: false,
            ignore_fragmented_request: false,
            enable_icmp: false,
            relay_idle_timeout_secs: default_relay_idle_timeout(),
            bind_accept_timeout_secs: default_bind_accept_timeout(),
        }
    }
}

impl ServerConfig {
    /// Check the configuration for inconsistencies
    pub fn validate(&self) -> Result<(), SocksixError> {
        if self.auth.required && (self.auth.username.is_none() || self.auth.password.is_none()) {
            return Err(SocksixError::Config(
                "auth.required needs auth.username and auth.password".to_string(),
            ));
        }
        if self.auth.username.is_some() != self.auth.password.is_some() {
            return Err(SocksixError::Config(
                "auth.username and auth.password must be set together".to_string(),
            ));
        }
        if self.relay_idle_timeout_secs == 0 {
            return Err(SocksixError::Config(
                "relay_idle_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<ServerConfig> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
