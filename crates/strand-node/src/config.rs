//! Configuration types for strand-node.
//!
//! `NodeConfig` is the operator file (~/.strand/config.toml); `ServerConfig`
//! is what a `Server` is built from and stays read-only once it starts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use strand_crypto::NodeKey;

use crate::protocol::Protocol;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no private key configured")]
    MissingKey,
    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },
    #[error("invalid protocol {name}/{version}: {reason}")]
    InvalidProtocol {
        name: String,
        version: u32,
        reason: &'static str,
    },
    #[error("protocol {name}/{version} registered twice")]
    DuplicateProtocol { name: String, version: u32 },
    #[error("tls setup failed: {0}")]
    Tls(String),
}

// ============================================================================
// Operator config file
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_identity_key")]
    pub identity_key: String,
    #[serde(default = "default_api_transport")]
    pub api_transport: String,
    pub api_socket: Option<String>,
    #[serde(default = "default_api_addr")]
    pub api_addr: Option<String>,
    /// Bearer token file; no auth when unset.
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// `host:port`, `:port`, or empty for outbound-only.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_true")]
    pub enable_msg_events: bool,
    /// Node URIs dialed at startup.
    #[serde(default)]
    pub bootnodes: Vec<String>,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            identity_key: default_identity_key(),
            api_transport: default_api_transport(),
            api_socket: Some("~/.strand/node.sock".into()),
            api_addr: default_api_addr(),
            api_token: None,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_peers: default_max_peers(),
            enable_msg_events: true,
            bootnodes: Vec::new(),
            keepalive_interval_secs: default_keepalive_interval(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

// Default value functions
fn default_name() -> String {
    "strand".into()
}
fn default_identity_key() -> String {
    "~/.strand/node.key".into()
}
fn default_api_transport() -> String {
    "http".into()
}
fn default_api_addr() -> Option<String> {
    Some("127.0.0.1:8645".into())
}
fn default_listen_addr() -> String {
    ":30303".into()
}
fn default_max_peers() -> usize {
    25
}
fn default_true() -> bool {
    true
}
fn default_keepalive_interval() -> u64 {
    strand_protocol::KEEPALIVE_INTERVAL_SECS
}
fn default_shutdown_grace() -> u64 {
    2000
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Build the runtime server config around a loaded key.
    pub fn server_config(&self, key: Arc<NodeKey>, protocols: Vec<Protocol>) -> ServerConfig {
        ServerConfig {
            private_key: Some(key),
            name: make_name(&self.node.name, env!("CARGO_PKG_VERSION")),
            listen_addr: Some(self.network.listen_addr.clone()),
            max_peers: self.network.max_peers,
            protocols,
            enable_msg_events: self.network.enable_msg_events,
            shutdown_grace: Duration::from_millis(self.network.shutdown_grace_ms),
        }
    }
}

// ============================================================================
// Server config
// ============================================================================

/// Runtime configuration for one `Server`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub private_key: Option<Arc<NodeKey>>,
    /// Display name sent in the handshake.
    pub name: String,
    /// `None` or `""` disables inbound listening.
    pub listen_addr: Option<String>,
    /// 0 admits nobody.
    pub max_peers: usize,
    pub protocols: Vec<Protocol>,
    pub enable_msg_events: bool,
    /// How long runners get to return after their peer is torn down.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            name: make_name("strand", env!("CARGO_PKG_VERSION")),
            listen_addr: None,
            max_peers: default_max_peers(),
            protocols: Vec::new(),
            enable_msg_events: false,
            shutdown_grace: Duration::from_millis(default_shutdown_grace()),
        }
    }
}

/// Start-time view of a checked `ServerConfig`.
pub(crate) struct Validated {
    pub key: Arc<NodeKey>,
    pub listen: Option<SocketAddr>,
}

impl ServerConfig {
    pub(crate) fn validate(&self) -> Result<Validated, ConfigError> {
        let key = self.private_key.clone().ok_or(ConfigError::MissingKey)?;
        let listen = parse_listen_addr(self.listen_addr.as_deref())?;

        let mut seen = HashSet::new();
        let mut total: u64 = 0;
        for p in &self.protocols {
            let invalid = |reason| ConfigError::InvalidProtocol {
                name: p.name.clone(),
                version: p.version,
                reason,
            };
            if p.name.is_empty() || p.name.contains('/') {
                return Err(invalid("name must be non-empty and contain no '/'"));
            }
            if p.length == 0 {
                return Err(invalid("message id space is empty"));
            }
            total = total
                .checked_add(p.length)
                .ok_or_else(|| invalid("message id space overflows"))?;
            if !seen.insert((p.name.as_str(), p.version)) {
                return Err(ConfigError::DuplicateProtocol {
                    name: p.name.clone(),
                    version: p.version,
                });
            }
        }

        Ok(Validated { key, listen })
    }
}

/// Parse a listen address. Empty means outbound-only; `:port` binds every
/// IPv4 interface.
pub fn parse_listen_addr(addr: Option<&str>) -> Result<Option<SocketAddr>, ConfigError> {
    let addr = match addr.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(a) => a,
    };
    let invalid = |reason: String| ConfigError::InvalidListenAddr {
        addr: addr.to_string(),
        reason,
    };

    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| invalid(format!("bad port: {e}")))?;
        return Ok(Some(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)));
    }
    addr.parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

/// Conventional display name: `name/vVERSION/OS-ARCH/rust`.
pub fn make_name(name: &str, version: &str) -> String {
    format!(
        "{name}/v{version}/{}-{}/rust",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
