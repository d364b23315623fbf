//! Strand Node -- library crate for the peer-to-peer server.
//!
//! Exposes the server, its config, the protocol runner framework and the
//! event bus so the binary, integration tests and embedders share one API.

pub mod config;
pub mod event;
pub mod handshake;
pub mod peer;
pub mod peer_set;
pub mod ping;
pub mod protocol;
pub mod server;
pub mod transport;

use std::path::{Path, PathBuf};

use serde_json::Value;
use strand_api::{BoxFuture, NodeViews};

pub use config::{make_name, ConfigError, NodeConfig, ServerConfig};
pub use event::{EventBus, PeerEvent, PeerEventKind, Subscription};
pub use peer::{PeerHandle, PeerInfo};
pub use protocol::{Protocol, ProtocolSender, ProtocolStream};
pub use server::{NodeInfo, Server, ServerError};
pub use strand_protocol::{Msg, NodeId, NodeIdentity, ProtocolError};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Read the API bearer token, generating a random one on first use.
pub fn load_or_create_token(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

/// Parse bootnode URIs, skipping (and logging) malformed entries.
pub fn parse_bootnodes(entries: &[String]) -> Vec<NodeIdentity> {
    entries
        .iter()
        .filter_map(|entry| match entry.parse::<NodeIdentity>() {
            Ok(node) => Some(node),
            Err(e) => {
                tracing::warn!(entry = %entry, error = %e, "net: ignoring bad bootnode");
                None
            }
        })
        .collect()
}

/// Read-only views of `server` for the RPC layer. They follow the server's
/// state, so a stopped server reports itself as not running.
pub fn node_views(server: &Server) -> NodeViews {
    let info_server = server.clone();
    let list_server = server.clone();
    let count_server = server.clone();
    let running_server = server.clone();
    let uptime_server = server.clone();
    NodeViews {
        node_info: Box::new(move || serde_json::to_value(info_server.node_info()).unwrap_or(Value::Null)),
        peer_list: Box::new(move || -> BoxFuture<Value> {
            let server = list_server.clone();
            Box::pin(async move { serde_json::to_value(server.peer_infos().await).unwrap_or(Value::Null) })
        }),
        peer_count: Box::new(move || -> BoxFuture<usize> {
            let server = count_server.clone();
            Box::pin(async move { server.peer_count().await })
        }),
        is_running: Box::new(move || running_server.is_running()),
        uptime: Box::new(move || uptime_server.uptime()),
    }
}
