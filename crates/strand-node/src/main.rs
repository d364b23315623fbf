//! Strand Node -- peer-to-peer server binary.
//!
//! Usage:
//!   strand-node                      # Run with default config
//!   strand-node --config path.toml   # Run with custom config
//!   strand-node identity             # Show node identity
//!   strand-node info|peers|status    # Query the running node

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use strand_api::{register_node_methods, AppState, MethodRegistry};
use strand_crypto::NodeKey;
use strand_node::config::NodeConfig;
use strand_node::ping::{self, PingConfig};
use strand_node::{expand_tilde, load_or_create_token, node_views, parse_bootnodes, Server};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "strand-node", about = "Strand peer-to-peer node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.strand/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or generate node identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Run the node (default)
    Run,
    /// Show node info (queries local API)
    Info,
    /// List connected peers
    Peers,
    /// Show node status
    Status,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity keypair
    Generate,
    /// Show current node identity
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strand_node=info,strand_api=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Identity { action }) => {
            let key_path = expand_tilde(&cfg.node.identity_key);
            match action {
                Some(IdentityAction::Generate) | None => {
                    let key = NodeKey::load_or_create(&key_path)?;
                    println!("Node ID: {}", key.public_key_hex());
                    println!("Key file: {}", key_path.display());
                }
                Some(IdentityAction::Show) => {
                    if key_path.exists() {
                        let key = NodeKey::from_file(&key_path)?;
                        println!("Node ID: {}", key.public_key_hex());
                    } else {
                        eprintln!("No identity found at {}", key_path.display());
                        std::process::exit(1);
                    }
                }
            }
        }
        Some(Commands::Run) | None => run_node(cfg).await?,
        Some(Commands::Info) => cli_rpc(&cfg, "strand_nodeInfo").await?,
        Some(Commands::Peers) => cli_rpc(&cfg, "strand_peers").await?,
        Some(Commands::Status) => cli_rpc(&cfg, "strand_status").await?,
    }

    Ok(())
}

/// Call a method on the local node API and print the result.
async fn cli_rpc(cfg: &NodeConfig, method: &str) -> anyhow::Result<()> {
    let addr = cfg.node.api_addr.as_deref().unwrap_or("127.0.0.1:8645");
    let url = format!("http://{addr}/");

    let mut request = reqwest::Client::new()
        .post(&url)
        .json(&json!({ "jsonrpc": "2.0", "method": method, "params": [], "id": 1 }));
    if let Some(token_file) = &cfg.node.api_token {
        let token_path = expand_tilde(token_file);
        if token_path.exists() {
            request = request.bearer_auth(std::fs::read_to_string(&token_path)?.trim());
        }
    }

    let resp = request.send().await?;
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        eprintln!("Error ({status}): {text}");
        std::process::exit(1);
    }

    let value: Value = serde_json::from_str(&text)?;
    if let Some(err) = value.get("error") {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
    println!("{}", serde_json::to_string_pretty(&value["result"])?);
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.identity_key);
    let key = Arc::new(NodeKey::load_or_create(&key_path)?);

    let keepalive = ping::protocol(PingConfig {
        interval: Duration::from_secs(cfg.network.keepalive_interval_secs),
        ..Default::default()
    });
    let server = Server::new(cfg.server_config(key, vec![keepalive]));
    server.start()?;

    if let Some(me) = server.self_identity() {
        tracing::info!(node = %me, version = env!("CARGO_PKG_VERSION"), "starting strand-node");
    }
    tracing::info!(
        listen = %cfg.network.listen_addr,
        max_peers = cfg.network.max_peers,
        api_transport = %cfg.node.api_transport,
        bootnodes = cfg.network.bootnodes.len(),
        "network config"
    );

    // Peer events go to the log
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let _events = server.subscribe_events(event_tx);
    let event_log = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            tracing::debug!(
                kind = ?ev.kind,
                peer = %ev.peer,
                protocol = ev.protocol.as_deref().unwrap_or(""),
                error = ev.error.as_deref().unwrap_or(""),
                "peer event"
            );
        }
    });

    for node in parse_bootnodes(&cfg.network.bootnodes) {
        if let Err(e) = server.add_peer(node) {
            tracing::warn!(peer = %node, error = %e, "net: bootnode skipped");
        }
    }

    // API
    let bearer_token = match &cfg.node.api_token {
        Some(path) => Some(load_or_create_token(&expand_tilde(path))?),
        None => None,
    };
    let mut registry = MethodRegistry::new();
    register_node_methods(&mut registry, node_views(&server))?;
    let router = strand_api::router(Arc::new(AppState { registry, bearer_token }));

    let shutdown = CancellationToken::new();
    let api_handle = match cfg.node.api_transport.as_str() {
        "http" => {
            let addr = cfg.node.api_addr.as_deref().unwrap_or("127.0.0.1:8645");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(addr, "API listening (HTTP)");
            tokio::spawn(strand_api::serve_http(listener, router, shutdown.clone().cancelled_owned()))
        }
        "unix" => {
            let sock_path = expand_tilde(cfg.node.api_socket.as_deref().unwrap_or("~/.strand/node.sock"));
            let _ = std::fs::remove_file(&sock_path);
            if let Some(parent) = sock_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = tokio::net::UnixListener::bind(&sock_path)?;
            tracing::info!(path = %sock_path.display(), "API listening (Unix socket)");
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                strand_api::serve_unix(listener, router, shutdown.cancelled_owned()).await;
                Ok::<(), std::io::Error>(())
            })
        }
        other => {
            server.stop().await;
            anyhow::bail!("unsupported api_transport: {other}");
        }
    };

    tracing::info!("node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    shutdown.cancel();
    server.stop().await;
    let (api, _) = tokio::join!(api_handle, event_log);
    if let Ok(Err(e)) = api {
        tracing::warn!(error = %e, "API server exited with error");
    }

    tracing::info!("shutdown complete");
    Ok(())
}
