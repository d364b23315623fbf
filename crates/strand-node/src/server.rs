//! Server -- owns the endpoint, runs accept and dial tasks, admits peers and
//! publishes their lifecycle.
//!
//! Every task the server spawns goes on one `TaskTracker`; `stop()` cancels
//! the shared token and waits on the tracker once.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use strand_crypto::NodeKey;
use strand_protocol::{close_code, Capability, NodeId, NodeIdentity, DIAL_TIMEOUT_SECS, HANDSHAKE_TIMEOUT_SECS};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{ConfigError, ServerConfig, Validated};
use crate::event::{EventBus, PeerEvent, Subscription};
use crate::handshake::{self, HandshakeError, Handshaked, LocalHello};
use crate::peer::{Peer, PeerHandle, PeerInfo};
use crate::peer_set::PeerSet;
use crate::protocol::{match_protocols, Protocol};
use crate::transport::{QuicTransport, TransportError};

/// Extra time `stop()` allows past the runner grace before forcing the
/// endpoint closed.
const STOP_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("server already running")]
    AlreadyRunning,
    #[error("server not running")]
    NotRunning,
    #[error("server stopped")]
    Stopped,
    #[error("{0} is not dialable")]
    Unreachable(NodeIdentity),
}

/// Static facts about the running node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub uri: NodeIdentity,
    pub ip: IpAddr,
    /// Bound listen address; `None` when outbound-only.
    pub listen_addr: Option<SocketAddr>,
    pub protocols: Vec<String>,
}

enum State {
    Created,
    Running(Arc<NetContext>),
    Stopped,
}

/// Shared by every task of one server run.
struct NetContext {
    key: Arc<NodeKey>,
    self_identity: NodeIdentity,
    listen_addr: Option<SocketAddr>,
    transport: QuicTransport,
    peers: PeerSet,
    events: EventBus,
    protocols: Vec<Protocol>,
    caps: Vec<Capability>,
    name: String,
    msg_events: bool,
    grace: Duration,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    started_at: Instant,
}

impl NetContext {
    fn local_hello(&self) -> LocalHello<'_> {
        LocalHello {
            key: &self.key,
            id: self.self_identity.id,
            name: &self.name,
            caps: &self.caps,
            listen_port: self.self_identity.port,
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    state: Mutex<State>,
    events: EventBus,
}

/// Handle to a peer-to-peer server. Clones share the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                state: Mutex::new(State::Created),
                events: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Validate the config, bind, and start accepting. Must be called from
    /// within a tokio runtime. A failed start leaves the server startable.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut state = self.state();
        match *state {
            State::Running(_) => return Err(ServerError::AlreadyRunning),
            State::Stopped => return Err(ServerError::Stopped),
            State::Created => {}
        }

        let config = &self.inner.config;
        let Validated { key, listen } = config.validate()?;
        let transport = QuicTransport::bind(listen, key.pkcs8_der()).map_err(|e| match e {
            TransportError::Bind { addr, source } => ServerError::Bind { addr, source },
            other => ServerError::Config(ConfigError::Tls(other.to_string())),
        })?;

        let id = NodeId::from_bytes(key.public_key());
        let listen_addr = match listen {
            Some(requested) => Some(
                transport
                    .local_addr()
                    .map_err(|source| ServerError::Bind { addr: requested, source })?,
            ),
            None => None,
        };
        let advertised = match listen_addr {
            Some(bound) => SocketAddr::new(advertised_ip(bound.ip()), bound.port()),
            None => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        };
        let self_identity = NodeIdentity::new(id, advertised);

        let mut caps: Vec<Capability> = config.protocols.iter().map(Protocol::cap).collect();
        caps.sort();

        let ctx = Arc::new(NetContext {
            key,
            self_identity,
            listen_addr,
            transport,
            peers: PeerSet::new(id, config.max_peers),
            events: self.inner.events.clone(),
            protocols: config.protocols.clone(),
            caps,
            name: config.name.clone(),
            msg_events: config.enable_msg_events,
            grace: config.shutdown_grace,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started_at: Instant::now(),
        });

        if ctx.transport.is_listening() {
            ctx.tasks.spawn(accept_loop(ctx.clone()));
        }

        tracing::info!(
            node = %self_identity,
            listening = listen_addr.is_some(),
            max_peers = config.max_peers,
            protocols = ctx.caps.len(),
            "net: server started"
        );
        *state = State::Running(ctx);
        Ok(())
    }

    /// Disconnect every peer, wait for all tasks, close the endpoint and
    /// the event bus. The server cannot be restarted.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state(), State::Stopped);
        let ctx = match previous {
            State::Running(ctx) => ctx,
            State::Created | State::Stopped => {
                self.inner.events.close();
                return;
            }
        };

        tracing::info!(peers = ctx.peers.len().await, "net: server stopping");
        ctx.shutdown.cancel();
        ctx.tasks.close();

        if tokio::time::timeout(ctx.grace + STOP_SLACK, ctx.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(pending = ctx.tasks.len(), "net: tasks still running, closing endpoint");
            ctx.transport.close(close_code::REQUESTED, b"server stopping");
            if tokio::time::timeout(ctx.grace + STOP_SLACK, ctx.tasks.wait())
                .await
                .is_err()
            {
                tracing::warn!(pending = ctx.tasks.len(), "net: tasks did not exit");
            }
        }

        ctx.transport.close(close_code::REQUESTED, b"server stopped");
        let _ = tokio::time::timeout(ctx.grace, ctx.transport.wait_idle()).await;
        self.inner.events.close();
        tracing::info!(
            events = self.inner.events.published_count(),
            dropped_events = self.inner.events.dropped_count(),
            "net: server stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state(), State::Running(_))
    }

    /// Dial `node` in the background. Only synchronous problems are
    /// reported; the outcome shows up as events and in `peers()`.
    pub fn add_peer(&self, node: NodeIdentity) -> Result<(), ServerError> {
        let ctx = self.running()?;
        if !node.is_dialable() {
            return Err(ServerError::Unreachable(node));
        }
        let task_ctx = ctx.clone();
        ctx.tasks.spawn(dial(task_ctx, node));
        Ok(())
    }

    /// This node's identity, available once started.
    pub fn self_identity(&self) -> Option<NodeIdentity> {
        self.context().map(|ctx| ctx.self_identity)
    }

    pub fn node_info(&self) -> Option<NodeInfo> {
        self.context().map(|ctx| NodeInfo {
            id: ctx.self_identity.id,
            name: ctx.name.clone(),
            uri: ctx.self_identity,
            ip: ctx.self_identity.ip,
            listen_addr: ctx.listen_addr,
            protocols: ctx.caps.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Time since start; `None` unless running.
    pub fn uptime(&self) -> Option<Duration> {
        self.context().map(|ctx| ctx.started_at.elapsed())
    }

    /// Snapshot of connected peers.
    pub async fn peers(&self) -> Vec<NodeIdentity> {
        match self.context() {
            Some(ctx) => ctx.peers.snapshot().await,
            None => Vec::new(),
        }
    }

    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        match self.context() {
            Some(ctx) => ctx.peers.infos().await,
            None => Vec::new(),
        }
    }

    pub async fn peer_count(&self) -> usize {
        match self.context() {
            Some(ctx) => ctx.peers.len().await,
            None => 0,
        }
    }

    /// Tear down the connection to `id`. Returns false if not connected.
    pub async fn disconnect_peer(&self, id: &NodeId) -> bool {
        let Some(ctx) = self.context() else {
            return false;
        };
        match ctx.peers.get(id).await {
            Some(handle) => {
                handle.disconnect();
                true
            }
            None => false,
        }
    }

    /// Register an event sink. Valid in every state; after `stop()` the
    /// subscription is inactive and the sink is dropped.
    pub fn subscribe_events(&self, sink: mpsc::Sender<PeerEvent>) -> Subscription {
        self.inner.events.subscribe(sink)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> Option<Arc<NetContext>> {
        match &*self.state() {
            State::Running(ctx) => Some(ctx.clone()),
            _ => None,
        }
    }

    fn running(&self) -> Result<Arc<NetContext>, ServerError> {
        match &*self.state() {
            State::Running(ctx) => Ok(ctx.clone()),
            State::Created => Err(ServerError::NotRunning),
            State::Stopped => Err(ServerError::Stopped),
        }
    }
}

/// A wildcard bind is advertised as loopback of the same family.
fn advertised_ip(bound: IpAddr) -> IpAddr {
    match bound {
        IpAddr::V4(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.into(),
        IpAddr::V6(ip) if ip.is_unspecified() => Ipv6Addr::LOCALHOST.into(),
        ip => ip,
    }
}

// ============================================================================
// Connection tasks
// ============================================================================

async fn accept_loop(ctx: Arc<NetContext>) {
    loop {
        let incoming = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            incoming = ctx.transport.accept() => match incoming {
                Some(i) => i,
                None => break,
            },
        };
        let remote = incoming.remote_address();
        let connecting = match incoming.accept() {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(%remote, error = %e, "net: inbound refused by transport");
                continue;
            }
        };

        let task_ctx = ctx.clone();
        ctx.tasks.spawn(async move {
            let connected = tokio::select! {
                _ = task_ctx.shutdown.cancelled() => return,
                res = tokio::time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), connecting) => res,
            };
            match connected {
                Ok(Ok(conn)) => setup_conn(task_ctx, conn, None).await,
                Ok(Err(e)) => tracing::debug!(%remote, error = %e, "net: inbound connection failed"),
                Err(_) => tracing::debug!(%remote, "net: inbound connection timed out"),
            }
        });
    }
    tracing::debug!("net: accept loop stopped");
}

async fn dial(ctx: Arc<NetContext>, node: NodeIdentity) {
    if ctx.peers.contains(&node.id).await {
        tracing::debug!(peer = %node, "net: already connected, dial skipped");
        return;
    }

    let connecting = tokio::time::timeout(
        Duration::from_secs(DIAL_TIMEOUT_SECS),
        ctx.transport.dial(node.socket_addr()),
    );
    let connected = tokio::select! {
        _ = ctx.shutdown.cancelled() => return,
        res = connecting => res,
    };
    match connected {
        Ok(Ok(conn)) => setup_conn(ctx, conn, Some(node)).await,
        Ok(Err(e)) => tracing::info!(peer = %node, error = %e, "net: dial failed"),
        Err(_) => tracing::info!(peer = %node, "net: dial timed out"),
    }
}

/// Handshake, admit, run. Becomes the peer task on success.
async fn setup_conn(ctx: Arc<NetContext>, conn: quinn::Connection, dialed: Option<NodeIdentity>) {
    let remote_addr = conn.remote_address();
    let inbound = dialed.is_none();
    let handshake_timeout = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

    let exchanged = {
        let local = ctx.local_hello();
        let exchange = async {
            match dialed {
                Some(node) => handshake::initiate(&conn, &local, node).await,
                None => handshake::respond(&conn, &local).await,
            }
        };
        tokio::select! {
            _ = ctx.shutdown.cancelled() => Err(HandshakeError::Closed),
            res = tokio::time::timeout(handshake_timeout, exchange) => res.unwrap_or(Err(HandshakeError::Timeout)),
        }
    };
    let mut hs = match exchanged {
        Ok(hs) => hs,
        Err(e) => {
            tracing::debug!(%remote_addr, inbound, error = %e, "net: handshake failed");
            conn.close(quinn::VarInt::from_u32(e.close_code()), b"handshake failed");
            return;
        }
    };

    let matched = match_protocols(&ctx.protocols, &hs.caps);
    let handle = PeerHandle::new(
        hs.remote,
        hs.name.clone(),
        hs.caps.clone(),
        remote_addr,
        inbound,
        conn.stable_id(),
        ctx.shutdown.child_token(),
    );
    let useless = !ctx.protocols.is_empty() && matched.is_empty();
    let replaced = match ctx.peers.admit(handle.clone(), useless).await {
        Ok(replaced) => replaced,
        Err(reason) => {
            tracing::info!(peer = %hs.remote, inbound, %reason, "net: peer refused");
            hs.refuse(&conn, reason).await;
            return;
        }
    };
    let _finished = handle.finish_guard();

    // the handle's token is a child of shutdown
    let confirmed = tokio::select! {
        _ = handle.disconnected() => Err(HandshakeError::Closed),
        res = tokio::time::timeout(handshake_timeout, hs.confirm()) => res.unwrap_or(Err(HandshakeError::Timeout)),
    };
    if let Err(e) = confirmed {
        ctx.peers.remove(&handle.id(), handle.conn_id()).await;
        tracing::info!(peer = %hs.remote, inbound, error = %e, "net: admission not confirmed");
        conn.close(quinn::VarInt::from_u32(e.close_code()), b"not admitted");
        return;
    }

    // the replaced connection publishes its Drop before our Add
    if let Some(old) = replaced {
        tokio::select! {
            _ = handle.disconnected() => {}
            _ = old.finished() => {}
        }
    }
    if handle.is_disconnected() || !ctx.peers.establish(&handle.id(), handle.conn_id()).await {
        ctx.peers.remove(&handle.id(), handle.conn_id()).await;
        tracing::debug!(peer = %hs.remote, inbound, "net: connection replaced before start");
        conn.close(quinn::VarInt::from_u32(close_code::REQUESTED), b"replaced");
        return;
    }

    run_peer(&ctx, handle, conn, hs, matched).await;
}

async fn run_peer(
    ctx: &NetContext,
    handle: PeerHandle,
    conn: quinn::Connection,
    hs: Handshaked,
    protocols: Vec<crate::protocol::MatchedProtocol>,
) {
    let peer = handle.identity();
    tracing::info!(
        %peer,
        inbound = handle.is_inbound(),
        name = %handle.name(),
        version = hs.version,
        protocols = protocols.len(),
        "net: peer connected"
    );
    ctx.events.publish(PeerEvent::add(peer));

    let Handshaked { send, reader, .. } = hs;
    let error = Peer {
        handle: handle.clone(),
        conn,
        reader,
        send,
        protocols,
        events: ctx.events.clone(),
        msg_events: ctx.msg_events,
        grace: ctx.grace,
    }
    .run()
    .await;

    ctx.peers.remove(&peer.id, handle.conn_id()).await;
    let error = error.map(|e| e.to_string());
    tracing::info!(%peer, error = error.as_deref().unwrap_or("none"), "net: peer disconnected");
    ctx.events.publish(PeerEvent::drop(peer, error));
}
