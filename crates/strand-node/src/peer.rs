//! Peer -- one admitted connection: demultiplexes inbound frames to protocol
//! runners and owns their lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strand_protocol::{close_code, Capability, FrameCodec, Msg, NodeId, NodeIdentity, ProtocolError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::event::EventBus;
use crate::protocol::{FrameWriter, MatchedProtocol, ProtocolStream};
use crate::transport::{StreamReader, TransportError};

/// Frames buffered per runner before the read loop waits on it.
const INBOX_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("transport: {0}")]
    Transport(TransportError),
    #[error("framing: {0}")]
    Framing(ProtocolError),
    #[error("protocol {protocol} failed: {message}")]
    Runner { protocol: String, message: String },
    #[error("protocol runner panicked")]
    RunnerPanicked,
    #[error("disconnect requested")]
    DisconnectRequested,
    #[error("remote closed the connection")]
    RemoteClosed,
}

impl From<TransportError> for PeerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Protocol(p) => PeerError::Framing(p),
            other => PeerError::Transport(other),
        }
    }
}

impl PeerError {
    fn close_code(&self) -> u32 {
        match self {
            PeerError::Framing(_) => close_code::PROTOCOL_ERROR,
            PeerError::Runner { .. } | PeerError::RunnerPanicked => close_code::RUNNER_ERROR,
            PeerError::Transport(_) | PeerError::DisconnectRequested | PeerError::RemoteClosed => {
                close_code::REQUESTED
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

struct PeerShared {
    identity: NodeIdentity,
    name: String,
    caps: Vec<Capability>,
    remote_addr: SocketAddr,
    inbound: bool,
    connected_at: DateTime<Utc>,
    conn_id: usize,
    disconnect: CancellationToken,
    /// Cancelled once the connection's task has finished with the peer.
    finished: CancellationToken,
}

/// Read-only view of a connected peer, handed to protocol runners and kept
/// in the peer set.
#[derive(Clone)]
pub struct PeerHandle {
    inner: Arc<PeerShared>,
}

/// Serializable snapshot of a peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub uri: NodeIdentity,
    pub name: String,
    pub caps: Vec<String>,
    pub remote_addr: SocketAddr,
    pub inbound: bool,
    pub connected_at: DateTime<Utc>,
}

impl PeerHandle {
    pub(crate) fn new(
        identity: NodeIdentity,
        name: String,
        caps: Vec<Capability>,
        remote_addr: SocketAddr,
        inbound: bool,
        conn_id: usize,
        disconnect: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PeerShared {
                identity,
                name,
                caps,
                remote_addr,
                inbound,
                connected_at: Utc::now(),
                conn_id,
                disconnect,
                finished: CancellationToken::new(),
            }),
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.inner.identity
    }

    pub fn id(&self) -> NodeId {
        self.inner.identity.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn caps(&self) -> &[Capability] {
        &self.inner.caps
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// True when the remote dialed us.
    pub fn is_inbound(&self) -> bool {
        self.inner.inbound
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub(crate) fn conn_id(&self) -> usize {
        self.inner.conn_id
    }

    /// Ask the peer to tear down. Runners see `ProtocolError::Closed`.
    pub fn disconnect(&self) {
        self.inner.disconnect.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnect.is_cancelled()
    }

    pub(crate) async fn disconnected(&self) {
        self.inner.disconnect.cancelled().await
    }

    /// Marks the peer finished when dropped.
    pub(crate) fn finish_guard(&self) -> DropGuard {
        self.inner.finished.clone().drop_guard()
    }

    /// Resolves once the connection task is done, Drop event included.
    pub(crate) async fn finished(&self) {
        self.inner.finished.cancelled().await
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id(),
            uri: self.identity(),
            name: self.inner.name.clone(),
            caps: self.inner.caps.iter().map(|c| c.to_string()).collect(),
            remote_addr: self.inner.remote_addr,
            inbound: self.inner.inbound,
            connected_at: self.inner.connected_at,
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("identity", &self.inner.identity)
            .field("inbound", &self.inner.inbound)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Runtime
// ============================================================================

struct Route {
    offset: u64,
    length: u64,
    inbox: mpsc::Sender<Msg>,
}

/// Everything needed to run an admitted connection.
pub(crate) struct Peer {
    pub handle: PeerHandle,
    pub conn: quinn::Connection,
    pub reader: StreamReader,
    pub send: quinn::SendStream,
    pub protocols: Vec<MatchedProtocol>,
    pub events: EventBus,
    pub msg_events: bool,
    pub grace: Duration,
}

impl Peer {
    /// Run until the first runner exits, the connection fails, or a
    /// disconnect is requested. Returns the reason for the drop; `None`
    /// when a runner finished cleanly.
    pub async fn run(self) -> Option<PeerError> {
        let Peer {
            handle,
            conn,
            mut reader,
            send,
            protocols,
            events,
            msg_events,
            grace,
        } = self;
        let peer = handle.identity();
        let writer = Arc::new(FrameWriter::new(send));
        let closed = CancellationToken::new();

        let mut routes = Vec::with_capacity(protocols.len());
        let mut runners = JoinSet::new();
        for m in &protocols {
            let cap = m.protocol.cap();
            let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
            routes.push(Route {
                offset: m.offset,
                length: m.protocol.length,
                inbox: tx,
            });
            let stream = ProtocolStream::new(
                &cap,
                m.offset,
                m.protocol.length,
                rx,
                writer.clone(),
                closed.clone(),
                msg_events.then(|| (events.clone(), peer)),
            );
            let fut = m.protocol.start(handle.clone(), stream);
            let key = cap.to_string();
            runners.spawn(async move { (key, fut.await) });
        }
        tracing::debug!(%peer, protocols = routes.len(), "peer: runners started");

        let space: u64 = protocols.iter().map(|m| m.protocol.length).sum();
        let read_loop = demux(&mut reader, routes, space);
        tokio::pin!(read_loop);
        let mut read_done = false;
        let drain = tokio::time::sleep(grace);
        tokio::pin!(drain);
        let mut draining = false;

        let reason = loop {
            tokio::select! {
                outcome = &mut read_loop, if !read_done => {
                    read_done = true;
                    match outcome {
                        Ok(()) if runners.is_empty() => break Some(PeerError::RemoteClosed),
                        Ok(()) => {
                            // remote finished; let runners consume what is buffered
                            drain.as_mut().reset(Instant::now() + grace);
                            draining = true;
                        }
                        Err(e) => break Some(e),
                    }
                }
                joined = runners.join_next(), if !runners.is_empty() => {
                    break match joined {
                        Some(Ok((_, Ok(())))) => None,
                        Some(Ok((_, Err(e)))) if read_done && is_closed_error(&e) => Some(PeerError::RemoteClosed),
                        Some(Ok((protocol, Err(e)))) => Some(PeerError::Runner { protocol, message: format!("{e:#}") }),
                        Some(Err(e)) if e.is_panic() => Some(PeerError::RunnerPanicked),
                        Some(Err(_)) | None => Some(PeerError::DisconnectRequested),
                    };
                }
                _ = handle.inner.disconnect.cancelled() => break Some(PeerError::DisconnectRequested),
                _ = &mut drain, if draining => break Some(PeerError::RemoteClosed),
            }
        };

        // Clean exit: flush our side and give the remote a chance to
        // finish reading before the connection goes away.
        if reason.is_none() {
            let _ = tokio::time::timeout(grace, writer.finish()).await;
            if !read_done {
                let _ = tokio::time::timeout(grace, async {
                    tokio::select! {
                        _ = &mut read_loop => {}
                        _ = conn.closed() => {}
                    }
                })
                .await;
            }
        }

        closed.cancel();
        let (code, text): (u32, &[u8]) = match &reason {
            None => (close_code::NORMAL, &b"done"[..]),
            Some(e) => (e.close_code(), &b"peer dropped"[..]),
        };
        conn.close(quinn::VarInt::from_u32(code), text);

        if !runners.is_empty() {
            let drained = tokio::time::timeout(grace, async {
                while runners.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(%peer, pending = runners.len(), "peer: runners ignored close, aborting");
                runners.abort_all();
                while runners.join_next().await.is_some() {}
            }
        }

        match &reason {
            None => tracing::debug!(%peer, "peer: finished"),
            Some(e) => tracing::debug!(%peer, error = %e, "peer: dropped"),
        }
        reason
    }
}

/// Route inbound frames to runner inboxes until the stream ends.
async fn demux(reader: &mut StreamReader, routes: Vec<Route>, space: u64) -> Result<(), PeerError> {
    let mut codec = FrameCodec;
    while let Some(msg) = reader.next(&mut codec).await? {
        let route = routes
            .iter()
            .find(|r| msg.code >= r.offset && msg.code - r.offset < r.length)
            .ok_or(PeerError::Framing(ProtocolError::InvalidCode {
                code: msg.code,
                length: space,
            }))?;
        let local = Msg {
            code: msg.code - route.offset,
            payload: msg.payload,
        };
        if route.inbox.send(local).await.is_err() {
            tracing::trace!(code = msg.code, "peer: runner gone, frame discarded");
        }
    }
    Ok(())
}

fn is_closed_error(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| cause.downcast_ref::<ProtocolError>().is_some_and(ProtocolError::is_closed))
}
