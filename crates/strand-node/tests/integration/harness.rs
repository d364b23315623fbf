//! Test harness for in-process strand-node integration tests.
//!
//! Provides TestNode (a started server plus an event recorder),
//! TestNodeBuilder (config), and a few ready-made protocols.

use std::sync::Arc;
use std::time::Duration;

use strand_crypto::NodeKey;
use strand_node::{
    Msg, NodeId, NodeIdentity, PeerEvent, PeerEventKind, PeerHandle, Protocol, ProtocolError, ProtocolStream,
    Server, ServerConfig, Subscription,
};
use tokio::sync::mpsc;

/// Default wait for anything network-bound.
pub const WAIT: Duration = Duration::from_secs(10);

/// Collects every event a node publishes.
pub struct EventRecorder {
    rx: mpsc::Receiver<PeerEvent>,
    seen: Vec<PeerEvent>,
}

#[allow(dead_code)]
impl EventRecorder {
    /// Wait until an event of `kind` for `peer` arrives. Everything received
    /// on the way is kept.
    pub async fn wait_for(&mut self, kind: PeerEventKind, peer: NodeId) -> anyhow::Result<PeerEvent> {
        if let Some(ev) = self.seen.iter().find(|e| e.kind == kind && e.peer.id == peer) {
            return Ok(ev.clone());
        }
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let ev = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(ev)) => ev,
                Ok(None) => anyhow::bail!("event bus closed waiting for {kind:?} from {peer:?}"),
                Err(_) => anyhow::bail!("timeout waiting for {kind:?} from {peer:?}; seen {:?}", self.kinds()),
            };
            self.seen.push(ev.clone());
            if ev.kind == kind && ev.peer.id == peer {
                return Ok(ev);
            }
        }
    }

    /// Pull in whatever is buffered right now.
    pub fn drain(&mut self) -> &[PeerEvent] {
        while let Ok(ev) = self.rx.try_recv() {
            self.seen.push(ev);
        }
        &self.seen
    }

    /// Event kinds recorded for `peer`, in arrival order.
    pub fn sequence(&mut self, peer: NodeId) -> Vec<PeerEventKind> {
        self.drain()
            .iter()
            .filter(|e| e.peer.id == peer)
            .map(|e| e.kind)
            .collect()
    }

    pub fn kinds(&self) -> Vec<PeerEventKind> {
        self.seen.iter().map(|e| e.kind).collect()
    }
}

/// A started in-process server.
pub struct TestNode {
    pub server: Server,
    pub identity: NodeIdentity,
    pub events: EventRecorder,
    pub subscription: Subscription,
}

#[allow(dead_code)]
impl TestNode {
    pub fn id(&self) -> NodeId {
        self.identity.id
    }

    pub fn connect(&self, other: &TestNode) {
        self.server.add_peer(other.identity).unwrap();
    }

    /// Poll `peers()` until it holds exactly `n` entries.
    pub async fn wait_peers(&self, n: usize) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let peers = self.server.peers().await;
            if peers.len() == n {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for {n} peers (have {})", peers.len());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn has_peer(&self, id: NodeId) -> bool {
        self.server.peers().await.iter().any(|p| p.id == id)
    }

    pub async fn stop(&self) {
        self.server.stop().await;
    }
}

/// Builder for configuring and starting a TestNode.
pub struct TestNodeBuilder {
    name: String,
    protocols: Vec<Protocol>,
    max_peers: usize,
    listen: Option<String>,
    msg_events: bool,
    grace: Duration,
    event_buffer: usize,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            protocols: vec![],
            max_peers: 10,
            listen: Some("127.0.0.1:0".into()),
            msg_events: true,
            grace: Duration::from_millis(300),
            event_buffer: 256,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn max_peers(mut self, n: usize) -> Self {
        self.max_peers = n;
        self
    }

    pub fn outbound_only(mut self) -> Self {
        self.listen = None;
        self
    }

    pub fn msg_events(mut self, enabled: bool) -> Self {
        self.msg_events = enabled;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn build(self) -> anyhow::Result<TestNode> {
        let key = Arc::new(NodeKey::generate()?);
        let server = Server::new(ServerConfig {
            private_key: Some(key),
            name: self.name,
            listen_addr: self.listen,
            max_peers: self.max_peers,
            protocols: self.protocols,
            enable_msg_events: self.msg_events,
            shutdown_grace: self.grace,
        });

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let subscription = server.subscribe_events(tx);
        server.start()?;
        let identity = server
            .self_identity()
            .ok_or_else(|| anyhow::anyhow!("started server has no identity"))?;

        Ok(TestNode {
            server,
            identity,
            events: EventRecorder { rx, seen: Vec::new() },
            subscription,
        })
    }
}

// ============================================================================
// Protocols
// ============================================================================

/// `echo/1`: the dialer sends one message and waits for it to come back;
/// the listener bounces it.
pub fn echo_protocol() -> Protocol {
    Protocol::new("echo", 1, 1, |peer: PeerHandle, mut stream: ProtocolStream| async move {
        if peer.is_inbound() {
            let msg = stream.read_msg().await?;
            stream.write_msg(msg).await?;
        } else {
            stream.write_msg(Msg::new(0, &b"hello"[..])).await?;
            let reply = stream.read_msg().await?;
            anyhow::ensure!(reply.payload.as_ref() == b"hello", "echo mismatch");
        }
        Ok(())
    })
}

/// Sits on the stream until the peer goes away.
pub fn idle_protocol(name: &str) -> Protocol {
    Protocol::new(name, 1, 4, |_peer, mut stream: ProtocolStream| async move {
        loop {
            match stream.read_msg().await {
                Ok(_) => {}
                Err(ProtocolError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    })
}

/// Fails at once on the dialing side; the listening side waits.
pub fn failing_protocol() -> Protocol {
    Protocol::new("fail", 1, 1, |peer: PeerHandle, mut stream: ProtocolStream| async move {
        if peer.is_inbound() {
            while stream.read_msg().await.is_ok() {}
            return Ok(());
        }
        Err(anyhow::anyhow!("boom"))
    })
}

/// Ignores closure entirely.
pub fn stubborn_protocol() -> Protocol {
    Protocol::new("stubborn", 1, 1, |_peer, _stream| async {
        std::future::pending::<()>().await;
        Ok(())
    })
}
