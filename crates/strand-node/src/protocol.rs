//! Protocol runner framework: registration, code-space matching, and the
//! per-runner message stream.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use serde::Serialize;
use strand_protocol::{Capability, FrameCodec, Msg, NodeIdentity, ProtocolError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use crate::event::{EventBus, PeerEvent, PeerEventKind};
use crate::peer::PeerHandle;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Entry point of a protocol, run once per matching peer.
pub type RunFn = Arc<dyn Fn(PeerHandle, ProtocolStream) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// A named, versioned application protocol with its message-id space.
#[derive(Clone)]
pub struct Protocol {
    pub name: String,
    pub version: u32,
    /// Valid message codes are `0..length`.
    pub length: u64,
    run: RunFn,
}

impl Protocol {
    pub fn new<F, Fut>(name: impl Into<String>, version: u32, length: u64, run: F) -> Self
    where
        F: Fn(PeerHandle, ProtocolStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            version,
            length,
            run: Arc::new(move |peer: PeerHandle, stream: ProtocolStream| -> BoxFuture<anyhow::Result<()>> {
                Box::pin(run(peer, stream))
            }),
        }
    }

    pub fn cap(&self) -> Capability {
        Capability::new(self.name.clone(), self.version)
    }

    pub(crate) fn start(&self, peer: PeerHandle, stream: ProtocolStream) -> BoxFuture<anyhow::Result<()>> {
        (self.run)(peer, stream)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// A local protocol that the remote also speaks, with its slice of the
/// connection's code space.
#[derive(Debug, Clone)]
pub(crate) struct MatchedProtocol {
    pub protocol: Protocol,
    pub offset: u64,
}

/// Intersect local protocols with the remote's capabilities and lay their
/// code ranges out back to back.
///
/// Ranges are assigned in (name, version) order so both ends derive the same
/// layout from the same intersection.
pub(crate) fn match_protocols(local: &[Protocol], remote: &[Capability]) -> Vec<MatchedProtocol> {
    let mut shared: Vec<&Protocol> = local
        .iter()
        .filter(|p| remote.iter().any(|c| c.name == p.name && c.version == p.version))
        .collect();
    shared.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));

    let mut offset = 0u64;
    shared
        .into_iter()
        .map(|p| {
            let m = MatchedProtocol {
                protocol: p.clone(),
                offset,
            };
            offset += p.length;
            m
        })
        .collect()
}

// ============================================================================
// Stream plumbing
// ============================================================================

/// Serializes whole frames onto the shared send stream.
pub(crate) struct FrameWriter {
    send: Mutex<quinn::SendStream>,
}

impl FrameWriter {
    pub fn new(send: quinn::SendStream) -> Self {
        Self {
            send: Mutex::new(send),
        }
    }

    pub async fn write(&self, msg: Msg) -> Result<(), ProtocolError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(msg, &mut buf)?;
        let mut send = self.send.lock().await;
        send.write_all(&buf)
            .await
            .map_err(|e| ProtocolError::Io(e.into()))
    }

    /// Finish the send side and wait until the remote has every byte.
    pub async fn finish(&self) {
        let mut send = self.send.lock().await;
        if send.finish().is_ok() {
            let _ = send.stopped().await;
        }
    }
}

struct MsgEvents {
    bus: EventBus,
    peer: NodeIdentity,
}

struct SendSide {
    key: String,
    offset: u64,
    length: u64,
    writer: Arc<FrameWriter>,
    closed: CancellationToken,
    events: Option<MsgEvents>,
}

/// Cloneable write handle for one runner's code range.
#[derive(Clone)]
pub struct ProtocolSender {
    inner: Arc<SendSide>,
}

impl ProtocolSender {
    /// Write one message. `msg.code` is relative to this protocol.
    pub async fn write_msg(&self, msg: Msg) -> Result<(), ProtocolError> {
        let side = &self.inner;
        if msg.code >= side.length {
            return Err(ProtocolError::InvalidCode {
                code: msg.code,
                length: side.length,
            });
        }
        if side.closed.is_cancelled() {
            return Err(ProtocolError::Closed);
        }

        let code = msg.code;
        let size = msg.size();
        let wire = Msg {
            code: side.offset + code,
            payload: msg.payload,
        };
        tokio::select! {
            biased;
            _ = side.closed.cancelled() => return Err(ProtocolError::Closed),
            res = side.writer.write(wire) => res?,
        }

        if let Some(ev) = &side.events {
            ev.bus.publish(PeerEvent::msg(PeerEventKind::MsgSend, ev.peer, &side.key, code, size));
        }
        Ok(())
    }

    /// Encode `value` and write it under `code`.
    pub async fn send<T: Serialize + ?Sized>(&self, code: u64, value: &T) -> Result<(), ProtocolError> {
        if code >= self.inner.length {
            return Err(ProtocolError::InvalidCode {
                code,
                length: self.inner.length,
            });
        }
        self.write_msg(Msg::encode(code, value)?).await
    }
}

/// A runner's view of its peer: inbound messages for its code range plus a
/// sender. All operations fail with `ProtocolError::Closed` once the peer is
/// torn down.
pub struct ProtocolStream {
    inbox: mpsc::Receiver<Msg>,
    sender: ProtocolSender,
}

impl ProtocolStream {
    pub(crate) fn new(
        cap: &Capability,
        offset: u64,
        length: u64,
        inbox: mpsc::Receiver<Msg>,
        writer: Arc<FrameWriter>,
        closed: CancellationToken,
        events: Option<(EventBus, NodeIdentity)>,
    ) -> Self {
        Self {
            inbox,
            sender: ProtocolSender {
                inner: Arc::new(SendSide {
                    key: cap.to_string(),
                    offset,
                    length,
                    writer,
                    closed,
                    events: events.map(|(bus, peer)| MsgEvents { bus, peer }),
                }),
            },
        }
    }

    /// `name/version` of the protocol this stream belongs to.
    pub fn protocol(&self) -> &str {
        &self.sender.inner.key
    }

    /// Wait for the next message. The returned code is relative to this
    /// protocol.
    pub async fn read_msg(&mut self) -> Result<Msg, ProtocolError> {
        let side = &self.sender.inner;
        let msg = tokio::select! {
            biased;
            _ = side.closed.cancelled() => return Err(ProtocolError::Closed),
            msg = self.inbox.recv() => msg.ok_or(ProtocolError::Closed)?,
        };

        if let Some(ev) = &side.events {
            ev.bus.publish(PeerEvent::msg(PeerEventKind::MsgRecv, ev.peer, &side.key, msg.code, msg.size()));
        }
        Ok(msg)
    }

    pub async fn write_msg(&self, msg: Msg) -> Result<(), ProtocolError> {
        self.sender.write_msg(msg).await
    }

    pub async fn send<T: Serialize + ?Sized>(&self, code: u64, value: &T) -> Result<(), ProtocolError> {
        self.sender.send(code, value).await
    }

    /// Handle for writing from another task.
    pub fn sender(&self) -> ProtocolSender {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto(name: &str, version: u32, length: u64) -> Protocol {
        Protocol::new(name, version, length, |_peer, _stream| async { Ok(()) })
    }

    #[test]
    fn test_match_by_exact_name_and_version() {
        let local = vec![proto("echo", 1, 1), proto("echo", 2, 3), proto("ping", 1, 2)];
        let remote = vec![Capability::new("echo", 2), Capability::new("ping", 2), Capability::new("chat", 1)];

        let matched = match_protocols(&local, &remote);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].protocol.cap(), Capability::new("echo", 2));
        assert_eq!(matched[0].offset, 0);
    }

    #[test]
    fn test_offsets_contiguous_and_order_independent() {
        let local = vec![proto("ping", 1, 2), proto("chat", 1, 5), proto("echo", 1, 1)];
        let remote = vec![Capability::new("echo", 1), Capability::new("ping", 1), Capability::new("chat", 1)];

        let matched = match_protocols(&local, &remote);
        let layout: Vec<(String, u64)> = matched
            .iter()
            .map(|m| (m.protocol.name.clone(), m.offset))
            .collect();
        assert_eq!(
            layout,
            vec![("chat".to_string(), 0), ("echo".to_string(), 5), ("ping".to_string(), 6)]
        );

        // the remote registering in another order sees the same layout
        let mut reversed = local.clone();
        reversed.reverse();
        let again: Vec<u64> = match_protocols(&reversed, &remote).iter().map(|m| m.offset).collect();
        assert_eq!(again, vec![0, 5, 6]);
    }

    #[test]
    fn test_no_overlap_matches_nothing() {
        let local = vec![proto("echo", 1, 1)];
        assert!(match_protocols(&local, &[]).is_empty());
    }

    #[test]
    fn test_protocol_debug_omits_fn() {
        let dbg = format!("{:?}", proto("echo", 1, 1));
        assert!(dbg.contains("echo"));
        assert!(dbg.contains("length: 1"));
    }
}
