//! Handshake -- identity exchange, proof of key possession, admission verdict.
//!
//! Runs on the connection's single bidirectional stream:
//!   1. Hello both ways (magic, version range, node id, caps, nonce)
//!   2. Auth both ways (signature over the remote's nonce)
//!   3. Admit or Disconnect{reason} both ways, after local admission
//!
//! A side that rejects the remote's Hello or Auth sends Disconnect{reason}
//! in place of its next message.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::BytesMut;
use strand_crypto::{handshake_transcript, verify_signature, CryptoError, NodeKey, NONCE_LEN};
use strand_protocol::{
    close_code, Auth, Capability, DisconnectReason, HandshakeMessage, Hello, MessageCodec, NodeId, NodeIdentity,
    ProtocolError, PROTOCOL_MAGIC, VERSION_MAX, VERSION_MIN,
};
use tokio_util::codec::Encoder;

use crate::transport::{StreamReader, TransportError};

/// How long a refusing side waits for its Disconnect to be acknowledged.
const REFUSE_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("stream closed during handshake")]
    Closed,
    #[error("expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("dialed {expected:?} but remote is {got:?}")]
    IdentityMismatch { expected: NodeId, got: NodeId },
    #[error("refused: {0}")]
    Refused(DisconnectReason),
    #[error("rejected by remote: {0}")]
    Rejected(DisconnectReason),
    #[error("timed out")]
    Timeout,
}

impl HandshakeError {
    pub(crate) fn close_code(&self) -> u32 {
        match self {
            HandshakeError::Refused(_) | HandshakeError::Rejected(_) => close_code::REJECTED,
            _ => close_code::HANDSHAKE_FAILED,
        }
    }
}

/// What this node says about itself.
pub(crate) struct LocalHello<'a> {
    pub key: &'a NodeKey,
    pub id: NodeId,
    pub name: &'a str,
    pub caps: &'a [Capability],
    pub listen_port: u16,
}

/// A remote that proved its identity, with the stream the session continues on.
pub(crate) struct Handshaked {
    pub remote: NodeIdentity,
    pub name: String,
    pub caps: Vec<Capability>,
    pub version: u16,
    pub send: quinn::SendStream,
    pub reader: StreamReader,
}

/// Dialer side: open the stream and check the remote is who we dialed.
pub(crate) async fn initiate(
    conn: &quinn::Connection,
    local: &LocalHello<'_>,
    dialed: NodeIdentity,
) -> Result<Handshaked, HandshakeError> {
    let (send, recv) = conn.open_bi().await.map_err(TransportError::from)?;
    exchange(send, StreamReader::new(recv), local, Some(dialed), dialed.ip).await
}

/// Listener side: wait for the dialer's stream.
pub(crate) async fn respond(conn: &quinn::Connection, local: &LocalHello<'_>) -> Result<Handshaked, HandshakeError> {
    let (send, recv) = conn.accept_bi().await.map_err(TransportError::from)?;
    exchange(send, StreamReader::new(recv), local, None, conn.remote_address().ip()).await
}

async fn exchange(
    mut send: quinn::SendStream,
    mut reader: StreamReader,
    local: &LocalHello<'_>,
    dialed: Option<NodeIdentity>,
    remote_ip: IpAddr,
) -> Result<Handshaked, HandshakeError> {
    let nonce = strand_crypto::random_nonce()?;
    write_message(
        &mut send,
        HandshakeMessage::Hello(Hello {
            magic: PROTOCOL_MAGIC,
            version_min: VERSION_MIN,
            version_max: VERSION_MAX,
            node_id: local.id,
            name: local.name.to_string(),
            caps: local.caps.to_vec(),
            listen_port: local.listen_port,
            nonce: nonce.to_vec(),
        }),
    )
    .await?;

    let hello = match read_message(&mut reader).await? {
        HandshakeMessage::Hello(h) => h,
        HandshakeMessage::Disconnect { reason } => return Err(HandshakeError::Rejected(reason)),
        other => {
            let err = HandshakeError::UnexpectedMessage {
                expected: "hello",
                got: other.kind(),
            };
            return Err(abort(&mut send, DisconnectReason::ProtocolError, err).await);
        }
    };

    if hello.magic != PROTOCOL_MAGIC {
        let err = ProtocolError::InvalidMagic {
            expected: PROTOCOL_MAGIC,
            got: hello.magic,
        };
        return Err(abort(&mut send, DisconnectReason::IncompatibleVersion, err.into()).await);
    }
    let version = negotiate_version(hello.version_min, hello.version_max);
    if version == 0 {
        let err = ProtocolError::VersionMismatch {
            min: hello.version_min,
            max: hello.version_max,
            our_min: VERSION_MIN,
            our_max: VERSION_MAX,
        };
        return Err(abort(&mut send, DisconnectReason::IncompatibleVersion, err.into()).await);
    }
    if let Some(d) = dialed {
        if d.id != hello.node_id {
            let err = HandshakeError::IdentityMismatch {
                expected: d.id,
                got: hello.node_id,
            };
            return Err(abort(&mut send, DisconnectReason::ProtocolError, err).await);
        }
    }
    if hello.nonce.len() != NONCE_LEN {
        let err = ProtocolError::Decode(format!("nonce must be {NONCE_LEN} bytes, got {}", hello.nonce.len()));
        return Err(abort(&mut send, DisconnectReason::ProtocolError, err.into()).await);
    }

    let ours = handshake_transcript(&hello.nonce, local.id.as_bytes(), hello.node_id.as_bytes());
    write_message(
        &mut send,
        HandshakeMessage::Auth(Auth {
            signature: local.key.sign(&ours),
        }),
    )
    .await?;

    let auth = match read_message(&mut reader).await? {
        HandshakeMessage::Auth(a) => a,
        HandshakeMessage::Disconnect { reason } => return Err(HandshakeError::Rejected(reason)),
        other => {
            let err = HandshakeError::UnexpectedMessage {
                expected: "auth",
                got: other.kind(),
            };
            return Err(abort(&mut send, DisconnectReason::ProtocolError, err).await);
        }
    };
    let theirs = handshake_transcript(&nonce, hello.node_id.as_bytes(), local.id.as_bytes());
    if let Err(e) = verify_signature(hello.node_id.as_bytes(), &theirs, &auth.signature) {
        return Err(abort(&mut send, DisconnectReason::ProtocolError, e.into()).await);
    }

    let remote = dialed.unwrap_or_else(|| NodeIdentity::new(hello.node_id, SocketAddr::new(remote_ip, hello.listen_port)));
    Ok(Handshaked {
        remote,
        name: hello.name,
        caps: hello.caps,
        version,
        send,
        reader,
    })
}

impl Handshaked {
    /// Report local admission and wait for the remote's verdict.
    pub async fn confirm(&mut self) -> Result<(), HandshakeError> {
        write_message(&mut self.send, HandshakeMessage::Admit).await?;
        match read_message(&mut self.reader).await? {
            HandshakeMessage::Admit => Ok(()),
            HandshakeMessage::Disconnect { reason } => Err(HandshakeError::Rejected(reason)),
            other => Err(HandshakeError::UnexpectedMessage {
                expected: "admit",
                got: other.kind(),
            }),
        }
    }

    /// Tell the remote why it was refused, then close the connection.
    pub async fn refuse(mut self, conn: &quinn::Connection, reason: DisconnectReason) {
        send_verdict(&mut self.send, reason).await;
        conn.close(
            quinn::VarInt::from_u32(close_code::REJECTED),
            reason.to_string().as_bytes(),
        );
    }
}

/// Write `Disconnect{reason}` and wait briefly for it to be delivered.
/// Best effort: the connection is going away either way.
async fn send_verdict(send: &mut quinn::SendStream, reason: DisconnectReason) {
    if write_message(send, HandshakeMessage::Disconnect { reason }).await.is_ok() && send.finish().is_ok() {
        let _ = tokio::time::timeout(REFUSE_LINGER, send.stopped()).await;
    }
}

/// Fail the exchange, telling the remote why first.
async fn abort(send: &mut quinn::SendStream, reason: DisconnectReason, err: HandshakeError) -> HandshakeError {
    tracing::debug!(reason = %reason, error = %err, "net: handshake aborted");
    send_verdict(send, reason).await;
    err
}

async fn read_message(reader: &mut StreamReader) -> Result<HandshakeMessage, HandshakeError> {
    reader.next(&mut MessageCodec).await?.ok_or(HandshakeError::Closed)
}

async fn write_message(send: &mut quinn::SendStream, msg: HandshakeMessage) -> Result<(), HandshakeError> {
    let mut buf = BytesMut::new();
    MessageCodec.encode(msg, &mut buf)?;
    send.write_all(&buf).await.map_err(TransportError::from)?;
    Ok(())
}

/// Highest version both sides support; 0 when the ranges do not overlap.
fn negotiate_version(peer_min: u16, peer_max: u16) -> u16 {
    let common_min = peer_min.max(VERSION_MIN);
    let common_max = peer_max.min(VERSION_MAX);
    if common_min <= common_max {
        common_max
    } else {
        0
    }
}
