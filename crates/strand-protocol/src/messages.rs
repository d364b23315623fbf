//! Wire message types: handshake exchange and application frames.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::ProtocolError;

// ============================================================================
// Capabilities
// ============================================================================

/// A protocol advertised in the handshake, matched by exact name + version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    Hello(Hello),
    Auth(Auth),
    Admit,
    Disconnect { reason: DisconnectReason },
}

impl HandshakeMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::Hello(_) => "hello",
            HandshakeMessage::Auth(_) => "auth",
            HandshakeMessage::Admit => "admit",
            HandshakeMessage::Disconnect { .. } => "disconnect",
        }
    }
}

/// First message each side sends: who it is and what it speaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub magic: u32,
    pub version_min: u16,
    pub version_max: u16,
    pub node_id: NodeId,
    pub name: String,
    pub caps: Vec<Capability>,
    /// Port the sender accepts connections on; 0 when outbound-only.
    pub listen_port: u16,
    /// Challenge the remote must sign.
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

/// Proof of key possession: signature over the remote's nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

/// Why the handshake ended without a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    TooManyPeers,
    DuplicatePeer,
    SelfConnect,
    UselessPeer,
    IncompatibleVersion,
    ProtocolError,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::DuplicatePeer => "already connected",
            DisconnectReason::SelfConnect => "connected to self",
            DisconnectReason::UselessPeer => "no shared protocols",
            DisconnectReason::IncompatibleVersion => "incompatible protocol version",
            DisconnectReason::ProtocolError => "protocol error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Application frames
// ============================================================================

/// One application message: a code in the peer-wide code space plus an
/// opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub code: u64,
    pub payload: Bytes,
}

impl Msg {
    pub fn new(code: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Serialize `value` as the payload.
    pub fn encode<T: Serialize + ?Sized>(code: u64, value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(code, payload))
    }

    /// Deserialize the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }
}

// Base64 serde helper for binary fields in JSON.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
