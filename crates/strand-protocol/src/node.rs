//! Node addressing: public-key ids and `strand://` URIs.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// URI scheme for node identities.
pub const NODE_URI_SCHEME: &str = "strand";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseNodeError {
    #[error("node uri must start with strand://")]
    MissingScheme,
    #[error("node uri is missing the '@' separator")]
    MissingSeparator,
    #[error("invalid node id: {0}")]
    InvalidId(String),
    #[error("invalid node address: {0}")]
    InvalidAddress(String),
}

/// Node identifier: the raw 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ParseNodeError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ParseNodeError::InvalidId(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ParseNodeError::InvalidId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Public identity of a node: key plus the endpoint it listens on.
///
/// Two identities are equal when their keys are equal; the address is
/// routing information only.
#[derive(Clone, Copy)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Whether another node could open a connection to this address.
    pub fn is_dialable(&self) -> bool {
        self.port != 0 && !self.ip.is_unspecified()
    }

    /// Canonical `strand://<hex>@ip:port` form.
    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

impl Hash for NodeIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NODE_URI_SCHEME}://{}@{}", self.id, self.socket_addr())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIdentity({}@{})", self.id.short(), self.socket_addr())
    }
}

impl FromStr for NodeIdentity {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(NODE_URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or(ParseNodeError::MissingScheme)?;
        let (id, addr) = rest.split_once('@').ok_or(ParseNodeError::MissingSeparator)?;
        let id: NodeId = id.parse()?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ParseNodeError::InvalidAddress(format!("{addr}: {e}")))?;
        Ok(Self::new(id, addr))
    }
}

impl Serialize for NodeIdentity {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeIdentity {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
