//! Strand Protocol -- wire types, frame codec, handshake messages.
//!
//! QUIC between peers. The dialer opens one bidirectional stream per
//! connection; the handshake runs over it with a 4-byte length prefix +
//! serde JSON, then the same stream carries application frames:
//! `u64 code | u32 length | payload`.

pub mod codec;
pub mod messages;
pub mod node;
pub mod tls;

pub use codec::{FrameCodec, MessageCodec, MAX_FRAME_SIZE};
pub use messages::*;
pub use node::{NodeId, NodeIdentity, ParseNodeError, NODE_URI_SCHEME};

/// Protocol magic number: "StrN".
pub const PROTOCOL_MAGIC: u32 = 0x5374_724E;

/// Minimum supported handshake version.
pub const VERSION_MIN: u16 = 1;

/// Maximum supported handshake version.
pub const VERSION_MAX: u16 = 1;

/// Seconds allowed for the whole handshake on one connection.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Seconds allowed for an outbound QUIC connect.
pub const DIAL_TIMEOUT_SECS: u64 = 10;

/// QUIC idle timeout in seconds.
pub const QUIC_IDLE_TIMEOUT_SECS: u64 = 30;

/// QUIC transport keep-alive in seconds (must be < idle timeout).
pub const QUIC_KEEPALIVE_SECS: u64 = 10;

/// Default seconds between `ping/1` keep-alive pings.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;

/// Unanswered pings before the keep-alive protocol gives up on a peer.
pub const KEEPALIVE_MISS_LIMIT: u32 = 3;

/// Application close codes carried in QUIC CONNECTION_CLOSE frames.
pub mod close_code {
    /// All runners returned cleanly.
    pub const NORMAL: u32 = 0;
    /// Framing or codec violation.
    pub const PROTOCOL_ERROR: u32 = 1;
    /// Local disconnect request or server shutdown.
    pub const REQUESTED: u32 = 2;
    /// Handshake verdict was a rejection.
    pub const REJECTED: u32 = 3;
    /// Handshake failed before a verdict.
    pub const HANDSHAKE_FAILED: u32 = 4;
    /// A protocol runner returned an error.
    pub const RUNNER_ERROR: u32 = 5;
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("version mismatch: peer offers {min}-{max}, we support {our_min}-{our_max}")]
    VersionMismatch {
        min: u16,
        max: u16,
        our_min: u16,
        our_max: u16,
    },
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("message code {code} outside protocol space of {length}")]
    InvalidCode { code: u64, length: u64 },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream closed")]
    Closed,
}

impl ProtocolError {
    /// True when the error means the peer connection is gone rather than a
    /// content problem.
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed | ProtocolError::Io(_))
    }
}
