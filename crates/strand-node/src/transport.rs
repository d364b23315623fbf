//! QUIC transport -- endpoint management, accept/dial, buffered stream reads.
//!
//! One connection carries one bidirectional stream, opened by the dialer.
//! The handshake and every application frame travel over it.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::BytesMut;
use strand_protocol::{close_code, tls, ProtocolError};
use tokio_util::codec::Decoder;

/// Largest chunk pulled from a receive stream per read.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("tls setup: {0}")]
    Tls(String),
    #[error("connect: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("read: {0}")]
    Read(#[from] quinn::ReadError),
    #[error("write: {0}")]
    Write(#[from] quinn::WriteError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("stream ended mid-message")]
    Truncated,
}

/// QUIC endpoint plus the client config used for dials.
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    listening: bool,
}

impl QuicTransport {
    /// Bind the endpoint. With `listen` set it accepts connections there;
    /// otherwise it binds an ephemeral port for dialing only.
    pub fn bind(listen: Option<SocketAddr>, pkcs8_der: &[u8]) -> Result<Self, TransportError> {
        let client_config = tls::build_client_config().map_err(|e| TransportError::Tls(e.to_string()))?;

        let endpoint = match listen {
            Some(addr) => {
                let (cert_der, key_der) =
                    tls::generate_self_signed_cert(pkcs8_der).map_err(|e| TransportError::Tls(e.to_string()))?;
                let server_config =
                    tls::build_server_config(cert_der, key_der).map_err(|e| TransportError::Tls(e.to_string()))?;
                quinn::Endpoint::server(server_config, addr)
                    .map_err(|source| TransportError::Bind { addr, source })?
            }
            None => {
                let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
                quinn::Endpoint::client(addr).map_err(|source| TransportError::Bind { addr, source })?
            }
        };

        Ok(Self {
            endpoint,
            client_config,
            listening: listen.is_some(),
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Next inbound connection attempt; `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<quinn::Incoming> {
        self.endpoint.accept().await
    }

    /// Dial a remote peer.
    pub async fn dial(&self, addr: SocketAddr) -> Result<quinn::Connection, TransportError> {
        let conn = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, tls::SERVER_NAME)?
            .await?;
        Ok(conn)
    }

    /// Close every connection on the endpoint immediately.
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.endpoint.close(quinn::VarInt::from_u32(code), reason);
    }

    /// Wait until all connections have finished closing.
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

/// Whether a connection error is an orderly application close from either
/// side.
pub(crate) fn is_clean_close(err: &quinn::ConnectionError) -> bool {
    match err {
        quinn::ConnectionError::ApplicationClosed(close) => {
            let code = close.error_code.into_inner();
            code == u64::from(close_code::NORMAL) || code == u64::from(close_code::REQUESTED)
        }
        quinn::ConnectionError::LocallyClosed => true,
        _ => false,
    }
}

/// Receive half of the peer stream with its read-ahead buffer.
///
/// The buffer survives across codecs: bytes that arrive behind the last
/// handshake message are the start of the frame stream.
pub struct StreamReader {
    recv: quinn::RecvStream,
    buf: BytesMut,
}

impl StreamReader {
    pub fn new(recv: quinn::RecvStream) -> Self {
        Self {
            recv,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Decode the next item. `Ok(None)` means the remote finished the stream
    /// or closed the connection cleanly at a message boundary.
    pub async fn next<D>(&mut self, codec: &mut D) -> Result<Option<D::Item>, TransportError>
    where
        D: Decoder<Error = ProtocolError>,
    {
        loop {
            if let Some(item) = codec.decode(&mut self.buf)? {
                return Ok(Some(item));
            }

            let chunk = match self.recv.read_chunk(READ_CHUNK, true).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return self.at_end(),
                Err(quinn::ReadError::ConnectionLost(e)) if is_clean_close(&e) => return self.at_end(),
                Err(e) => return Err(e.into()),
            };
            self.buf.extend_from_slice(&chunk.bytes);
        }
    }

    fn at_end<T>(&self) -> Result<Option<T>, TransportError> {
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Err(TransportError::Truncated)
        }
    }
}
