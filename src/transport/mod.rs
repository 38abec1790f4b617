//! # Transport Abstraction
//!
//! A transport is a small capability set: resolve an [`Endpoint`] into a
//! listening port or a connected port. Everything above this layer works
//! in terms of whole frames; everything below is plain stream-socket
//! plumbing.
//!
//! ## Ports
//!
//! A [`Port`] is a connected bidirectional stream split into read and
//! write halves so the send and receive paths can proceed independently.
//! `send_frame` writes one complete frame in a single buffer;
//! `recv_frame` reads the fixed header, validates it, then reads exactly
//! the advertised payload length. Each port carries a process-unique id,
//! and id equality is the port-comparison primitive. Dropping a port
//! closes it.
//!
//! ## Readiness
//!
//! Readiness sources are not constructed here: the connection layer spawns
//! an acceptor task around [`ListenPort::accept`] (the server source) or a
//! reader task around [`Port::recv_frame`] (the client source), gated by
//! the connection's lifecycle.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::FrameHeader;
use crate::defaults::FRAME_HEADER_SIZE;
use crate::error::IpcError;

pub mod tcp_socket;
pub mod unix_domain_socket;

pub use tcp_socket::TcpSocketTransport;
pub use unix_domain_socket::UnixDomainSocketTransport;

/// Process-unique identifier for a port.
pub type PortId = u64;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

fn next_port_id() -> PortId {
    NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a connection listens or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A filesystem path. Listening unlinks a stale path first.
    Unix { path: PathBuf },
    /// An IPv4 address and port.
    Tcp { addr: Ipv4Addr, port: u16 },
}

impl Endpoint {
    pub fn unix(path: impl Into<PathBuf>) -> Endpoint {
        Endpoint::Unix { path: path.into() }
    }

    pub fn tcp(addr: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint::Tcp { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix { path } => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp { addr, port } => write!(f, "tcp:{addr}:{port}"),
        }
    }
}

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected stream carrying framed messages.
pub struct Port {
    id: PortId,
    read: tokio::sync::Mutex<ReadHalf>,
    write: tokio::sync::Mutex<WriteHalf>,
}

impl Port {
    pub(crate) fn from_halves(read: ReadHalf, write: WriteHalf) -> Port {
        Port {
            id: next_port_id(),
            read: tokio::sync::Mutex::new(read),
            write: tokio::sync::Mutex::new(write),
        }
    }

    /// Process-unique id; equality of ids is port equality.
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Write one whole frame, then flush.
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), IpcError> {
        let mut write = self.write.lock().await;
        write.write_all(frame).await?;
        write.flush().await?;
        Ok(())
    }

    /// Read one frame.
    ///
    /// `Ok(None)` reports an orderly close observed before a new header
    /// began. An end-of-stream in the middle of a frame, or a header that
    /// fails validation, is an error: the stream cannot be re-framed past
    /// it.
    pub async fn recv_frame(&self) -> Result<Option<(FrameHeader, Vec<u8>)>, IpcError> {
        let mut read = self.read.lock().await;

        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        if let Err(e) = read.read_exact(&mut header_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(e.into());
        }
        let header = FrameHeader::decode(&header_buf)?;

        let mut payload = vec![0u8; header.length as usize];
        read.read_exact(&mut payload).await?;
        Ok(Some((header, payload)))
    }

    /// Half-close the write side, letting the peer observe end-of-stream.
    pub async fn shutdown(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Port {}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port").field("id", &self.id).finish()
    }
}

#[async_trait]
pub(crate) trait Acceptor: Send + Sync {
    async fn accept(&self) -> Result<Port, IpcError>;
}

/// A bound, listening port producing one [`Port`] per accepted peer.
pub struct ListenPort {
    id: PortId,
    endpoint: Endpoint,
    acceptor: Box<dyn Acceptor>,
}

impl ListenPort {
    pub(crate) fn new(endpoint: Endpoint, acceptor: Box<dyn Acceptor>) -> ListenPort {
        ListenPort {
            id: next_port_id(),
            endpoint,
            acceptor,
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// The endpoint actually bound. For TCP this reports the concrete
    /// port even when the requested one was 0.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for and accept the next peer.
    pub async fn accept(&self) -> Result<Port, IpcError> {
        self.acceptor.accept().await
    }
}

impl fmt::Debug for ListenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenPort")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// The pluggable capability set: bind a listener or connect a client.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;

    /// Bind `endpoint` and start listening.
    async fn listen(&self, endpoint: &Endpoint) -> Result<ListenPort, IpcError>;

    /// Connect to a listening `endpoint`.
    async fn lookup(&self, endpoint: &Endpoint) -> Result<Port, IpcError>;
}

/// Selects the concrete transport for an endpoint.
pub struct TransportFactory;

impl TransportFactory {
    pub fn for_endpoint(endpoint: &Endpoint) -> Arc<dyn Transport> {
        match endpoint {
            Endpoint::Unix { .. } => Arc::new(UnixDomainSocketTransport::new()),
            Endpoint::Tcp { .. } => Arc::new(TcpSocketTransport::new()),
        }
    }
}
