//! Unix domain socket transport.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::{Acceptor, Endpoint, ListenPort, Port, Transport};
use crate::defaults::LISTEN_BACKLOG;
use crate::error::IpcError;

/// Stream-socket transport bound to a filesystem path.
#[derive(Debug, Default)]
pub struct UnixDomainSocketTransport;

impl UnixDomainSocketTransport {
    pub fn new() -> UnixDomainSocketTransport {
        UnixDomainSocketTransport
    }
}

fn port_from_stream(stream: UnixStream) -> Port {
    let (read, write) = stream.into_split();
    Port::from_halves(Box::new(read), Box::new(write))
}

fn bind_listener(path: &Path) -> Result<std::os::unix::net::UnixListener, IpcError> {
    // A stale socket file from a previous run would fail the bind.
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not unlink stale socket file");
        }
    }

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    async fn accept(&self) -> Result<Port, IpcError> {
        let (stream, _addr) = self.listener.accept().await?;
        debug!(path = %self.path.display(), "accepted unix domain socket peer");
        Ok(port_from_stream(stream))
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        // The listener owns the socket file.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "socket file cleanup failed");
            }
        }
    }
}

#[async_trait]
impl Transport for UnixDomainSocketTransport {
    fn name(&self) -> &'static str {
        "unix domain socket"
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<ListenPort, IpcError> {
        let Endpoint::Unix { path } = endpoint else {
            return Err(IpcError::InvalidEndpoint(format!(
                "{endpoint} is not a unix endpoint"
            )));
        };

        let std_listener = bind_listener(path)?;
        let listener = UnixListener::from_std(std_listener)?;
        debug!(path = %path.display(), "unix domain socket listening");

        Ok(ListenPort::new(
            endpoint.clone(),
            Box::new(UnixAcceptor {
                listener,
                path: path.clone(),
            }),
        ))
    }

    async fn lookup(&self, endpoint: &Endpoint) -> Result<Port, IpcError> {
        let Endpoint::Unix { path } = endpoint else {
            return Err(IpcError::InvalidEndpoint(format!(
                "{endpoint} is not a unix endpoint"
            )));
        };

        let stream = UnixStream::connect(path).await?;
        debug!(path = %path.display(), "unix domain socket connected");
        Ok(port_from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::object::Object;

    fn socket_path(dir: &tempfile::TempDir, name: &str) -> Endpoint {
        Endpoint::unix(dir.path().join(name))
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_path(&dir, "round_trip.sock");
        let transport = UnixDomainSocketTransport::new();

        let listen_port = transport.listen(&endpoint).await.expect("listen");
        let server = tokio::spawn(async move {
            let port = listen_port.accept().await.expect("accept");
            let (header, payload) = port
                .recv_frame()
                .await
                .expect("recv")
                .expect("frame before close");
            (header, payload)
        });

        let dict = Object::dictionary();
        dict.dictionary_set_string("greeting", "hi");
        let frame = codec::encode_frame(&dict, 5).expect("encode");

        let client = transport.lookup(&endpoint).await.expect("connect");
        client.send_frame(&frame).await.expect("send");

        let (header, payload) = server.await.expect("server task");
        assert_eq!(header.id, 5);
        let decoded = codec::decode_payload(&payload).expect("decode");
        assert_eq!(decoded.dictionary_get_string("greeting").as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn listen_replaces_a_stale_socket_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_path(&dir, "stale.sock");
        let Endpoint::Unix { path } = &endpoint else {
            unreachable!()
        };
        std::fs::write(path, b"stale").expect("plant stale file");

        let transport = UnixDomainSocketTransport::new();
        let _listen_port = transport.listen(&endpoint).await.expect("listen");
    }

    #[tokio::test]
    async fn recv_frame_reports_orderly_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let endpoint = socket_path(&dir, "close.sock");
        let transport = UnixDomainSocketTransport::new();

        let listen_port = transport.listen(&endpoint).await.expect("listen");
        let server = tokio::spawn(async move {
            let port = listen_port.accept().await.expect("accept");
            port.recv_frame().await.expect("recv")
        });

        let client = transport.lookup(&endpoint).await.expect("connect");
        client.shutdown().await;
        drop(client);

        assert!(server.await.expect("server task").is_none());
    }
}
