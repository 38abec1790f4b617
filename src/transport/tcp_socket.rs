//! TCP socket transport.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::{Acceptor, Endpoint, ListenPort, Port, Transport};
use crate::defaults::LISTEN_BACKLOG;
use crate::error::IpcError;

/// Stream-socket transport over IPv4. `TCP_NODELAY` is enabled on every
/// stream: frames are small and latency-sensitive.
#[derive(Debug, Default)]
pub struct TcpSocketTransport;

impl TcpSocketTransport {
    pub fn new() -> TcpSocketTransport {
        TcpSocketTransport
    }
}

fn port_from_stream(stream: TcpStream) -> Port {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    Port::from_halves(Box::new(read), Box::new(write))
}

fn bind_listener(addr: Ipv4Addr, port: u16) -> Result<std::net::TcpListener, IpcError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    let sockaddr = SocketAddr::from((addr, port));
    socket.bind(&sockaddr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Port, IpcError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!(peer = %addr, "accepted tcp peer");
        Ok(port_from_stream(stream))
    }
}

#[async_trait]
impl Transport for TcpSocketTransport {
    fn name(&self) -> &'static str {
        "tcp socket"
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<ListenPort, IpcError> {
        let Endpoint::Tcp { addr, port } = endpoint else {
            return Err(IpcError::InvalidEndpoint(format!(
                "{endpoint} is not a tcp endpoint"
            )));
        };

        let std_listener = bind_listener(*addr, *port)?;
        let listener = TcpListener::from_std(std_listener)?;

        // Report the port actually bound so that callers asking for port 0
        // can learn where to connect.
        let bound = listener.local_addr()?;
        let endpoint = Endpoint::tcp(*addr, bound.port());
        debug!(endpoint = %endpoint, "tcp socket listening");

        Ok(ListenPort::new(endpoint, Box::new(TcpAcceptor { listener })))
    }

    async fn lookup(&self, endpoint: &Endpoint) -> Result<Port, IpcError> {
        let Endpoint::Tcp { addr, port } = endpoint else {
            return Err(IpcError::InvalidEndpoint(format!(
                "{endpoint} is not a tcp endpoint"
            )));
        };

        let stream = TcpStream::connect((*addr, *port)).await?;
        debug!(endpoint = %endpoint, "tcp socket connected");
        Ok(port_from_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::object::Object;

    #[tokio::test]
    async fn frame_round_trip_on_an_ephemeral_port() {
        let transport = TcpSocketTransport::new();
        let listen_port = transport
            .listen(&Endpoint::tcp(Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("listen");
        let endpoint = listen_port.endpoint().clone();

        let server = tokio::spawn(async move {
            let port = listen_port.accept().await.expect("accept");
            port.recv_frame()
                .await
                .expect("recv")
                .expect("frame before close")
        });

        let dict = Object::dictionary();
        dict.dictionary_set_uint64("n", 99);
        let frame = codec::encode_frame(&dict, 12).expect("encode");

        let client = transport.lookup(&endpoint).await.expect("connect");
        client.send_frame(&frame).await.expect("send");

        let (header, payload) = server.await.expect("server task");
        assert_eq!(header.id, 12);
        let decoded = codec::decode_payload(&payload).expect("decode");
        assert_eq!(decoded.dictionary_get_uint64("n"), 99);
    }

    #[tokio::test]
    async fn mismatched_endpoint_kind_is_rejected() {
        let transport = TcpSocketTransport::new();
        let err = transport
            .listen(&Endpoint::unix("/tmp/not-tcp.sock"))
            .await
            .expect_err("unix endpoint on tcp transport");
        assert!(matches!(err, IpcError::InvalidEndpoint(_)));
    }
}
