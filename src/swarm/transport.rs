//! Raw duplex byte streams over the address schemes we can dial.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

/// A duplex byte stream produced by a transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this transport understands `addr`.
    fn can_handle(&self, addr: &Multiaddr) -> bool;

    async fn dial(&self, addr: &Multiaddr) -> io::Result<BoxedStream>;

    async fn listen(&self, addr: &Multiaddr) -> io::Result<Box<dyn Listener>>;
}

#[async_trait]
pub trait Listener: Send + 'static {
    /// The address actually bound, with any wildcard port resolved.
    fn local_addr(&self) -> Multiaddr;

    /// Waits for the next inbound stream and the address it came from.
    async fn accept(&mut self) -> io::Result<(BoxedStream, Multiaddr)>;
}

/// Host part of a dialable address.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Host {
    Ip(IpAddr),
    Dns(String),
}

/// Splits `/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>` into host and port.
fn tcp_host_port(addr: &Multiaddr) -> Option<(Host, u16)> {
    let mut iter = addr.iter();
    let host = match iter.next()? {
        Protocol::Ip4(ip) => Host::Ip(ip.into()),
        Protocol::Ip6(ip) => Host::Ip(ip.into()),
        Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
            Host::Dns(name.to_string())
        }
        _ => return None,
    };
    let port = match iter.next()? {
        Protocol::Tcp(port) => port,
        _ => return None,
    };
    match iter.next() {
        None | Some(Protocol::P2p(_)) => Some((host, port)),
        Some(_) => None,
    }
}

/// Converts a socket address into `/ip4|ip6/<ip>/tcp/<port>`.
pub fn socket_addr_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::empty()
        .with(addr.ip().into())
        .with(Protocol::Tcp(addr.port()))
}

fn unsupported(addr: &Multiaddr) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported address {addr}"),
    )
}

/// TCP over IPv4, IPv6 and DNS names.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn can_handle(&self, addr: &Multiaddr) -> bool {
        tcp_host_port(addr).is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> io::Result<BoxedStream> {
        let (host, port) = tcp_host_port(addr).ok_or_else(|| unsupported(addr))?;
        let stream = match host {
            Host::Ip(ip) => TcpStream::connect(SocketAddr::new(ip, port)).await?,
            Host::Dns(name) => TcpStream::connect((name.as_str(), port)).await?,
        };
        stream.set_nodelay(true)?;
        trace!(%addr, "tcp connected");
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> io::Result<Box<dyn Listener>> {
        let (host, port) = tcp_host_port(addr).ok_or_else(|| unsupported(addr))?;
        let listener = match host {
            Host::Ip(ip) => TcpListener::bind(SocketAddr::new(ip, port)).await?,
            Host::Dns(name) => TcpListener::bind((name.as_str(), port)).await?,
        };
        let local_addr = socket_addr_to_multiaddr(listener.local_addr()?);
        Ok(Box::new(TcpListenerStream {
            listener,
            local_addr,
        }))
    }
}

struct TcpListenerStream {
    listener: TcpListener,
    local_addr: Multiaddr,
}

#[async_trait]
impl Listener for TcpListenerStream {
    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    async fn accept(&mut self) -> io::Result<(BoxedStream, Multiaddr)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), socket_addr_to_multiaddr(remote)))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_can_handle() {
        let tcp = TcpTransport;
        for addr in [
            "/ip4/127.0.0.1/tcp/4001",
            "/ip6/::1/tcp/4001",
            "/dns4/example.com/tcp/4001",
            "/ip4/127.0.0.1/tcp/4001/p2p/QmcgpsyWgH8Y8ajJz1Cu72KnS5uo2Aa2LpzU7kinSupNKC",
        ] {
            assert!(tcp.can_handle(&addr.parse().unwrap()), "{addr}");
        }
        for addr in ["/ip4/127.0.0.1/udp/4001", "/ip4/127.0.0.1", "/tcp/4001"] {
            assert!(!tcp.can_handle(&addr.parse().unwrap()), "{addr}");
        }
    }

    #[tokio::test]
    async fn test_dial_listen() {
        let tcp = TcpTransport;
        let mut listener = tcp
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        assert!(!addr.to_string().ends_with("/tcp/0"));

        let (dialed, accepted) = tokio::join!(tcp.dial(&addr), listener.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _remote) = accepted.unwrap();
        dialed.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
