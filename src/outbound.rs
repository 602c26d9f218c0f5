//! Outbound connection provider
//!
//! Command handlers never touch the network directly; they go through
//! [`ServerOutbound`], which establishes dials, listeners and UDP sockets on
//! their behalf. [`InternetOutbound`] is the stock implementation backed by
//! the host network stack.

use crate::helper::BoxedStream;
use crate::message::{SocksAddr, StackOptionInfo};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use tracing::debug;

/// An established outbound connection
pub struct OutboundConn {
    /// The connected stream
    pub stream: BoxedStream,
    /// Local address the stream is bound to, reported back to the client
    pub local_addr: SocketAddr,
}

impl std::fmt::Debug for OutboundConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConn")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Network reach-out used by the command handlers
#[async_trait]
pub trait ServerOutbound: Send + Sync {
    /// Establish an outbound TCP connection to `addr`
    async fn dial(
        &self,
        options: StackOptionInfo,
        addr: &SocksAddr,
    ) -> io::Result<(OutboundConn, StackOptionInfo)>;

    /// Create a TCP listener on `addr`
    async fn listen(
        &self,
        options: StackOptionInfo,
        addr: &SocksAddr,
    ) -> io::Result<(TcpListener, StackOptionInfo)>;

    /// Create a UDP socket bound to `addr`
    async fn listen_packet(
        &self,
        options: StackOptionInfo,
        addr: &SocksAddr,
    ) -> io::Result<(UdpSocket, StackOptionInfo)>;
}

/// Resolve a socks address to a concrete socket address
pub async fn resolve(addr: &SocksAddr) -> io::Result<SocketAddr> {
    match addr {
        SocksAddr::Ip(sa) => Ok(*sa),
        SocksAddr::Domain(name, port) => lookup_host((name.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", name))
            }),
    }
}

/// Default provider: plain internet sockets
///
/// UDP binds get two address fixups: an unspecified address is replaced by
/// the configured default for its family (left unspecified when none is
/// configured, letting the OS choose), and a multicast address turns into an
/// unspecified bind plus a group join on the configured interface.
#[derive(Debug, Clone, Default)]
pub struct InternetOutbound {
    /// Address used when a UDP association asks for 0.0.0.0
    pub default_ipv4: Option<Ipv4Addr>,
    /// Address used when a UDP association asks for [::]
    pub default_ipv6: Option<Ipv6Addr>,
    /// Local interface address for IPv4 multicast joins
    pub multicast_interface_v4: Option<Ipv4Addr>,
    /// Interface index for IPv6 multicast joins
    pub multicast_interface_v6: Option<u32>,
}

#[async_trait]
impl ServerOutbound for InternetOutbound {
    async fn dial(
        &self,
        _options: StackOptionInfo,
        addr: &SocksAddr,
    ) -> io::Result<(OutboundConn, StackOptionInfo)> {
        let target = resolve(addr).await?;
        let stream = TcpStream::connect(target).await?;
        let local_addr = stream.local_addr()?;
        debug!(%target, %local_addr, "outbound dial established");
        Ok((
            OutboundConn {
                stream: Box::new(stream),
                local_addr,
            },
            StackOptionInfo::default(),
        ))
    }

    async fn listen(
        &self,
        _options: StackOptionInfo,
        addr: &SocksAddr,
    ) -> io::Result<(TcpListener, StackOptionInfo)> {
        let bind = resolve(addr).await?;
        let listener = TcpListener::bind(bind).await?;
        debug!(local = %listener.local_addr()?, "outbound listener bound");
        Ok((listener, StackOptionInfo::default()))
    }

    async fn listen_packet(
        &self,
        _options: StackOptionInfo,
        addr: &SocksAddr,
    ) -> io::Result<(UdpSocket, StackOptionInfo)> {
        let requested = match addr {
            SocksAddr::Ip(sa) => *sa,
            SocksAddr::Domain(..) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "UDP bind on a domain name",
                ));
            }
        };

        if requested.ip().is_multicast() {
            let bind: SocketAddr = match requested.ip() {
                IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, requested.port()).into(),
                IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, requested.port()).into(),
            };
            let socket = UdpSocket::bind(bind).await?;
            match requested.ip() {
                IpAddr::V4(group) => {
                    let iface = self.multicast_interface_v4.unwrap_or(Ipv4Addr::UNSPECIFIED);
                    socket.join_multicast_v4(group, iface)?;
                }
                IpAddr::V6(group) => {
                    socket.join_multicast_v6(&group, self.multicast_interface_v6.unwrap_or(0))?;
                }
            }
            debug!(group = %requested.ip(), "multicast UDP bind");
            return Ok((socket, StackOptionInfo::default()));
        }

        let bind = if requested.ip().is_unspecified() {
            match requested.ip() {
                IpAddr::V4(_) => match self.default_ipv4 {
                    Some(ip) => SocketAddr::new(IpAddr::V4(ip), requested.port()),
                    None => requested,
                },
                IpAddr::V6(_) => match self.default_ipv6 {
                    Some(ip) => SocketAddr::new(IpAddr::V6(ip), requested.port()),
                    None => requested,
                },
            }
        } else {
            requested
        };

        let socket = UdpSocket::bind(bind).await?;
        debug!(local = %socket.local_addr()?, "UDP bind");
        Ok((socket, StackOptionInfo::default()))
    }
}
