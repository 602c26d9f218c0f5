//! SOCKS address parsing and encoding
//!
//! A socks address travels as `port(2) pad(1) atyp(1) addr-bytes` inside
//! requests, operation replies and UDP messages. Domain names are length
//! prefixed and never resolved here; resolution belongs to the outbound
//! provider.

use crate::error::MessageError;
use crate::message::{ADDR_TYPE_DOMAIN, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Target or bound address carried in SOCKS 6 messages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocksAddr {
    /// Concrete IPv4/IPv6 socket address
    Ip(SocketAddr),
    /// Domain name and port, resolved by the outbound provider
    Domain(String, u16),
}

impl SocksAddr {
    /// Create an IPv4 address
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        SocksAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create an IPv6 address
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        SocksAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Create a domain address
    pub fn domain<S: Into<String>>(name: S, port: u16) -> Self {
        SocksAddr::Domain(name.into(), port)
    }

    /// `0.0.0.0:0`, the placeholder endpoint in replies without one
    pub fn unspecified() -> Self {
        SocksAddr::ipv4(Ipv4Addr::UNSPECIFIED, 0)
    }

    /// Port component
    pub fn port(&self) -> u16 {
        match self {
            SocksAddr::Ip(sa) => sa.port(),
            SocksAddr::Domain(_, port) => *port,
        }
    }

    /// Address type byte on the wire
    pub fn addr_type(&self) -> u8 {
        match self {
            SocksAddr::Ip(SocketAddr::V4(_)) => ADDR_TYPE_IPV4,
            SocksAddr::Ip(SocketAddr::V6(_)) => ADDR_TYPE_IPV6,
            SocksAddr::Domain(..) => ADDR_TYPE_DOMAIN,
        }
    }

    /// Concrete socket address, if the address is not a domain name
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            SocksAddr::Ip(sa) => Some(*sa),
            SocksAddr::Domain(..) => None,
        }
    }

    /// Host string and port, suitable for `tokio::net::lookup_host`
    pub fn host_port(&self) -> (String, u16) {
        match self {
            SocksAddr::Ip(sa) => (sa.ip().to_string(), sa.port()),
            SocksAddr::Domain(name, port) => (name.clone(), *port),
        }
    }

    /// Encoded length in bytes
    pub fn wire_len(&self) -> usize {
        let addr = match self {
            SocksAddr::Ip(SocketAddr::V4(_)) => 4,
            SocksAddr::Ip(SocketAddr::V6(_)) => 16,
            SocksAddr::Domain(name, _) => 1 + name.len(),
        };
        // port + pad + atyp + address bytes
        4 + addr
    }

    /// Read an address from the stream
    pub async fn read_from<R>(r: &mut R) -> Result<Self, MessageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        r.read_exact(&mut head).await?;
        let port = u16::from_be_bytes([head[0], head[1]]);
        let atyp = head[3];

        match atyp {
            ADDR_TYPE_IPV4 => {
                let mut octets = [0u8; 4];
                r.read_exact(&mut octets).await?;
                Ok(SocksAddr::ipv4(Ipv4Addr::from(octets), port))
            }
            ADDR_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                r.read_exact(&mut octets).await?;
                Ok(SocksAddr::ipv6(Ipv6Addr::from(octets), port))
            }
            ADDR_TYPE_DOMAIN => {
                let len = r.read_u8().await? as usize;
                if len == 0 {
                    return Err(MessageError::Malformed("empty domain name".to_string()));
                }
                let mut name = vec![0u8; len];
                r.read_exact(&mut name).await?;
                let name = String::from_utf8(name)
                    .map_err(|_| MessageError::Malformed("domain is not UTF-8".to_string()))?;
                Ok(SocksAddr::Domain(name, port))
            }
            other => Err(MessageError::AddressNotSupported(other)),
        }
    }

    /// Parse an address from the front of `buf`, advancing it past the
    /// consumed bytes
    pub fn parse(buf: &mut &[u8]) -> Result<Self, MessageError> {
        let mut data = *buf;
        if data.len() < 4 {
            return Err(MessageError::Malformed("address header truncated".to_string()));
        }
        let port = u16::from_be_bytes([data[0], data[1]]);
        let atyp = data[3];
        data = &data[4..];

        let addr = match atyp {
            ADDR_TYPE_IPV4 => {
                if data.len() < 4 {
                    return Err(MessageError::Malformed("IPv4 address truncated".to_string()));
                }
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                data = &data[4..];
                SocksAddr::ipv4(ip, port)
            }
            ADDR_TYPE_IPV6 => {
                if data.len() < 16 {
                    return Err(MessageError::Malformed("IPv6 address truncated".to_string()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                data = &data[16..];
                SocksAddr::ipv6(Ipv6Addr::from(octets), port)
            }
            ADDR_TYPE_DOMAIN => {
                if data.is_empty() {
                    return Err(MessageError::Malformed("domain length truncated".to_string()));
                }
                let len = data[0] as usize;
                data = &data[1..];
                if len == 0 {
                    return Err(MessageError::Malformed("empty domain name".to_string()));
                }
                if data.len() < len {
                    return Err(MessageError::Malformed("domain name truncated".to_string()));
                }
                let name = String::from_utf8(data[..len].to_vec())
                    .map_err(|_| MessageError::Malformed("domain is not UTF-8".to_string()))?;
                data = &data[len..];
                SocksAddr::Domain(name, port)
            }
            other => return Err(MessageError::AddressNotSupported(other)),
        };

        *buf = data;
        Ok(addr)
    }

    /// Append the wire form to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.port());
        buf.put_u8(0);
        buf.put_u8(self.addr_type());
        match self {
            SocksAddr::Ip(SocketAddr::V4(sa)) => buf.put_slice(&sa.ip().octets()),
            SocksAddr::Ip(SocketAddr::V6(sa)) => buf.put_slice(&sa.ip().octets()),
            SocksAddr::Domain(name, _) => {
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
    }
}

impl From<SocketAddr> for SocksAddr {
    fn from(sa: SocketAddr) -> Self {
        SocksAddr::Ip(sa)
    }
}

impl From<IpAddr> for SocksAddr {
    fn from(ip: IpAddr) -> Self {
        SocksAddr::Ip(SocketAddr::new(ip, 0))
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(sa) => write!(f, "{}", sa),
            SocksAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}
