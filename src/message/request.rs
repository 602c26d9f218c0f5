//! SOCKS 6 request parsing and encoding

use crate::error::MessageError;
use crate::message::{OptionSet, SocksAddr, VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Command requested by the client
///
/// Unknown bytes are preserved so the server can reply `CommandNotSupported`
/// without losing what was actually asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    /// Connectivity check, no operation
    Noop,
    /// Outbound TCP connection
    Connect,
    /// Inbound TCP listener
    Bind,
    /// UDP association
    UdpAssociate,
    /// Anything this server does not implement
    Other(u8),
}

impl CommandCode {
    /// Decode the wire byte
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => CommandCode::Noop,
            1 => CommandCode::Connect,
            2 => CommandCode::Bind,
            3 => CommandCode::UdpAssociate,
            other => CommandCode::Other(other),
        }
    }

    /// Encode to the wire byte
    pub fn to_byte(self) -> u8 {
        match self {
            CommandCode::Noop => 0,
            CommandCode::Connect => 1,
            CommandCode::Bind => 2,
            CommandCode::UdpAssociate => 3,
            CommandCode::Other(b) => b,
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandCode::Noop => write!(f, "NOOP"),
            CommandCode::Connect => write!(f, "CONNECT"),
            CommandCode::Bind => write!(f, "BIND"),
            CommandCode::UdpAssociate => write!(f, "UDP ASSOCIATE"),
            CommandCode::Other(b) => write!(f, "COMMAND 0x{:02X}", b),
        }
    }
}

/// A parsed SOCKS 6 request
///
/// Wire form: `version(1) command(1) options_length(2) endpoint options`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested command
    pub command: CommandCode,
    /// Target endpoint
    pub endpoint: SocksAddr,
    /// Options attached to the request
    pub options: OptionSet,
}

impl Request {
    /// Create a request without options
    pub fn new(command: CommandCode, endpoint: SocksAddr) -> Self {
        Request {
            command,
            endpoint,
            options: OptionSet::new(),
        }
    }

    /// Read a request from the stream.
    ///
    /// A first byte other than 0x06 yields
    /// [`MessageError::VersionMismatch`] carrying the consumed byte; the
    /// caller decides how to answer the foreign protocol.
    pub async fn read_from<R>(r: &mut R) -> Result<Self, MessageError>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;
        if version != VERSION {
            return Err(MessageError::VersionMismatch {
                version,
                consumed: vec![version],
            });
        }

        let command = CommandCode::from_byte(r.read_u8().await?);
        let options_len = r.read_u16().await? as usize;
        let endpoint = SocksAddr::read_from(r).await?;

        let mut option_bytes = vec![0u8; options_len];
        r.read_exact(&mut option_bytes).await?;
        let options = OptionSet::parse(&option_bytes)?;

        Ok(Request {
            command,
            endpoint,
            options,
        })
    }

    /// Encode the request to bytes
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.endpoint.wire_len() + self.options.wire_len());
        buf.put_u8(VERSION);
        buf.put_u8(self.command.to_byte());
        buf.put_u16(self.options.wire_len() as u16);
        self.endpoint.write_to(&mut buf);
        self.options.write_to(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_parse_minimal_connect() {
        let bytes = vec![
            6, 1, 0, 0, //
            0, 1, 0, 1, //
            127, 0, 0, 1,
        ];
        let mut cursor = Cursor::new(bytes.clone());
        let req = Request::read_from(&mut cursor).await.unwrap();

        assert_eq!(req.command, CommandCode::Connect);
        assert_eq!(req.endpoint, SocksAddr::ipv4(Ipv4Addr::new(127, 0, 0, 1), 1));
        assert!(req.options.is_empty());
        assert_eq!(req.marshal().to_vec(), bytes);
    }

    #[tokio::test]
    async fn test_parse_with_options() {
        let bytes = vec![
            6, 1, 0, 4, //
            0, 1, 0, 1, //
            127, 0, 0, 1, //
            0, 1, 0, 4,
        ];
        let mut cursor = Cursor::new(bytes.clone());
        let req = Request::read_from(&mut cursor).await.unwrap();

        assert_eq!(req.options.len(), 1);
        assert_eq!(req.options.get(kind::STACK).unwrap().payload.len(), 0);
        assert_eq!(req.marshal().to_vec(), bytes);
    }

    #[tokio::test]
    async fn test_parse_truncated_header() {
        let mut cursor = Cursor::new(vec![6u8, 1, 0, 0]);
        let err = Request::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MessageError::Io(_)));
    }

    #[tokio::test]
    async fn test_parse_truncated_options() {
        let mut cursor = Cursor::new(vec![
            6u8, 1, 0, 4, //
            0, 1, 0, 1, //
            127, 0, 0, 1,
        ]);
        let err = Request::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, MessageError::Io(_)));
    }

    #[tokio::test]
    async fn test_parse_version_mismatch() {
        let mut cursor = Cursor::new(vec![5u8, 1, 0, 1, 127, 0, 0, 1, 0, 0]);
        let err = Request::read_from(&mut cursor).await.unwrap_err();
        match err {
            MessageError::VersionMismatch { version, consumed } => {
                assert_eq!(version, 5);
                assert_eq!(consumed, vec![5]);
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_round_trip_domain_with_ids() {
        let mut req = Request::new(CommandCode::UdpAssociate, SocksAddr::domain("example.com", 53));
        req.options.add_stream_id(3);
        req.options.add_method_advertisement(0, &[0]);

        let bytes = req.marshal();
        let mut cursor = Cursor::new(bytes.to_vec());
        let parsed = Request::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.marshal(), bytes);
    }

    #[test]
    fn test_command_code_bytes() {
        for b in 0u8..=8 {
            assert_eq!(CommandCode::from_byte(b).to_byte(), b);
        }
        assert_eq!(CommandCode::from_byte(3), CommandCode::UdpAssociate);
        assert_eq!(CommandCode::from_byte(0x7F), CommandCode::Other(0x7F));
    }

    #[test]
    fn test_command_code_display() {
        assert_eq!(CommandCode::Connect.to_string(), "CONNECT");
        assert_eq!(CommandCode::Other(9).to_string(), "COMMAND 0x09");
    }
}
