//! Authentication and operation replies

use crate::error::MessageError;
use crate::message::{OptionSet, SocksAddr, VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Outcome carried by an authentication reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthReplyType {
    /// Authentication succeeded
    Success,
    /// Authentication failed, or further negotiation is required
    Fail,
}

impl AuthReplyType {
    fn to_byte(self) -> u8 {
        match self {
            AuthReplyType::Success => 0,
            AuthReplyType::Fail => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0 => Ok(AuthReplyType::Success),
            1 => Ok(AuthReplyType::Fail),
            other => Err(MessageError::Malformed(format!(
                "unknown authentication reply type {}",
                other
            ))),
        }
    }
}

/// First-stage reply: did authentication succeed
///
/// Wire form: `version(1) type(1) options_length(2) options`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationReply {
    /// Success or fail
    pub reply_type: AuthReplyType,
    /// Options (method selection, method data)
    pub options: OptionSet,
}

impl AuthenticationReply {
    /// Create a reply of the given type without options
    pub fn new(reply_type: AuthReplyType) -> Self {
        AuthenticationReply {
            reply_type,
            options: OptionSet::new(),
        }
    }

    /// Read a reply from the stream
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
        let reply_type = AuthReplyType::from_byte(r.read_u8().await?)?;
        let options_len = r.read_u16().await? as usize;
        let mut option_bytes = vec![0u8; options_len];
        r.read_exact(&mut option_bytes).await?;
        Ok(AuthenticationReply {
            reply_type,
            options: OptionSet::parse(&option_bytes)?,
        })
    }

    /// Encode the reply to bytes
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.options.wire_len());
        buf.put_u8(VERSION);
        buf.put_u8(self.reply_type.to_byte());
        buf.put_u16(self.options.wire_len() as u16);
        self.options.write_to(&mut buf);
        buf.freeze()
    }
}

/// Result code carried by an operation reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    /// Command succeeded
    Success = 0,
    /// Unspecified server failure
    ServerFailure = 1,
    /// Rejected by the server rule
    NotAllowedByRule = 2,
    /// Network unreachable
    NetworkUnreachable = 3,
    /// Host unreachable
    HostUnreachable = 4,
    /// Connection refused
    ConnectionRefused = 5,
    /// TTL expired in transit
    TtlExpired = 6,
    /// Command not implemented by this server
    CommandNotSupported = 7,
    /// Address type not supported
    AddressNotSupported = 8,
    /// Operation timed out
    Timeout = 9,
}

impl ReplyCode {
    /// Decode the wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => ReplyCode::Success,
            1 => ReplyCode::ServerFailure,
            2 => ReplyCode::NotAllowedByRule,
            3 => ReplyCode::NetworkUnreachable,
            4 => ReplyCode::HostUnreachable,
            5 => ReplyCode::ConnectionRefused,
            6 => ReplyCode::TtlExpired,
            7 => ReplyCode::CommandNotSupported,
            8 => ReplyCode::AddressNotSupported,
            9 => ReplyCode::Timeout,
            _ => return None,
        })
    }
}

/// Second-stage reply: outcome of the requested operation
///
/// Wire form: `version(1) code(1) options_length(2) endpoint options`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReply {
    /// Result code
    pub code: ReplyCode,
    /// Bound or peer endpoint relevant to the operation
    pub endpoint: SocksAddr,
    /// Options (association id, stack options)
    pub options: OptionSet,
}

impl OperationReply {
    /// Create a reply with the given code and a placeholder endpoint
    pub fn with_code(code: ReplyCode) -> Self {
        OperationReply {
            code,
            endpoint: SocksAddr::unspecified(),
            options: OptionSet::new(),
        }
    }

    /// Create a success reply carrying `endpoint`
    pub fn success(endpoint: SocksAddr) -> Self {
        OperationReply {
            code: ReplyCode::Success,
            endpoint,
            options: OptionSet::new(),
        }
    }

    /// Read a reply from the stream
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
        let code_byte = r.read_u8().await?;
        let code = ReplyCode::from_byte(code_byte).ok_or_else(|| {
            MessageError::Malformed(format!("unknown operation reply code {}", code_byte))
        })?;
        let options_len = r.read_u16().await? as usize;
        let endpoint = SocksAddr::read_from(r).await?;
        let mut option_bytes = vec![0u8; options_len];
        r.read_exact(&mut option_bytes).await?;
        Ok(OperationReply {
            code,
            endpoint,
            options: OptionSet::parse(&option_bytes)?,
        })
    }

    /// Encode the reply to bytes
    pub fn marshal(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(4 + self.endpoint.wire_len() + self.options.wire_len());
        buf.put_u8(VERSION);
        buf.put_u8(self.code as u8);
        buf.put_u16(self.options.wire_len() as u16);
        self.endpoint.write_to(&mut buf);
        self.options.write_to(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_auth_reply_round_trip() {
        let mut reply = AuthenticationReply::new(AuthReplyType::Success);
        reply.options.add_method_selection(2);
        reply.options.add_auth_data(2, b"token");

        let bytes = reply.marshal();
        let mut cursor = Cursor::new(bytes.to_vec());
        let parsed = AuthenticationReply::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(parsed.marshal(), bytes);
    }

    #[tokio::test]
    async fn test_auth_reply_fail_wire_shape() {
        let reply = AuthenticationReply::new(AuthReplyType::Fail);
        assert_eq!(reply.marshal().to_vec(), vec![6, 1, 0, 0]);
    }

    #[tokio::test]
    async fn test_operation_reply_round_trip() {
        let mut reply = OperationReply::success(SocksAddr::ipv4(Ipv4Addr::new(10, 1, 2, 3), 8080));
        reply.options.add_association_id(42);

        let bytes = reply.marshal();
        let mut cursor = Cursor::new(bytes.to_vec());
        let parsed = OperationReply::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(parsed.options.association_id(), Some(42));
        assert_eq!(parsed.marshal(), bytes);
    }

    #[tokio::test]
    async fn test_operation_reply_code_only() {
        let reply = OperationReply::with_code(ReplyCode::ConnectionRefused);
        let bytes = reply.marshal();
        // code byte sits right after the version
        assert_eq!(bytes[1], 5);
        assert_eq!(reply.endpoint, SocksAddr::unspecified());
    }

    #[tokio::test]
    async fn test_operation_reply_unknown_code() {
        let mut cursor = Cursor::new(vec![6u8, 99, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert!(OperationReply::read_from(&mut cursor).await.is_err());
    }

    #[test]
    fn test_reply_code_bytes() {
        for b in 0u8..=9 {
            assert_eq!(ReplyCode::from_byte(b).unwrap() as u8, b);
        }
        assert!(ReplyCode::from_byte(10).is_none());
    }
}
