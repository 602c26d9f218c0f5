//! SOCKS 6 UDP messages
//!
//! Every datagram exchanged on a UDP association is wrapped in one of these,
//! and the association lifecycle messages (init/ack/error) travel in the same
//! envelope. Wire form: `version(1) type(1) association_id(8) endpoint`,
//! followed by the payload for datagrams or by `error_code(1) reporter` for
//! error messages.

use crate::error::MessageError;
use crate::message::{SocksAddr, VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// UDP message discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMessageType {
    /// Server -> client: association is live
    AssociationInit,
    /// Client -> server: association acknowledged
    AssociationAck,
    /// Encapsulated datagram, either direction
    Datagram,
    /// Server -> client: ICMP-derived delivery error
    Error,
}

impl UdpMessageType {
    fn to_byte(self) -> u8 {
        match self {
            UdpMessageType::AssociationInit => 1,
            UdpMessageType::AssociationAck => 2,
            UdpMessageType::Datagram => 3,
            UdpMessageType::Error => 4,
        }
    }

    fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(UdpMessageType::AssociationInit),
            2 => Ok(UdpMessageType::AssociationAck),
            3 => Ok(UdpMessageType::Datagram),
            4 => Ok(UdpMessageType::Error),
            other => Err(MessageError::Malformed(format!(
                "unknown UDP message type {}",
                other
            ))),
        }
    }
}

/// Delivery error class reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpErrorType {
    /// Network unreachable
    NetworkUnreachable = 1,
    /// Host unreachable
    HostUnreachable = 2,
    /// TTL expired in transit
    TtlExpired = 3,
    /// Datagram exceeded the path MTU
    DatagramTooBig = 4,
}

impl UdpErrorType {
    fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(UdpErrorType::NetworkUnreachable),
            2 => Ok(UdpErrorType::HostUnreachable),
            3 => Ok(UdpErrorType::TtlExpired),
            4 => Ok(UdpErrorType::DatagramTooBig),
            other => Err(MessageError::Malformed(format!(
                "unknown UDP error type {}",
                other
            ))),
        }
    }
}

/// A UDP association message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    /// Message discriminator
    pub message_type: UdpMessageType,
    /// Association the message belongs to
    pub association_id: u64,
    /// Datagram source/target endpoint
    pub endpoint: SocksAddr,
    /// Application payload, empty unless this is a datagram
    pub payload: Bytes,
    /// Error code and reporting node, present iff this is an error message
    pub error: Option<(UdpErrorType, SocksAddr)>,
}

impl UdpMessage {
    /// Server-side association liveness announcement
    pub fn association_init(association_id: u64) -> Self {
        UdpMessage {
            message_type: UdpMessageType::AssociationInit,
            association_id,
            endpoint: SocksAddr::unspecified(),
            payload: Bytes::new(),
            error: None,
        }
    }

    /// Encapsulated datagram to or from `endpoint`
    pub fn datagram(association_id: u64, endpoint: SocksAddr, payload: Bytes) -> Self {
        UdpMessage {
            message_type: UdpMessageType::Datagram,
            association_id,
            endpoint,
            payload,
            error: None,
        }
    }

    /// ICMP-derived error for a datagram previously sent to `endpoint`
    pub fn error(
        association_id: u64,
        endpoint: SocksAddr,
        code: UdpErrorType,
        reporter: SocksAddr,
    ) -> Self {
        UdpMessage {
            message_type: UdpMessageType::Error,
            association_id,
            endpoint,
            payload: Bytes::new(),
            error: Some((code, reporter)),
        }
    }

    /// Parse a message out of a datagram
    pub fn parse(data: &[u8]) -> Result<Self, MessageError> {
        if data.is_empty() {
            return Err(MessageError::Malformed("empty UDP message".to_string()));
        }
        if data[0] != VERSION {
            return Err(MessageError::VersionMismatch {
                version: data[0],
                consumed: vec![data[0]],
            });
        }
        if data.len() < 10 {
            return Err(MessageError::Malformed("UDP message truncated".to_string()));
        }
        let message_type = UdpMessageType::from_byte(data[1])?;
        let association_id = u64::from_be_bytes(data[2..10].try_into().unwrap());

        let mut rest = &data[10..];
        let endpoint = SocksAddr::parse(&mut rest)?;

        let (payload, error) = match message_type {
            UdpMessageType::Datagram => (Bytes::copy_from_slice(rest), None),
            UdpMessageType::Error => {
                if rest.is_empty() {
                    return Err(MessageError::Malformed("UDP error truncated".to_string()));
                }
                let code = UdpErrorType::from_byte(rest[0])?;
                let mut reporter_bytes = &rest[1..];
                let reporter = SocksAddr::parse(&mut reporter_bytes)?;
                (Bytes::new(), Some((code, reporter)))
            }
            _ => (Bytes::new(), None),
        };

        Ok(UdpMessage {
            message_type,
            association_id,
            endpoint,
            payload,
            error,
        })
    }

    /// Encode the message to bytes
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(10 + self.endpoint.wire_len() + self.payload.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.message_type.to_byte());
        buf.put_u64(self.association_id);
        self.endpoint.write_to(&mut buf);
        match (&self.message_type, &self.error) {
            (UdpMessageType::Error, Some((code, reporter))) => {
                buf.put_u8(*code as u8);
                reporter.write_to(&mut buf);
            }
            _ => buf.put_slice(&self.payload),
        }
        buf.freeze()
    }
}
