//! SOCKS 6 wire codec
//!
//! Parse and marshal routines for every message the server speaks: requests,
//! authentication replies, operation replies, option sets, socks addresses
//! and UDP messages. All multi-byte fields are big endian. Every `marshal`
//! is the exact inverse of the corresponding `parse`.

mod addr;
mod option;
mod reply;
mod request;
mod udp;

pub use addr::SocksAddr;
pub use option::{
    kind, MethodAdvertisement, OptionSet, SocksOption, StackOptionInfo, STACK_CODE_BACKLOG,
    STACK_LEVEL_TCP,
};
pub use reply::{AuthReplyType, AuthenticationReply, OperationReply, ReplyCode};
pub use request::{CommandCode, Request};
pub use udp::{UdpErrorType, UdpMessage, UdpMessageType};

pub use crate::error::MessageError;

/// SOCKS protocol version implemented by this crate
pub const VERSION: u8 = 0x06;

// Address type bytes
/// IPv4 address
pub const ADDR_TYPE_IPV4: u8 = 0x01;
/// Fully qualified domain name
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const ADDR_TYPE_IPV6: u8 = 0x04;
