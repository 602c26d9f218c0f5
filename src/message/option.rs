//! SOCKS 6 options
//!
//! Options travel as `kind(2) total_length(2) payload`, where the length
//! covers the 4-byte header. Unknown kinds are preserved verbatim so an
//! option set always round-trips.

use crate::error::MessageError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Recognized option kinds
pub mod kind {
    /// Stack option (level/code/value tuning forwarded end to end)
    pub const STACK: u16 = 1;
    /// Authentication method advertisement, carries the initial data length
    pub const AUTH_METHOD_ADVERTISEMENT: u16 = 2;
    /// Authentication method selected by the server
    pub const AUTH_METHOD_SELECTION: u16 = 3;
    /// Method-specific authentication data
    pub const AUTH_DATA: u16 = 4;
    /// Idempotence token request
    pub const TOKEN_REQUEST: u16 = 11;
    /// Idempotence token expenditure
    pub const IDEMPOTENCE_EXPENDITURE: u16 = 13;
    /// Stream id of a multiplexed channel (private range)
    pub const STREAM_ID: u16 = 0xFD01;
    /// UDP association id (private range)
    pub const ASSOCIATION_ID: u16 = 0xFD02;
}

/// Stack option level for TCP tuning
pub const STACK_LEVEL_TCP: u8 = 4;
/// Stack option code for the BIND backlog
pub const STACK_CODE_BACKLOG: u8 = 3;

/// A single option: kind plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksOption {
    /// Option kind
    pub kind: u16,
    /// Raw payload, excluding the 4-byte header
    pub payload: Bytes,
}

impl SocksOption {
    /// Create an option from kind and payload
    pub fn new(kind: u16, payload: impl Into<Bytes>) -> Self {
        SocksOption {
            kind,
            payload: payload.into(),
        }
    }

    fn wire_len(&self) -> usize {
        4 + self.payload.len()
    }
}

/// Parsed authentication method advertisement payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodAdvertisement {
    /// Number of initial data bytes following the request
    pub initial_data_length: u16,
    /// Advertised method ids
    pub methods: Vec<u8>,
}

/// Ordered set of options attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionSet {
    options: Vec<SocksOption>,
}

impl OptionSet {
    /// Create an empty option set
    pub fn new() -> Self {
        OptionSet::default()
    }

    /// Append an option
    pub fn add(&mut self, option: SocksOption) {
        self.options.push(option);
    }

    /// First option of the given kind
    pub fn get(&self, kind: u16) -> Option<&SocksOption> {
        self.options.iter().find(|o| o.kind == kind)
    }

    /// Iterate options in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &SocksOption> {
        self.options.iter()
    }

    /// Number of options
    pub fn len(&self) -> usize {
        self.options.len()
    }

    /// True when no options are present
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Total encoded length of the set
    pub fn wire_len(&self) -> usize {
        self.options.iter().map(SocksOption::wire_len).sum()
    }

    /// Parse a set out of exactly `data`
    pub fn parse(mut data: &[u8]) -> Result<Self, MessageError> {
        let mut set = OptionSet::new();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(MessageError::Malformed("option header truncated".to_string()));
            }
            let kind = u16::from_be_bytes([data[0], data[1]]);
            let total = u16::from_be_bytes([data[2], data[3]]) as usize;
            if total < 4 || total > data.len() {
                return Err(MessageError::Malformed(format!(
                    "option length {} out of bounds",
                    total
                )));
            }
            set.add(SocksOption::new(kind, data[4..total].to_vec()));
            data = &data[total..];
        }
        Ok(set)
    }

    /// Append the wire form of every option to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        for opt in &self.options {
            buf.put_u16(opt.kind);
            buf.put_u16(opt.wire_len() as u16);
            buf.put_slice(&opt.payload);
        }
    }

    /// Decode the authentication method advertisement, if present
    pub fn method_advertisement(&self) -> Option<MethodAdvertisement> {
        let opt = self.get(kind::AUTH_METHOD_ADVERTISEMENT)?;
        if opt.payload.len() < 2 {
            return None;
        }
        Some(MethodAdvertisement {
            initial_data_length: u16::from_be_bytes([opt.payload[0], opt.payload[1]]),
            methods: opt.payload[2..].to_vec(),
        })
    }

    /// Add an authentication method advertisement
    pub fn add_method_advertisement(&mut self, initial_data_length: u16, methods: &[u8]) {
        let mut payload = BytesMut::with_capacity(2 + methods.len());
        payload.put_u16(initial_data_length);
        payload.put_slice(methods);
        self.add(SocksOption::new(
            kind::AUTH_METHOD_ADVERTISEMENT,
            payload.freeze(),
        ));
    }

    /// Method id announced via the method selection option
    pub fn method_selection(&self) -> Option<u8> {
        self.get(kind::AUTH_METHOD_SELECTION)
            .and_then(|o| o.payload.first().copied())
    }

    /// Add a method selection option
    pub fn add_method_selection(&mut self, method: u8) {
        self.add(SocksOption::new(
            kind::AUTH_METHOD_SELECTION,
            vec![method, 0, 0, 0],
        ));
    }

    /// Method-specific authentication data for `method`, if carried
    pub fn auth_data(&self, method: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .filter(|o| o.kind == kind::AUTH_DATA)
            .find(|o| o.payload.first() == Some(&method))
            .map(|o| &o.payload[1..])
    }

    /// Add method-specific authentication data
    pub fn add_auth_data(&mut self, method: u8, data: &[u8]) {
        let mut payload = BytesMut::with_capacity(1 + data.len());
        payload.put_u8(method);
        payload.put_slice(data);
        self.add(SocksOption::new(kind::AUTH_DATA, payload.freeze()));
    }

    /// Stream id carried by the request, if any
    pub fn stream_id(&self) -> Option<u32> {
        let opt = self.get(kind::STREAM_ID)?;
        let bytes: [u8; 4] = opt.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Add a stream id option
    pub fn add_stream_id(&mut self, id: u32) {
        self.add(SocksOption::new(kind::STREAM_ID, id.to_be_bytes().to_vec()));
    }

    /// Association id carried by the message, if any
    pub fn association_id(&self) -> Option<u64> {
        let opt = self.get(kind::ASSOCIATION_ID)?;
        let bytes: [u8; 8] = opt.payload.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Add an association id option
    pub fn add_association_id(&mut self, id: u64) {
        self.add(SocksOption::new(
            kind::ASSOCIATION_ID,
            id.to_be_bytes().to_vec(),
        ));
    }

    /// Collect every stack option into a [`StackOptionInfo`]
    pub fn stack_options(&self) -> StackOptionInfo {
        let mut info = StackOptionInfo::default();
        for opt in self.options.iter().filter(|o| o.kind == kind::STACK) {
            if opt.payload.len() < 2 {
                continue;
            }
            info.0
                .insert((opt.payload[0], opt.payload[1]), opt.payload[2..].to_vec());
        }
        info
    }

    /// Add a stack option
    pub fn add_stack_option(&mut self, level: u8, code: u8, value: &[u8]) {
        let mut payload = BytesMut::with_capacity(2 + value.len());
        payload.put_u8(level);
        payload.put_u8(code);
        payload.put_slice(value);
        self.add(SocksOption::new(kind::STACK, payload.freeze()));
    }
}

/// Stack-tuning options keyed by (level, code)
///
/// The server threads these through to the outbound provider without
/// interpreting them, except for the TCP backlog used by BIND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOptionInfo(pub HashMap<(u8, u8), Vec<u8>>);

impl StackOptionInfo {
    /// BIND backlog requested by the client, 0 when absent
    pub fn backlog(&self) -> u16 {
        self.0
            .get(&(STACK_LEVEL_TCP, STACK_CODE_BACKLOG))
            .and_then(|v| <[u8; 2]>::try_from(v.as_slice()).ok())
            .map(u16::from_be_bytes)
            .unwrap_or(0)
    }
}
