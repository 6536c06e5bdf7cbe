//! STUN-family wire codec for the rendezvous protocol.
//!
//! Every datagram exchanged between peers and the rendezvous server is a
//! STUN-family message: a 20-byte header (type, length, magic cookie,
//! transaction id) followed by TLV attributes padded to 32-bit boundaries.
//! Three methods are used - Binding, Data, and ChannelBind - across the
//! four standard classes.
//!
//! Authentication is the short-term credential scheme: every message
//! carries a `MESSAGE-INTEGRITY` attribute (HMAC-SHA1 keyed with the
//! shared rendezvous password) followed by a `FINGERPRINT` trailer
//! (CRC32 xor `0x5354554e`). [`validate`] accepts a message iff the magic
//! cookie is present, the `USERNAME` attribute decodes to a 6-byte peer
//! id, and both the fingerprint and the integrity tag check out. Anything
//! else is discarded and charged to the receiver's error budget by the
//! caller.
//!
//! The `EVEN-PORT` attribute is reused as a carrier for the sender's
//! swarm ports: two little-endian 32-bit integers (external, internal).

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

use crate::peer::{PeerId, SessionTable, PEER_ID_LEN};

/// STUN magic cookie, present in every message header.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 20;

/// Largest payload accepted in a `DATA` attribute. Bounds both outbound
/// multicasts and inbound allocation.
pub const MAX_PACKET_DATA: usize = 56 * 1024;

/// XOR mask applied to the CRC32 fingerprint, per STUN convention.
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_DATA: u16 = 0x0013;
const ATTR_EVEN_PORT: u16 = 0x0018;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_FINGERPRINT: u16 = 0x8028;

const INTEGRITY_LEN: usize = 20;

type HmacSha1 = Hmac<Sha1>;

/// Errors raised while framing or validating messages. All of them map to
/// the `BadMessage` error kind at the connection level.
#[derive(Debug, Error)]
pub enum WireError {
    /// Datagram shorter than a header, or attribute data runs past the end.
    #[error("truncated message: {0}")]
    Truncated(&'static str),

    /// The header's magic cookie did not match.
    #[error("not a rendezvous message (bad magic cookie)")]
    BadCookie,

    /// The message type field encodes an unknown method.
    #[error("unknown method 0x{0:03x}")]
    UnknownMethod(u16),

    /// A required attribute is absent.
    #[error("missing attribute {0}")]
    MissingAttribute(&'static str),

    /// An attribute's value did not decode.
    #[error("bad attribute {0}")]
    BadAttribute(&'static str),

    /// The fingerprint trailer did not match.
    #[error("fingerprint mismatch")]
    BadFingerprint,

    /// The message integrity tag did not match under the configured
    /// password.
    #[error("message integrity mismatch")]
    BadIntegrity,

    /// The message validated but its type was not the expected one.
    /// An unexpected class for a known method is an error, never an
    /// implicit promotion.
    #[error("unexpected message type {actual}, expected {expected}")]
    UnexpectedType {
        /// Type the caller required.
        expected: MessageType,
        /// Type actually present.
        actual: MessageType,
    },

    /// A `DATA` payload exceeded [`MAX_PACKET_DATA`].
    #[error("payload is {len} bytes, maximum {MAX_PACKET_DATA}")]
    PayloadTooLarge {
        /// Offending payload length.
        len: usize,
    },
}

/// STUN method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// NAT-reflexive binding against the rendezvous server.
    Binding,
    /// Application payload carriage (gossip multicast).
    Data,
    /// Channel keep-alive between peers.
    ChannelBind,
}

impl Method {
    const fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Data => 0x007,
            Self::ChannelBind => 0x009,
        }
    }

    const fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001 => Some(Self::Binding),
            0x007 => Some(Self::Data),
            0x009 => Some(Self::ChannelBind),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binding => f.write_str("binding"),
            Self::Data => f.write_str("data"),
            Self::ChannelBind => f.write_str("channel-bind"),
        }
    }
}

/// STUN class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    /// Request expecting a response.
    Request,
    /// One-way indication.
    Indication,
    /// Successful response to a request.
    SuccessResponse,
    /// Error response to a request.
    ErrorResponse,
}

impl Class {
    const fn code(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    const fn from_code(code: u16) -> Self {
        match code & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

impl std::fmt::Display for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Indication => f.write_str("indication"),
            Self::SuccessResponse => f.write_str("success"),
            Self::ErrorResponse => f.write_str("error"),
        }
    }
}

/// A (method, class) pair, bit-packed into the 14-bit header type field
/// per STUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    /// Method half of the type.
    pub method: Method,
    /// Class half of the type.
    pub class: Class,
}

impl MessageType {
    /// Builds a message type.
    pub const fn new(method: Method, class: Class) -> Self {
        Self { method, class }
    }

    fn encode(self) -> u16 {
        let m = self.method.code();
        let c = self.class.code();
        ((m & 0x0f80) << 2) | ((m & 0x0070) << 1) | (m & 0x000f) | ((c & 0b10) << 7) | ((c & 0b01) << 4)
    }

    fn decode(raw: u16) -> Result<Self, WireError> {
        let method_code = ((raw >> 2) & 0x0f80) | ((raw >> 1) & 0x0070) | (raw & 0x000f);
        let class_code = ((raw >> 7) & 0b10) | ((raw >> 4) & 0b01);
        let method = Method::from_code(method_code).ok_or(WireError::UnknownMethod(method_code))?;
        Ok(Self {
            method,
            class: Class::from_code(class_code),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.method, self.class)
    }
}

/// Binding request type.
pub const BINDING_REQUEST: MessageType = MessageType::new(Method::Binding, Class::Request);
/// Binding success response type.
pub const BINDING_SUCCESS: MessageType = MessageType::new(Method::Binding, Class::SuccessResponse);
/// Binding indication type (session-table advertisement).
pub const BINDING_INDICATION: MessageType = MessageType::new(Method::Binding, Class::Indication);
/// Data indication type (gossip multicast).
pub const DATA_INDICATION: MessageType = MessageType::new(Method::Data, Class::Indication);
/// Channel-bind indication type (NAT pinhole keep-alive).
pub const CHANNEL_BIND_INDICATION: MessageType =
    MessageType::new(Method::ChannelBind, Class::Indication);

/// 12-byte transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    /// Generates a fresh random transaction id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Returns true when `buf` plausibly frames a rendezvous message: long
/// enough for a header and carrying the magic cookie.
pub fn is_message(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Builder for outbound messages.
///
/// Attributes are appended in call order; [`MessageBuilder::build`]
/// appends the integrity tag and fingerprint trailer and returns the
/// finished datagram.
#[derive(Debug)]
pub struct MessageBuilder {
    buf: BytesMut,
}

impl MessageBuilder {
    /// Starts a message of the given type with a fresh transaction id.
    pub fn new(message_type: MessageType) -> Self {
        Self::with_transaction_id(message_type, TransactionId::random())
    }

    /// Starts a message that echoes an existing transaction id (used for
    /// responses).
    pub fn with_transaction_id(message_type: MessageType, transaction_id: TransactionId) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u16(message_type.encode());
        buf.put_u16(0); // patched as attributes are appended
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&transaction_id.0);
        Self { buf }
    }

    fn put_attribute(&mut self, attr_type: u16, value: &[u8]) {
        self.buf.put_u16(attr_type);
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
        let pad = (4 - value.len() % 4) % 4;
        self.buf.put_bytes(0, pad);
        self.patch_length();
    }

    fn patch_length(&mut self) {
        let len = (self.buf.len() - HEADER_LEN) as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    /// Appends the sender's peer id as the `USERNAME` attribute.
    pub fn username(mut self, id: &PeerId) -> Self {
        self.put_attribute(ATTR_USERNAME, id.as_bytes());
        self
    }

    /// Appends an `XOR-MAPPED-ADDRESS` attribute.
    pub fn xor_mapped_address(mut self, addr: std::net::SocketAddr) -> Self {
        let transaction_id = {
            let mut txid = [0u8; 12];
            txid.copy_from_slice(&self.buf[8..HEADER_LEN]);
            txid
        };
        let mut value = Vec::with_capacity(20);
        value.push(0);
        let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
        match addr.ip() {
            std::net::IpAddr::V4(ip) => {
                value.push(0x01);
                value.extend_from_slice(&xport.to_be_bytes());
                let mask = MAGIC_COOKIE.to_be_bytes();
                value.extend(ip.octets().iter().zip(mask).map(|(o, m)| o ^ m));
            },
            std::net::IpAddr::V6(ip) => {
                value.push(0x02);
                value.extend_from_slice(&xport.to_be_bytes());
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(&transaction_id);
                value.extend(ip.octets().iter().zip(mask).map(|(o, m)| o ^ m));
            },
        }
        self.put_attribute(ATTR_XOR_MAPPED_ADDRESS, &value);
        self
    }

    /// Appends the sender's swarm ports in the `EVEN-PORT` carrier: two
    /// little-endian u32s, (external, internal).
    pub fn swarm_ports(mut self, external: u16, internal: u16) -> Self {
        let mut value = [0u8; 8];
        value[..4].copy_from_slice(&u32::from(external).to_le_bytes());
        value[4..].copy_from_slice(&u32::from(internal).to_le_bytes());
        self.put_attribute(ATTR_EVEN_PORT, &value);
        self
    }

    /// Appends an opaque payload as the `DATA` attribute.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::PayloadTooLarge`] when the payload exceeds
    /// [`MAX_PACKET_DATA`].
    pub fn data(mut self, payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() > MAX_PACKET_DATA {
            return Err(WireError::PayloadTooLarge { len: payload.len() });
        }
        self.put_attribute(ATTR_DATA, payload);
        Ok(self)
    }

    /// Appends a session table as a `DATA` attribute in canonical
    /// MessagePack form.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BadAttribute`] when the table fails to encode.
    pub fn session_table(self, table: &SessionTable) -> Result<Self, WireError> {
        let encoded = table
            .encode()
            .map_err(|_| WireError::BadAttribute("session table"))?;
        self.data(&encoded)
    }

    /// Seals the message: appends `MESSAGE-INTEGRITY` (HMAC-SHA1 under
    /// `password`) and the `FINGERPRINT` trailer, then returns the
    /// datagram bytes.
    pub fn build(mut self, password: &str) -> Bytes {
        // The integrity tag covers the message up to its own attribute,
        // with the header length counting that attribute.
        let tagged_len = (self.buf.len() - HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
        self.buf[2..4].copy_from_slice(&tagged_len.to_be_bytes());
        let tag = integrity_tag(password, &self.buf);
        self.buf.put_u16(ATTR_MESSAGE_INTEGRITY);
        self.buf.put_u16(INTEGRITY_LEN as u16);
        self.buf.put_slice(&tag);

        // The fingerprint covers everything before it, with the header
        // length counting the fingerprint attribute itself.
        let final_len = (self.buf.len() - HEADER_LEN + 8) as u16;
        self.buf[2..4].copy_from_slice(&final_len.to_be_bytes());
        let crc = crc32fast::hash(&self.buf) ^ FINGERPRINT_XOR;
        self.buf.put_u16(ATTR_FINGERPRINT);
        self.buf.put_u16(4);
        self.buf.put_u32(crc);

        self.buf.freeze()
    }
}

fn integrity_tag(password: &str, covered: &[u8]) -> [u8; INTEGRITY_LEN] {
    let mut mac =
        HmacSha1::new_from_slice(password.as_bytes()).expect("hmac accepts any key length");
    mac.update(covered);
    mac.finalize().into_bytes().into()
}

struct RawAttribute {
    attr_type: u16,
    /// Offset of the attribute header within the message.
    offset: usize,
    value: Bytes,
}

/// A parsed inbound message. Parsing checks framing only; call
/// [`Message::validate`] (or the [`validate`] helper) before trusting the
/// contents.
pub struct Message {
    raw: Bytes,
    message_type: MessageType,
    transaction_id: TransactionId,
    attributes: Vec<RawAttribute>,
}

impl Message {
    /// Parses the framing of a datagram: header, cookie, known method,
    /// and well-formed TLV attributes.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] describing the first framing defect.
    pub fn parse(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated("header"));
        }
        if datagram[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return Err(WireError::BadCookie);
        }
        let raw_type = u16::from_be_bytes([datagram[0], datagram[1]]);
        let message_type = MessageType::decode(raw_type)?;
        let body_len = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
        if datagram.len() < HEADER_LEN + body_len {
            return Err(WireError::Truncated("body"));
        }
        let raw = Bytes::copy_from_slice(&datagram[..HEADER_LEN + body_len]);

        let mut transaction_id = TransactionId([0; 12]);
        transaction_id.0.copy_from_slice(&raw[8..HEADER_LEN]);

        let mut attributes = Vec::new();
        let mut cursor = HEADER_LEN;
        while cursor < raw.len() {
            if cursor + 4 > raw.len() {
                return Err(WireError::Truncated("attribute header"));
            }
            let attr_type = u16::from_be_bytes([raw[cursor], raw[cursor + 1]]);
            let value_len = u16::from_be_bytes([raw[cursor + 2], raw[cursor + 3]]) as usize;
            let value_start = cursor + 4;
            let value_end = value_start + value_len;
            if value_end > raw.len() {
                return Err(WireError::Truncated("attribute value"));
            }
            attributes.push(RawAttribute {
                attr_type,
                offset: cursor,
                value: raw.slice(value_start..value_end),
            });
            cursor = value_end + (4 - value_len % 4) % 4;
        }

        Ok(Self {
            raw,
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// The message's (method, class) pair.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The message's transaction id.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    fn attribute(&self, attr_type: u16) -> Option<&RawAttribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// The sender's peer id from the `USERNAME` attribute.
    ///
    /// # Errors
    ///
    /// Missing attribute or a value that is not exactly 6 bytes.
    pub fn username(&self) -> Result<PeerId, WireError> {
        let attr = self
            .attribute(ATTR_USERNAME)
            .ok_or(WireError::MissingAttribute("username"))?;
        if attr.value.len() != PEER_ID_LEN {
            return Err(WireError::BadAttribute("username"));
        }
        PeerId::from_slice(&attr.value).map_err(|_| WireError::BadAttribute("username"))
    }

    /// The `XOR-MAPPED-ADDRESS` attribute, un-XORed.
    ///
    /// # Errors
    ///
    /// Missing attribute, unknown address family, or a malformed value.
    pub fn xor_mapped_address(&self) -> Result<std::net::SocketAddr, WireError> {
        let attr = self
            .attribute(ATTR_XOR_MAPPED_ADDRESS)
            .ok_or(WireError::MissingAttribute("xor-mapped-address"))?;
        let value = &attr.value;
        if value.len() < 8 {
            return Err(WireError::BadAttribute("xor-mapped-address"));
        }
        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        match value[1] {
            0x01 if value.len() == 8 => {
                let mask = MAGIC_COOKIE.to_be_bytes();
                let mut octets = [0u8; 4];
                for (i, o) in octets.iter_mut().enumerate() {
                    *o = value[4 + i] ^ mask[i];
                }
                Ok(std::net::SocketAddr::from((octets, port)))
            },
            0x02 if value.len() == 20 => {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(&self.transaction_id.0);
                let mut octets = [0u8; 16];
                for (i, o) in octets.iter_mut().enumerate() {
                    *o = value[4 + i] ^ mask[i];
                }
                Ok(std::net::SocketAddr::from((octets, port)))
            },
            _ => Err(WireError::BadAttribute("xor-mapped-address")),
        }
    }

    /// The swarm ports carried in the `EVEN-PORT` attribute:
    /// (external, internal).
    ///
    /// # Errors
    ///
    /// Missing attribute or a value that is not two little-endian u32s.
    pub fn swarm_ports(&self) -> Result<(u16, u16), WireError> {
        let attr = self
            .attribute(ATTR_EVEN_PORT)
            .ok_or(WireError::MissingAttribute("even-port"))?;
        let value = &attr.value;
        if value.len() != 8 {
            return Err(WireError::BadAttribute("even-port"));
        }
        let external = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        let internal = u32::from_le_bytes([value[4], value[5], value[6], value[7]]);
        let external =
            u16::try_from(external).map_err(|_| WireError::BadAttribute("even-port"))?;
        let internal =
            u16::try_from(internal).map_err(|_| WireError::BadAttribute("even-port"))?;
        Ok((external, internal))
    }

    /// The opaque `DATA` payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MissingAttribute`] when absent.
    pub fn data(&self) -> Result<Bytes, WireError> {
        self.attribute(ATTR_DATA)
            .map(|a| a.value.clone())
            .ok_or(WireError::MissingAttribute("data"))
    }

    /// True when the message carries a `DATA` attribute.
    pub fn has_data(&self) -> bool {
        self.attribute(ATTR_DATA).is_some()
    }

    /// Decodes the `DATA` payload as a session table.
    ///
    /// # Errors
    ///
    /// Missing attribute or a payload that is not canonical MessagePack.
    pub fn session_table(&self) -> Result<SessionTable, WireError> {
        let data = self.data()?;
        SessionTable::decode(&data).map_err(|_| WireError::BadAttribute("session table"))
    }

    /// Verifies the authenticity checks: 6-byte username present,
    /// fingerprint trailer matches, and the integrity tag matches under
    /// `password`.
    ///
    /// # Errors
    ///
    /// The first failing check, as a [`WireError`].
    pub fn validate(&self, password: &str) -> Result<(), WireError> {
        self.username()?;

        let fingerprint = self
            .attribute(ATTR_FINGERPRINT)
            .ok_or(WireError::MissingAttribute("fingerprint"))?;
        if fingerprint.value.len() != 4 {
            return Err(WireError::BadAttribute("fingerprint"));
        }
        let claimed = u32::from_be_bytes([
            fingerprint.value[0],
            fingerprint.value[1],
            fingerprint.value[2],
            fingerprint.value[3],
        ]);
        let computed = crc32fast::hash(&self.raw[..fingerprint.offset]) ^ FINGERPRINT_XOR;
        if claimed != computed {
            return Err(WireError::BadFingerprint);
        }

        let integrity = self
            .attribute(ATTR_MESSAGE_INTEGRITY)
            .ok_or(WireError::MissingAttribute("message-integrity"))?;
        if integrity.value.len() != INTEGRITY_LEN {
            return Err(WireError::BadAttribute("message-integrity"));
        }
        // The tag was computed with the header length counting up to and
        // including the integrity attribute; reconstruct that view.
        let mut covered = self.raw[..integrity.offset].to_vec();
        let tagged_len = (integrity.offset - HEADER_LEN + 4 + INTEGRITY_LEN) as u16;
        covered[2..4].copy_from_slice(&tagged_len.to_be_bytes());
        let expected = integrity_tag(password, &covered);
        if expected[..] != integrity.value[..] {
            return Err(WireError::BadIntegrity);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.message_type.to_string())
            .field("attributes", &self.attributes.len())
            .field("len", &self.raw.len())
            .finish()
    }
}

/// Parses and authenticates a datagram in one step, optionally requiring
/// a specific message type.
///
/// # Errors
///
/// Any framing or authenticity defect, or [`WireError::UnexpectedType`]
/// when `expected` is given and does not match.
pub fn validate(
    datagram: &[u8],
    password: &str,
    expected: Option<MessageType>,
) -> Result<Message, WireError> {
    let message = Message::parse(datagram)?;
    if let Some(expected) = expected {
        if message.message_type() != expected {
            return Err(WireError::UnexpectedType {
                expected,
                actual: message.message_type(),
            });
        }
    }
    message.validate(password)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Session;

    const PASSWORD: &str = "relay-password";

    fn peer() -> PeerId {
        PeerId::new([0xb8, 0x27, 0xeb, 0xaa, 0xbb, 0xcc])
    }

    #[test]
    fn message_type_round_trips() {
        for method in [Method::Binding, Method::Data, Method::ChannelBind] {
            for class in [
                Class::Request,
                Class::Indication,
                Class::SuccessResponse,
                Class::ErrorResponse,
            ] {
                let t = MessageType::new(method, class);
                assert_eq!(MessageType::decode(t.encode()).unwrap(), t);
            }
        }
    }

    #[test]
    fn binding_request_round_trips() {
        let datagram = MessageBuilder::new(BINDING_REQUEST)
            .username(&peer())
            .xor_mapped_address("192.168.1.20:9322".parse().unwrap())
            .swarm_ports(6881, 6882)
            .build(PASSWORD);

        assert!(is_message(&datagram));
        let message = validate(&datagram, PASSWORD, Some(BINDING_REQUEST)).unwrap();
        assert_eq!(message.username().unwrap(), peer());
        assert_eq!(
            message.xor_mapped_address().unwrap(),
            "192.168.1.20:9322".parse::<std::net::SocketAddr>().unwrap()
        );
        assert_eq!(message.swarm_ports().unwrap(), (6881, 6882));
    }

    #[test]
    fn ipv6_mapped_address_round_trips() {
        let addr: std::net::SocketAddr = "[2001:db8::7]:700".parse().unwrap();
        let datagram = MessageBuilder::new(BINDING_SUCCESS)
            .username(&peer())
            .xor_mapped_address(addr)
            .build(PASSWORD);
        let message = validate(&datagram, PASSWORD, None).unwrap();
        assert_eq!(message.xor_mapped_address().unwrap(), addr);
    }

    #[test]
    fn session_table_payload_round_trips() {
        let session = Session {
            external: "203.0.113.7:9322".parse().unwrap(),
            internal: "192.168.1.20:9322".parse().unwrap(),
            swarm_external: "203.0.113.7:6881".parse().unwrap(),
            swarm_internal: "192.168.1.20:6881".parse().unwrap(),
        };
        let table = SessionTable::singleton(peer(), session);
        let datagram = MessageBuilder::new(BINDING_INDICATION)
            .username(&peer())
            .session_table(&table)
            .unwrap()
            .build(PASSWORD);

        let message = validate(&datagram, PASSWORD, Some(BINDING_INDICATION)).unwrap();
        assert_eq!(message.session_table().unwrap(), table);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let datagram = MessageBuilder::new(DATA_INDICATION)
            .username(&peer())
            .data(b"payload")
            .unwrap()
            .build(PASSWORD);

        let err = validate(&datagram, "other-password", None).unwrap_err();
        assert!(matches!(err, WireError::BadIntegrity));
    }

    #[test]
    fn tampered_payload_fails_the_fingerprint() {
        let datagram = MessageBuilder::new(DATA_INDICATION)
            .username(&peer())
            .data(b"payload")
            .unwrap()
            .build(PASSWORD);
        let mut tampered = datagram.to_vec();
        // Flip one bit inside the data attribute.
        let n = tampered.len();
        tampered[n - 30] ^= 0x01;

        let err = validate(&tampered, PASSWORD, None).unwrap_err();
        assert!(matches!(
            err,
            WireError::BadFingerprint | WireError::BadIntegrity
        ));
    }

    #[test]
    fn unexpected_class_is_an_error_not_a_promotion() {
        let datagram = MessageBuilder::new(BINDING_INDICATION)
            .username(&peer())
            .build(PASSWORD);
        let err = validate(&datagram, PASSWORD, Some(BINDING_SUCCESS)).unwrap_err();
        assert!(matches!(err, WireError::UnexpectedType { .. }));
    }

    #[test]
    fn missing_username_is_rejected() {
        let datagram = MessageBuilder::new(BINDING_REQUEST).build(PASSWORD);
        let err = validate(&datagram, PASSWORD, None).unwrap_err();
        assert!(matches!(err, WireError::MissingAttribute("username")));
    }

    #[test]
    fn non_stun_datagram_is_rejected() {
        assert!(!is_message(b"hello"));
        assert!(matches!(
            Message::parse(b"hello"),
            Err(WireError::Truncated(_))
        ));
        let mut junk = [0u8; 32];
        junk[0] = 0x00;
        assert!(matches!(Message::parse(&junk), Err(WireError::BadCookie)));
    }

    #[test]
    fn oversized_payload_is_refused_at_build_time() {
        let too_big = vec![0u8; MAX_PACKET_DATA + 1];
        let err = MessageBuilder::new(DATA_INDICATION)
            .username(&peer())
            .data(&too_big)
            .unwrap_err();
        assert!(matches!(err, WireError::PayloadTooLarge { .. }));
    }
}
