//! DHT message module
//!
//! Binary wire codec for the four request/response pairs. Every datagram is
//! a fixed 46-byte header followed by an opcode-specific payload. All
//! integers are big-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tracing::trace;

use crate::dht::contact::{Contact, LOCAL_VENDOR, LOCAL_VERSION};
use crate::dht::database::{DhtValueEntity, DhtValueType};
use crate::dht::kuid::{Kuid, KUID_LENGTH};
use crate::dht::token::SecurityToken;
use crate::error::{DhtError, Result};

/// Wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header length in bytes
pub const HEADER_LENGTH: usize = 46;

/// Correlation id length in bytes
pub const MESSAGE_ID_LENGTH: usize = 16;

const FLAG_FIREWALLED: u8 = 0x01;

/// DHT message opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    PingRequest = 0x01,
    PingResponse = 0x02,
    StoreRequest = 0x03,
    StoreResponse = 0x04,
    FindNodeRequest = 0x05,
    FindNodeResponse = 0x06,
    FindValueRequest = 0x07,
    FindValueResponse = 0x08,
}

impl OpCode {
    pub fn is_request(&self) -> bool {
        (*self as u8) % 2 == 1
    }

    /// Opcode of the matching response
    pub fn response(&self) -> OpCode {
        match self {
            OpCode::PingRequest | OpCode::PingResponse => OpCode::PingResponse,
            OpCode::StoreRequest | OpCode::StoreResponse => OpCode::StoreResponse,
            OpCode::FindNodeRequest | OpCode::FindNodeResponse => OpCode::FindNodeResponse,
            OpCode::FindValueRequest | OpCode::FindValueResponse => OpCode::FindValueResponse,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = DhtError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(OpCode::PingRequest),
            0x02 => Ok(OpCode::PingResponse),
            0x03 => Ok(OpCode::StoreRequest),
            0x04 => Ok(OpCode::StoreResponse),
            0x05 => Ok(OpCode::FindNodeRequest),
            0x06 => Ok(OpCode::FindNodeResponse),
            0x07 => Ok(OpCode::FindValueRequest),
            0x08 => Ok(OpCode::FindValueResponse),
            _ => Err(DhtError::protocol_error_with_source(
                "Invalid opcode",
                format!("value: {:#04x}", value),
            )),
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpCode::PingRequest => "PING_REQUEST",
            OpCode::PingResponse => "PING_RESPONSE",
            OpCode::StoreRequest => "STORE_REQUEST",
            OpCode::StoreResponse => "STORE_RESPONSE",
            OpCode::FindNodeRequest => "FIND_NODE_REQUEST",
            OpCode::FindNodeResponse => "FIND_NODE_RESPONSE",
            OpCode::FindValueRequest => "FIND_VALUE_REQUEST",
            OpCode::FindValueResponse => "FIND_VALUE_RESPONSE",
        };
        write!(f, "{}", name)
    }
}

/// Request/response correlation id
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MESSAGE_ID_LENGTH]);

impl MessageId {
    pub fn random() -> Self {
        let mut id = [0u8; MESSAGE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", &self.to_hex()[..8])
    }
}

/// Identity of the node that sent a message, as carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sender {
    pub id: Kuid,
    pub vendor: u32,
    pub version: u16,
    pub instance_id: u8,
    pub firewalled: bool,
}

impl Sender {
    /// Header fields for a node running this implementation
    pub fn local(id: Kuid, instance_id: u8, firewalled: bool) -> Self {
        Self {
            id,
            vendor: LOCAL_VENDOR,
            version: LOCAL_VERSION,
            instance_id,
            firewalled,
        }
    }

    /// The sender as a live contact reachable at `addr`
    pub fn to_contact(&self, addr: SocketAddr) -> Contact {
        Contact::alive(self.id, addr)
            .with_vendor(self.vendor, self.version)
            .with_instance_id(self.instance_id)
            .with_firewalled(self.firewalled)
    }
}

/// A contact as listed in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactInfo {
    pub id: Kuid,
    pub addr: SocketAddr,
}

impl ContactInfo {
    /// A second-hand contact, state `Unknown`
    pub fn to_contact(&self) -> Contact {
        Contact::new(self.id, self.addr)
    }
}

impl From<&Contact> for ContactInfo {
    fn from(contact: &Contact) -> Self {
        Self {
            id: contact.id,
            addr: contact.addr,
        }
    }
}

/// Outcome of storing one entity, or of a whole store request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StoreStatusCode {
    Success = 0,
    Failure = 1,
    InvalidToken = 2,
}

impl TryFrom<u8> for StoreStatusCode {
    type Error = DhtError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StoreStatusCode::Success),
            1 => Ok(StoreStatusCode::Failure),
            2 => Ok(StoreStatusCode::InvalidToken),
            _ => Err(DhtError::protocol_error_with_source(
                "Invalid store status",
                format!("value: {}", value),
            )),
        }
    }
}

/// Per-entity store status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub key: Kuid,
    pub creator: Kuid,
    pub code: StoreStatusCode,
}

/// Payload of a FindValue response
#[derive(Debug, Clone, PartialEq)]
pub enum FindValueReply {
    /// The responder holds values for the key
    Values {
        request_load: f32,
        entities: Vec<DhtValueEntity>,
    },
    /// No values here; continue with these contacts
    Contacts {
        token: SecurityToken,
        contacts: Vec<ContactInfo>,
    },
}

/// Opcode-specific message payload
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    PingRequest,
    PingResponse {
        /// Requester's address as seen by the responder
        external_addr: SocketAddr,
        estimated_size: u32,
    },
    FindNodeRequest {
        target: Kuid,
    },
    FindNodeResponse {
        token: SecurityToken,
        contacts: Vec<ContactInfo>,
    },
    FindValueRequest {
        key: Kuid,
        value_type: DhtValueType,
    },
    FindValueResponse(FindValueReply),
    StoreRequest {
        token: SecurityToken,
        entities: Vec<DhtValueEntity>,
    },
    StoreResponse {
        status: StoreStatusCode,
        results: Vec<StoreStatus>,
    },
}

impl MessageBody {
    pub fn opcode(&self) -> OpCode {
        match self {
            MessageBody::PingRequest => OpCode::PingRequest,
            MessageBody::PingResponse { .. } => OpCode::PingResponse,
            MessageBody::FindNodeRequest { .. } => OpCode::FindNodeRequest,
            MessageBody::FindNodeResponse { .. } => OpCode::FindNodeResponse,
            MessageBody::FindValueRequest { .. } => OpCode::FindValueRequest,
            MessageBody::FindValueResponse(_) => OpCode::FindValueResponse,
            MessageBody::StoreRequest { .. } => OpCode::StoreRequest,
            MessageBody::StoreResponse { .. } => OpCode::StoreResponse,
        }
    }
}

/// A decoded DHT message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub body: MessageBody,
}

impl Message {
    /// Create a request with a fresh random id
    pub fn request(sender: Sender, body: MessageBody) -> Self {
        Self {
            id: MessageId::random(),
            sender,
            body,
        }
    }

    /// Create a response reusing the request's id
    pub fn response(request_id: MessageId, sender: Sender, body: MessageBody) -> Self {
        Self {
            id: request_id,
            sender,
            body,
        }
    }

    pub fn opcode(&self) -> OpCode {
        self.body.opcode()
    }

    pub fn is_request(&self) -> bool {
        self.opcode().is_request()
    }

    /// Serialize the message to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + 64);

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.opcode() as u8);
        buf.put_slice(&self.id.0);
        buf.put_slice(self.sender.id.as_bytes());
        buf.put_u32(self.sender.vendor);
        buf.put_u16(self.sender.version);
        buf.put_u8(self.sender.instance_id);
        buf.put_u8(if self.sender.firewalled { FLAG_FIREWALLED } else { 0 });

        match &self.body {
            MessageBody::PingRequest => {}
            MessageBody::PingResponse {
                external_addr,
                estimated_size,
            } => {
                put_addr(&mut buf, external_addr);
                buf.put_u32(*estimated_size);
            }
            MessageBody::FindNodeRequest { target } => {
                buf.put_slice(target.as_bytes());
            }
            MessageBody::FindNodeResponse { token, contacts } => {
                put_token(&mut buf, token);
                put_contacts(&mut buf, contacts);
            }
            MessageBody::FindValueRequest { key, value_type } => {
                buf.put_slice(key.as_bytes());
                buf.put_u32(value_type.0);
            }
            MessageBody::FindValueResponse(FindValueReply::Values {
                request_load,
                entities,
            }) => {
                buf.put_u8(0);
                buf.put_f32(*request_load);
                buf.put_u16(entities.len().min(u16::MAX as usize) as u16);
                for entity in entities.iter().take(u16::MAX as usize) {
                    put_entity(&mut buf, entity);
                }
            }
            MessageBody::FindValueResponse(FindValueReply::Contacts { token, contacts }) => {
                buf.put_u8(1);
                put_token(&mut buf, token);
                put_contacts(&mut buf, contacts);
            }
            MessageBody::StoreRequest { token, entities } => {
                put_token(&mut buf, token);
                buf.put_u16(entities.len().min(u16::MAX as usize) as u16);
                for entity in entities.iter().take(u16::MAX as usize) {
                    put_entity(&mut buf, entity);
                }
            }
            MessageBody::StoreResponse { status, results } => {
                buf.put_u8(*status as u8);
                buf.put_u16(results.len().min(u16::MAX as usize) as u16);
                for result in results.iter().take(u16::MAX as usize) {
                    buf.put_slice(result.key.as_bytes());
                    buf.put_slice(result.creator.as_bytes());
                    buf.put_u8(result.code as u8);
                }
            }
        }

        trace!("Encoded {} message: {} bytes", self.opcode(), buf.len());
        buf.to_vec()
    }

    /// Deserialize a message from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;

        need(&buf, HEADER_LENGTH, "header")?;
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DhtError::protocol_error_with_source(
                "Unsupported protocol version",
                format!("version: {}", version),
            ));
        }
        let opcode = OpCode::try_from(buf.get_u8())?;
        let mut id = [0u8; MESSAGE_ID_LENGTH];
        buf.copy_to_slice(&mut id);
        let sender_id = get_kuid(&mut buf)?;
        let vendor = buf.get_u32();
        let sender_version = buf.get_u16();
        let instance_id = buf.get_u8();
        let flags = buf.get_u8();

        let sender = Sender {
            id: sender_id,
            vendor,
            version: sender_version,
            instance_id,
            firewalled: flags & FLAG_FIREWALLED != 0,
        };

        let body = match opcode {
            OpCode::PingRequest => MessageBody::PingRequest,
            OpCode::PingResponse => {
                let external_addr = get_addr(&mut buf)?;
                need(&buf, 4, "estimated size")?;
                MessageBody::PingResponse {
                    external_addr,
                    estimated_size: buf.get_u32(),
                }
            }
            OpCode::FindNodeRequest => MessageBody::FindNodeRequest {
                target: get_kuid(&mut buf)?,
            },
            OpCode::FindNodeResponse => {
                let token = get_token(&mut buf)?;
                let contacts = get_contacts(&mut buf)?;
                MessageBody::FindNodeResponse { token, contacts }
            }
            OpCode::FindValueRequest => {
                let key = get_kuid(&mut buf)?;
                need(&buf, 4, "value type")?;
                MessageBody::FindValueRequest {
                    key,
                    value_type: DhtValueType(buf.get_u32()),
                }
            }
            OpCode::FindValueResponse => {
                need(&buf, 1, "reply kind")?;
                match buf.get_u8() {
                    0 => {
                        need(&buf, 6, "request load and value count")?;
                        let request_load = buf.get_f32();
                        let count = buf.get_u16() as usize;
                        let mut entities = Vec::with_capacity(count.min(64));
                        for _ in 0..count {
                            entities.push(get_entity(&mut buf)?);
                        }
                        MessageBody::FindValueResponse(FindValueReply::Values {
                            request_load,
                            entities,
                        })
                    }
                    1 => {
                        let token = get_token(&mut buf)?;
                        let contacts = get_contacts(&mut buf)?;
                        MessageBody::FindValueResponse(FindValueReply::Contacts { token, contacts })
                    }
                    kind => {
                        return Err(DhtError::protocol_error_with_source(
                            "Invalid find value reply kind",
                            format!("value: {}", kind),
                        ))
                    }
                }
            }
            OpCode::StoreRequest => {
                let token = get_token(&mut buf)?;
                need(&buf, 2, "entity count")?;
                let count = buf.get_u16() as usize;
                let mut entities = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    entities.push(get_entity(&mut buf)?);
                }
                MessageBody::StoreRequest { token, entities }
            }
            OpCode::StoreResponse => {
                need(&buf, 3, "store status")?;
                let status = StoreStatusCode::try_from(buf.get_u8())?;
                let count = buf.get_u16() as usize;
                let mut results = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let key = get_kuid(&mut buf)?;
                    let creator = get_kuid(&mut buf)?;
                    need(&buf, 1, "entity status")?;
                    let code = StoreStatusCode::try_from(buf.get_u8())?;
                    results.push(StoreStatus { key, creator, code });
                }
                MessageBody::StoreResponse { status, results }
            }
        };

        if buf.has_remaining() {
            trace!("{} message has {} trailing bytes", opcode, buf.remaining());
            return Err(DhtError::protocol_error_with_source(
                "Trailing bytes after payload",
                format!("{} bytes", buf.remaining()),
            ));
        }

        trace!("Decoded {} message from {} bytes", opcode, data.len());
        Ok(Message {
            id: MessageId(id),
            sender,
            body,
        })
    }
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(DhtError::protocol_error_with_source(
            format!("Message too short: missing {}", what),
            format!("expected {} bytes, got {}", len, buf.remaining()),
        ));
    }
    Ok(())
}

fn get_kuid(buf: &mut &[u8]) -> Result<Kuid> {
    need(buf, KUID_LENGTH, "KUID")?;
    let id = Kuid::from_bytes(&buf[..KUID_LENGTH])?;
    buf.advance(KUID_LENGTH);
    Ok(id)
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

fn get_addr(buf: &mut &[u8]) -> Result<SocketAddr> {
    need(buf, 1, "address family")?;
    let ip = match buf.get_u8() {
        4 => {
            need(buf, 4 + 2, "IPv4 address")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            need(buf, 16 + 2, "IPv6 address")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => {
            return Err(DhtError::protocol_error_with_source(
                "Invalid address family",
                format!("value: {}", family),
            ))
        }
    };
    Ok(SocketAddr::new(ip, buf.get_u16()))
}

fn put_token(buf: &mut BytesMut, token: &SecurityToken) {
    let bytes = token.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&bytes[..len]);
}

fn get_token(buf: &mut &[u8]) -> Result<SecurityToken> {
    need(buf, 1, "token length")?;
    let len = buf.get_u8() as usize;
    need(buf, len, "token")?;
    let token = SecurityToken::new(buf[..len].to_vec());
    buf.advance(len);
    Ok(token)
}

fn put_contacts(buf: &mut BytesMut, contacts: &[ContactInfo]) {
    let count = contacts.len().min(u8::MAX as usize);
    buf.put_u8(count as u8);
    for contact in &contacts[..count] {
        buf.put_slice(contact.id.as_bytes());
        put_addr(buf, &contact.addr);
    }
}

fn get_contacts(buf: &mut &[u8]) -> Result<Vec<ContactInfo>> {
    need(buf, 1, "contact count")?;
    let count = buf.get_u8() as usize;
    let mut contacts = Vec::with_capacity(count);
    for _ in 0..count {
        let id = get_kuid(buf)?;
        let addr = get_addr(buf)?;
        contacts.push(ContactInfo { id, addr });
    }
    Ok(contacts)
}

fn put_entity(buf: &mut BytesMut, entity: &DhtValueEntity) {
    buf.put_slice(entity.creator.as_bytes());
    put_addr(buf, &entity.creator_addr);
    buf.put_slice(entity.key.as_bytes());
    buf.put_u32(entity.value_type.0);
    buf.put_u16(entity.version);
    let len = entity.value.len().min(u16::MAX as usize);
    buf.put_u16(len as u16);
    buf.put_slice(&entity.value[..len]);
}

fn get_entity(buf: &mut &[u8]) -> Result<DhtValueEntity> {
    let creator = get_kuid(buf)?;
    let creator_addr = get_addr(buf)?;
    let key = get_kuid(buf)?;
    need(buf, 8, "value header")?;
    let value_type = DhtValueType(buf.get_u32());
    let version = buf.get_u16();
    let len = buf.get_u16() as usize;
    need(buf, len, "value bytes")?;
    let value = buf[..len].to_vec();
    buf.advance(len);
    Ok(DhtValueEntity::new(creator, creator_addr, key, value_type, value).with_version(version))
}
