//! Cluster message types and wire framing
//!
//! Every message travels as one frame:
//! `MAGIC (4) | body length (u32, big endian) | JSON body`.
//! The fixed header lets a reader ask the connection for an exact byte
//! count: first the header, then exactly `length` bytes of body.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x43, 0x43, 0x48, 0x45]; // "CCHE"

/// Size of the frame header (magic + length)
pub const HEADER_SIZE: usize = 8;

/// Largest body a peer may announce (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Message encoding/decoding errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Messages exchanged between cluster nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// Sent by the dialing side to introduce itself
    Identify(IdentifyMessage),

    /// Answer to `Identify` once the accepting side admitted the peer
    Verify(VerifyMessage),

    /// Keep-alive ping
    Ping(u64),

    /// Keep-alive pong response
    Pong(u64),

    /// Sent best-effort before a node closes the connection on purpose
    Goodbye { reason: String },
}

/// Identification payload of the node that dialed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentifyMessage {
    /// Protocol version
    pub version: u32,
    /// Sender's node identity
    pub id: String,
    /// Port the sender accepts cluster connections on
    pub listen_port: u16,
    /// Addresses the sender listens on (empty = all interfaces)
    pub addresses: Vec<String>,
}

impl IdentifyMessage {
    pub fn new(id: &str, listen_port: u16, addresses: Vec<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            listen_port,
            addresses,
        }
    }
}

/// Verification response of the node that accepted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyMessage {
    /// Protocol version
    pub version: u32,
    /// Responder's node identity
    pub id: String,
    /// Port the responder accepts cluster connections on
    pub listen_port: u16,
}

impl VerifyMessage {
    pub fn new(id: &str, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.to_string(),
            listen_port,
        }
    }
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Encode into a complete frame ready for `Connection::send_data`
    pub fn to_frame(&self) -> Result<BytesMut, MessageError> {
        let mut buf = BytesMut::new();
        MessageCodec.encode(self.clone(), &mut buf)?;
        Ok(buf)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Identify(_) => "Identify",
            Message::Verify(_) => "Verify",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Goodbye { .. } => "Goodbye",
        }
    }
}

/// Validate a frame header and return the announced body length
pub fn parse_header(header: &[u8]) -> Result<usize, MessageError> {
    if header.len() < HEADER_SIZE || header[..4] != MAGIC {
        return Err(MessageError::InvalidMagic);
    }

    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(len));
    }

    Ok(len)
}

/// Message codec for length-prefixed framing
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = MessageError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.to_bytes()?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge(data.len()));
        }

        dst.reserve(HEADER_SIZE + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let len = parse_header(&src[..HEADER_SIZE])?;
        if src.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let data = src.split_to(len);

        Ok(Some(Message::from_bytes(&data)?))
    }
}
