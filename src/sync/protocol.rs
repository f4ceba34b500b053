//! Binary relay protocol for document synchronization.
//!
//! This module defines the message vocabulary exchanged with the relay and its
//! framing. Every frame is `[version][type][u24 length][bincode payload]`, with
//! CRDT deltas, state vectors and presence deltas embedded as raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};

use super::DocumentId;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Sync (binary payloads)
    SyncStep1 = 0x10,
    SyncStep2 = 0x11,
    Update = 0x12,
    SyncError = 0x13,

    // Session
    Join = 0x20,
    Leave = 0x21,
    JoinConfirmed = 0x22,
    JoinError = 0x23,

    // Presence (ephemeral, no envelope)
    Presence = 0x40,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x10 => Ok(MessageType::SyncStep1),
            0x11 => Ok(MessageType::SyncStep2),
            0x12 => Ok(MessageType::Update),
            0x13 => Ok(MessageType::SyncError),
            0x20 => Ok(MessageType::Join),
            0x21 => Ok(MessageType::Leave),
            0x22 => Ok(MessageType::JoinConfirmed),
            0x23 => Ok(MessageType::JoinError),
            0x40 => Ok(MessageType::Presence),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages sent from the provider to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Register for a document's update stream
    Join {
        document_id: DocumentId,
        /// Capability token granted by a share link
        share_token: Option<String>,
        /// Session token of the signed-in user
        auth_token: Option<String>,
    },

    /// Unregister from a document's update stream
    Leave { document_id: DocumentId },

    /// State vector of the local replica, asking for what it is missing
    SyncStep1 {
        document_id: DocumentId,
        state_vector: Vec<u8>,
    },

    /// Incremental CRDT delta
    Update {
        document_id: DocumentId,
        delta: Vec<u8>,
    },

    /// Encoded presence delta
    Presence(Vec<u8>),
}

/// Messages sent from the relay to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The join request was accepted
    JoinConfirmed,

    /// The join request was rejected
    JoinError { reason: String },

    /// The relay's state vector, asking for what it is missing
    SyncStep1 {
        document_id: DocumentId,
        state_vector: Vec<u8>,
    },

    /// Full document state answering a sync-step1
    SyncStep2 {
        document_id: DocumentId,
        full_state: Vec<u8>,
    },

    /// Incremental CRDT delta relayed from another participant
    Update {
        document_id: DocumentId,
        delta: Vec<u8>,
    },

    /// Encoded presence delta relayed from another participant
    Presence(Vec<u8>),

    /// The relay failed to process a sync message
    SyncError { message: String },
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Join { .. } => MessageType::Join,
            ClientMessage::Leave { .. } => MessageType::Leave,
            ClientMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            ClientMessage::Update { .. } => MessageType::Update,
            ClientMessage::Presence(_) => MessageType::Presence,
        }
    }
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::JoinConfirmed => MessageType::JoinConfirmed,
            ServerMessage::JoinError { .. } => MessageType::JoinError,
            ServerMessage::SyncStep1 { .. } => MessageType::SyncStep1,
            ServerMessage::SyncStep2 { .. } => MessageType::SyncStep2,
            ServerMessage::Update { .. } => MessageType::Update,
            ServerMessage::Presence(_) => MessageType::Presence,
            ServerMessage::SyncError { .. } => MessageType::SyncError,
        }
    }
}

/// Protocol codec for encoding/decoding messages
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        Self::frame(msg.message_type(), &bincode::serialize(msg)?)
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;

        if msg.message_type() != msg_type {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header says {:?}, payload is {:?}",
                msg_type,
                msg.message_type()
            )));
        }

        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let (msg_type, payload) = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;

        if msg.message_type() != msg_type {
            return Err(ProtocolError::InvalidFormat(format!(
                "Header says {:?}, payload is {:?}",
                msg_type,
                msg.message_type()
            )));
        }

        Ok(msg)
    }

    fn frame(msg_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        if payload.len() + HEADER_LEN > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + HEADER_LEN,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(payload);

        Ok(buf.freeze())
    }

    fn unframe(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let msg_type = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok((msg_type, &data[HEADER_LEN..HEADER_LEN + payload_len]))
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
