//! Synchronization module for CRDT-based real-time collaboration.
//!
//! This module implements the client side of the relay protocol. It provides:
//! - Binary/base64 wire codec and the typed message protocol
//! - The sync state machine with join/sync lifecycle
//! - Pending update buffering, presence propagation
//! - Reconnection backoff, liveness monitoring and owned timers

pub mod backoff;
pub mod codec;
pub mod config;
pub mod document;
pub mod driver;
pub mod liveness;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod timers;

pub use config::ProviderConfig;
pub use document::NoteDocument;
pub use provider::SyncProvider;

use thiserror::Error;

use crate::transport::TransportError;
use codec::CodecError;
use document::ReplicaError;
use presence::PresenceError;
use protocol::ProtocolError;

/// Unique identifier for a note document
pub type DocumentId = String;

/// Unique identifier for one provider connection (the presence key)
pub type ClientId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("Presence error: {0}")]
    Presence(#[from] PresenceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider has been destroyed")]
    Destroyed,
}
