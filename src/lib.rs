//! CollabSync - Real-time synchronization provider for collaborative notes
//!
//! Keeps a local replicated document and a presence map consistent with a
//! server-authoritative relay over one persistent connection:
//! - Automerge CRDTs for conflict-free document state
//! - Binary framed protocol with an optional base64 text mode
//! - Capped exponential backoff and a liveness monitor for recovery
//! - A tokio driver that serializes every event into a single state machine

pub mod sync;
pub mod transport;

pub use sync::{
    config::ProviderConfig,
    document::{NoteDocument, Origin, ReplicaDocument, SharedReplica, UpdateEvent},
    driver::{spawn_provider, ProviderHandle},
    presence::PresenceState,
    provider::{ConnectionStatus, ProviderEvent, SessionState, StaticTokens, SyncProvider, TokenProvider},
    ClientId, DocumentId, SyncError, SyncResult,
};
pub use transport::{DisconnectReason, Transport, TransportEvent};
