//! Replica document abstraction and its Automerge implementation.
//!
//! The provider only needs four things from a CRDT: apply a delta, emit a
//! delta whenever the replica changes, encode its full state and encode a
//! state vector. `NoteDocument` provides them for a markdown note held in an
//! Automerge text object.

use automerge::{transaction::Transactable, ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, Value, ROOT};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::ClientId;

/// Length of an Automerge change hash inside an encoded state vector
const HASH_LEN: usize = 32;

/// Key of the note's markdown text in the document root
const CONTENT: &str = "content";

/// Every Automerge chunk (document or change) starts with these bytes
const CHUNK_MAGIC: [u8; 4] = [0x85, 0x6f, 0x4a, 0x83];

/// Errors that can occur during replica operations
#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Invalid state vector: {0} bytes is not a multiple of {HASH_LEN}")]
    InvalidStateVector(usize),

    #[error("Document corruption: {0}")]
    Corruption(String),
}

pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Where a replica mutation came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// An edit made by the local user
    Local,
    /// A delta applied by the sync provider with this client id
    Sync(ClientId),
}

/// A delta emitted by a replica after it changed
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
    pub origin: Origin,
}

/// The replicated document the provider keeps in sync.
///
/// Implementations emit an [`UpdateEvent`] to every subscriber after each
/// mutation, tagged with the origin passed to [`ReplicaDocument::apply_update`]
/// or [`Origin::Local`] for user edits.
pub trait ReplicaDocument: Send + 'static {
    /// Merge a binary delta or full state into the replica
    fn apply_update(&mut self, update: &[u8], origin: Origin) -> ReplicaResult<()>;

    /// Everything a peer with `state_vector` is missing, or the full state
    fn encode_state_as_update(&mut self, state_vector: Option<&[u8]>) -> ReplicaResult<Vec<u8>>;

    /// Compact summary of what this replica has seen
    fn encode_state_vector(&mut self) -> Vec<u8>;

    /// Register for deltas produced by future mutations
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UpdateEvent>;
}

/// Replica shared between the provider and the host application
pub type SharedReplica<D> = Arc<Mutex<D>>;

/// Collaborative markdown note backed by Automerge
pub struct NoteDocument {
    /// The underlying Automerge document
    doc: AutoCommit,
    /// Heads at the time the last update event was emitted
    emitted_heads: Vec<ChangeHash>,
    /// Listeners for update events
    subscribers: Vec<mpsc::UnboundedSender<UpdateEvent>>,
}

impl NoteDocument {
    /// Create a new empty note
    pub fn new() -> Self {
        Self::from_doc(AutoCommit::new())
    }

    /// Create a note with a specific actor ID
    pub fn with_actor(actor_id: &[u8]) -> Self {
        Self::from_doc(AutoCommit::new().with_actor(ActorId::from(actor_id)))
    }

    /// Load a note from binary Automerge data
    pub fn load(data: &[u8]) -> ReplicaResult<Self> {
        Ok(Self::from_doc(AutoCommit::load(data)?))
    }

    fn from_doc(mut doc: AutoCommit) -> Self {
        let emitted_heads = doc.get_heads();
        Self {
            doc,
            emitted_heads,
            subscribers: Vec::new(),
        }
    }

    /// Wrap the note for sharing with a provider
    pub fn into_shared(self) -> SharedReplica<Self> {
        Arc::new(Mutex::new(self))
    }

    /// Current markdown text
    pub fn text(&self) -> ReplicaResult<String> {
        match self.content_id()? {
            Some(text_id) => Ok(self.doc.text(&text_id)?),
            None => Ok(String::new()),
        }
    }

    /// Splice the markdown text as a local edit
    pub fn splice(&mut self, position: usize, delete_count: usize, insert: &str) -> ReplicaResult<()> {
        let text_id = self.ensure_content()?;
        self.doc
            .splice_text(&text_id, position, delete_count as isize, insert)?;
        self.emit(Origin::Local);
        Ok(())
    }

    /// Replace the whole markdown text as a local edit
    pub fn set_text(&mut self, content: &str) -> ReplicaResult<()> {
        let text_id = self.ensure_content()?;
        let current_len = self.doc.text(&text_id)?.chars().count();
        self.doc
            .splice_text(&text_id, 0, current_len as isize, content)?;
        self.emit(Origin::Local);
        Ok(())
    }

    /// Current document heads
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        let mut heads = self.doc.get_heads();
        heads.sort();
        heads
    }

    /// Save the document to binary format
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    fn content_id(&self) -> ReplicaResult<Option<ObjId>> {
        match self.doc.get(ROOT, CONTENT)? {
            Some((Value::Object(ObjType::Text), id)) => Ok(Some(id)),
            Some(_) => Err(ReplicaError::Corruption(
                "note content is not a text object".to_string(),
            )),
            None => Ok(None),
        }
    }

    fn ensure_content(&mut self) -> ReplicaResult<ObjId> {
        match self.content_id()? {
            Some(id) => Ok(id),
            None => Ok(self.doc.put_object(ROOT, CONTENT, ObjType::Text)?),
        }
    }

    /// Concatenated change chunks not covered by `heads`
    fn changes_since(&mut self, heads: &[ChangeHash]) -> Vec<u8> {
        let mut out = Vec::new();
        for change in self.doc.get_changes(heads) {
            out.extend_from_slice(change.raw_bytes());
        }
        out
    }

    /// Publish everything since the last emitted heads to subscribers
    fn emit(&mut self, origin: Origin) {
        let heads = self.emitted_heads.clone();
        let update = self.changes_since(&heads);
        self.emitted_heads = self.doc.get_heads();

        if update.is_empty() {
            return;
        }

        self.subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.subscribers {
            let _ = tx.send(UpdateEvent {
                update: update.clone(),
                origin: origin.clone(),
            });
        }
    }

    fn decode_state_vector(&mut self, state_vector: &[u8]) -> ReplicaResult<Vec<ChangeHash>> {
        if state_vector.len() % HASH_LEN != 0 {
            return Err(ReplicaError::InvalidStateVector(state_vector.len()));
        }

        let mut heads = Vec::with_capacity(state_vector.len() / HASH_LEN);
        for chunk in state_vector.chunks_exact(HASH_LEN) {
            let mut hash = [0u8; HASH_LEN];
            hash.copy_from_slice(chunk);
            let hash = ChangeHash(hash);
            // Hashes we have never seen cannot narrow the diff
            if self.doc.get_change_by_hash(&hash).is_some() {
                heads.push(hash);
            }
        }
        Ok(heads)
    }
}

impl Default for NoteDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaDocument for NoteDocument {
    fn apply_update(&mut self, update: &[u8], origin: Origin) -> ReplicaResult<()> {
        if update.is_empty() {
            return Ok(());
        }
        // load_incremental tolerates trailing garbage, so reject foreign bytes up front
        if !update.starts_with(&CHUNK_MAGIC) {
            return Err(ReplicaError::Corruption(
                "update is not an Automerge chunk".to_string(),
            ));
        }
        self.doc.load_incremental(update)?;
        self.emit(origin);
        Ok(())
    }

    fn encode_state_as_update(&mut self, state_vector: Option<&[u8]>) -> ReplicaResult<Vec<u8>> {
        match state_vector {
            Some(sv) => {
                let heads = self.decode_state_vector(sv)?;
                Ok(self.changes_since(&heads))
            }
            None => Ok(self.changes_since(&[])),
        }
    }

    fn encode_state_vector(&mut self) -> Vec<u8> {
        self.heads()
            .iter()
            .flat_map(|hash| hash.0)
            .collect()
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UpdateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_edit_emits_local_origin() {
        let mut doc = NoteDocument::new();
        let mut rx = doc.subscribe();

        doc.splice(0, 0, "# Title").unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, Origin::Local);
        assert!(!event.update.is_empty());
        assert_eq!(doc.text().unwrap(), "# Title");
    }

    #[test]
    fn test_apply_update_emits_given_origin() {
        let mut source = NoteDocument::new();
        let mut source_rx = source.subscribe();
        source.splice(0, 0, "hello").unwrap();
        let delta = source_rx.try_recv().unwrap().update;

        let mut replica = NoteDocument::new();
        let mut rx = replica.subscribe();
        replica
            .apply_update(&delta, Origin::Sync("client-b".to_string()))
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, Origin::Sync("client-b".to_string()));
        assert_eq!(replica.text().unwrap(), "hello");
        assert_eq!(replica.heads(), source.heads());
    }

    #[test]
    fn test_diff_against_state_vector() {
        let mut a = NoteDocument::new();
        a.splice(0, 0, "first").unwrap();

        let mut b = NoteDocument::new();
        b.apply_update(&a.encode_state_as_update(None).unwrap(), Origin::Local)
            .unwrap();
        let b_vector = b.encode_state_vector();

        a.splice(5, 0, " second").unwrap();
        let diff = a.encode_state_as_update(Some(&b_vector)).unwrap();
        let full = a.encode_state_as_update(None).unwrap();
        assert!(diff.len() < full.len());

        b.apply_update(&diff, Origin::Local).unwrap();
        assert_eq!(b.text().unwrap(), "first second");
    }

    #[test]
    fn test_unknown_state_vector_sends_everything() {
        let mut a = NoteDocument::new();
        a.splice(0, 0, "abc").unwrap();

        let unknown = vec![7u8; HASH_LEN];
        let diff = a.encode_state_as_update(Some(&unknown)).unwrap();
        assert_eq!(diff, a.encode_state_as_update(None).unwrap());
    }

    #[test]
    fn test_invalid_state_vector() {
        let mut a = NoteDocument::new();
        let result = a.encode_state_as_update(Some(&[1, 2, 3]));
        assert!(matches!(result, Err(ReplicaError::InvalidStateVector(3))));
    }

    #[test]
    fn test_malformed_update_is_error() {
        let mut doc = NoteDocument::new();
        let result = doc.apply_update(&[0xde, 0xad, 0xbe, 0xef], Origin::Local);
        assert!(matches!(result, Err(ReplicaError::Corruption(_))));
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut doc1 = NoteDocument::new();
        doc1.set_text("Hello").unwrap();

        let saved = doc1.save();
        let mut doc2 = NoteDocument::load(&saved).unwrap();

        // Both users edit concurrently
        doc1.splice(5, 0, " World").unwrap();
        doc2.splice(0, 0, "Say ").unwrap();

        let from1 = doc1.encode_state_as_update(None).unwrap();
        let from2 = doc2.encode_state_as_update(None).unwrap();
        doc1.apply_update(&from2, Origin::Local).unwrap();
        doc2.apply_update(&from1, Origin::Local).unwrap();

        assert_eq!(doc1.text().unwrap(), "Say Hello World");
        assert_eq!(doc1.text().unwrap(), doc2.text().unwrap());
        assert_eq!(doc1.heads(), doc2.heads());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut doc = NoteDocument::new();
        let rx = doc.subscribe();
        drop(rx);

        doc.splice(0, 0, "x").unwrap();
        assert!(doc.subscribers.is_empty());
    }
}
