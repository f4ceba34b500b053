//! The sync provider: join/sync state machine for one document.
//!
//! `SyncProvider` is single-threaded and does no I/O scheduling of its own.
//! Every input (transport event, replica update, host call, expired timer)
//! enters through a method that runs to completion. Outputs are frames handed
//! to the [`Transport`] and [`ProviderEvent`]s sent to the host.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected -> ConnectedNotJoined -> Joining -> JoinedNotSynced -> JoinedSynced
//!                                          \-> Error (join rejected)
//! ```
//!
//! Local deltas produced before the join is confirmed wait in the pending
//! queue and go out, in order, as soon as it is.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::backoff::BackoffController;
use super::codec::WireFrame;
use super::config::ProviderConfig;
use super::document::{Origin, ReplicaDocument, SharedReplica, UpdateEvent};
use super::liveness::{LivenessAction, LivenessMonitor, LivenessSnapshot};
use super::presence::{PresenceBridge, PresenceState};
use super::protocol::{ClientMessage, ServerMessage, SyncProtocol};
use super::queue::PendingUpdateQueue;
use super::timers::{Clock, TimerKind, TimerSet};
use super::{ClientId, SyncError, SyncResult};
use crate::transport::{DisconnectReason, Transport, TransportEvent};

/// Supplies capability tokens for the join request
pub trait TokenProvider: Send + Sync {
    fn share_token(&self) -> Option<String>;
    fn auth_token(&self) -> Option<String>;
}

/// Fixed tokens
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    pub share_token: Option<String>,
    pub auth_token: Option<String>,
}

impl TokenProvider for StaticTokens {
    fn share_token(&self) -> Option<String> {
        self.share_token.clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token.clone()
    }
}

/// Connection status reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Events for the host application
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(ConnectionStatus),
    SyncStateChanged(bool),
    /// The relay rejected the join
    ConnectionError(String),
    /// A sync message could not be processed; the session continues
    SyncError(String),
}

/// Where the session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ConnectedNotJoined,
    Joining,
    JoinedNotSynced,
    JoinedSynced,
    Error,
}

pub struct SyncProvider<D: ReplicaDocument, T: Transport> {
    config: ProviderConfig,
    client_id: ClientId,
    document: SharedReplica<D>,
    transport: T,
    tokens: Arc<dyn TokenProvider>,
    presence: PresenceBridge,
    queue: PendingUpdateQueue,
    backoff: BackoffController,
    liveness: LivenessMonitor,
    timers: TimerSet,
    clock: Arc<dyn Clock>,
    events: Option<mpsc::UnboundedSender<ProviderEvent>>,

    connected: bool,
    joining: bool,
    joined: bool,
    synced: bool,
    /// `transport.connect()` called, outcome not yet reported
    reconnecting: bool,
    /// The resync timer already fired on this connection
    resync_retried: bool,
    error: Option<String>,
    started: bool,
    destroyed: bool,
}

impl<D: ReplicaDocument, T: Transport> SyncProvider<D, T> {
    /// Create a provider and the receiver of its host events
    pub fn new(
        config: ProviderConfig,
        document: SharedReplica<D>,
        presence: PresenceState,
        transport: T,
        tokens: Arc<dyn TokenProvider>,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let provider = Self {
            backoff: BackoffController::new(config.base_reconnect_delay, config.max_reconnect_delay),
            liveness: LivenessMonitor::new(config.liveness_interval, config.stale_sync_threshold),
            presence: PresenceBridge::new(client_id.clone(), presence),
            config,
            client_id,
            document,
            transport,
            tokens,
            queue: PendingUpdateQueue::new(),
            timers: TimerSet::new(),
            clock,
            events: Some(events_tx),
            connected: false,
            joining: false,
            joined: false,
            synced: false,
            reconnecting: false,
            resync_retried: false,
            error: None,
            started: false,
            destroyed: false,
        };

        (provider, events_rx)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The tag this provider applies remote deltas with
    pub fn origin(&self) -> Origin {
        Origin::Sync(self.client_id.clone())
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn document(&self) -> &SharedReplica<D> {
        &self.document
    }

    pub fn presence(&self) -> &PresenceState {
        self.presence.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn state(&self) -> SessionState {
        if self.error.is_some() {
            SessionState::Error
        } else if !self.connected {
            SessionState::Disconnected
        } else if self.joining {
            SessionState::Joining
        } else if self.joined && self.synced {
            SessionState::JoinedSynced
        } else if self.joined {
            SessionState::JoinedNotSynced
        } else {
            SessionState::ConnectedNotJoined
        }
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn has_pending_updates(&self) -> bool {
        self.queue.has_pending()
    }

    pub fn pending_update_count(&self) -> usize {
        self.queue.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.backoff.attempt_count()
    }

    /// Earliest timer deadline, for the driver to sleep until
    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        self.timers.next_deadline()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn timer_deadline(&self, kind: TimerKind) -> Option<std::time::Instant> {
        self.timers.deadline(kind)
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Arm the liveness monitor and bring the connection up. Runs once.
    pub fn start(&mut self) {
        if self.started || self.destroyed {
            debug!("Provider already started");
            return;
        }
        self.started = true;

        info!(
            "Starting sync provider {} for document {}",
            self.client_id, self.config.document_id
        );

        self.schedule_liveness();
        self.begin_connect();
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_transport_connected(),
            TransportEvent::Disconnected(reason) => self.on_transport_disconnected(reason),
            TransportEvent::Frame(frame) => self.handle_frame(&frame),
        }
    }

    pub fn on_transport_connected(&mut self) {
        if self.destroyed {
            return;
        }

        let now = self.clock.now();
        self.backoff.on_connected(now);
        self.reconnecting = false;
        self.timers.cancel(TimerKind::Reconnect);

        self.connected = true;
        self.error = None;
        info!("Connected to relay for document {}", self.config.document_id);
        self.emit(ProviderEvent::Status(ConnectionStatus::Connected));

        self.send_join();
    }

    pub fn on_transport_disconnected(&mut self, reason: DisconnectReason) {
        if self.destroyed {
            return;
        }

        info!(
            "Disconnected from relay for document {}: {:?}",
            self.config.document_id, reason
        );

        self.reconnecting = false;
        self.reset_session();

        match self.backoff.on_disconnected(reason) {
            Some(delay) => self.schedule_reconnect(delay),
            None => debug!("Not reconnecting after {:?}", reason),
        }
    }

    /// Decode and dispatch one inbound frame. Bad frames are reported, never fatal.
    pub fn handle_frame(&mut self, frame: &WireFrame) {
        if self.destroyed {
            return;
        }

        match Self::decode_frame(frame) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => self.report_sync_error("Dropping inbound frame", e),
        }
    }

    fn decode_frame(frame: &WireFrame) -> SyncResult<ServerMessage> {
        let data = frame.decode()?;
        Ok(SyncProtocol::decode_server(&data)?)
    }

    pub fn handle_message(&mut self, msg: ServerMessage) {
        if self.destroyed {
            return;
        }

        match msg {
            ServerMessage::JoinConfirmed => self.on_join_confirmed(),
            ServerMessage::JoinError { reason } => self.on_join_error(reason),
            ServerMessage::SyncStep1 {
                document_id,
                state_vector,
            } => {
                if self.is_this_document(&document_id) {
                    self.on_state_vector_received(&state_vector);
                }
            }
            ServerMessage::SyncStep2 {
                document_id,
                full_state,
            } => {
                if self.is_this_document(&document_id) {
                    self.on_full_state_received(&full_state);
                }
            }
            ServerMessage::Update { document_id, delta } => {
                if self.is_this_document(&document_id) {
                    self.on_incremental_update_received(&delta);
                }
            }
            ServerMessage::Presence(data) => self.on_presence_received(&data),
            ServerMessage::SyncError { message } => self.on_sync_error(message),
        }
    }

    // =========================================================================
    // Join / sync protocol
    // =========================================================================

    pub fn on_join_confirmed(&mut self) {
        if self.destroyed {
            return;
        }
        if !self.connected {
            debug!("Ignoring join confirmation while disconnected");
            return;
        }
        if self.joined {
            debug!("Duplicate join confirmation for {}", self.config.document_id);
            return;
        }

        self.joining = false;
        self.joined = true;
        self.timers.cancel(TimerKind::JoinTimeout);
        info!("Joined document {}", self.config.document_id);

        self.flush_pending_updates();

        if !self.synced {
            self.send_sync_step1();
        }

        self.broadcast_local_presence();
    }

    pub fn on_join_error(&mut self, reason: String) {
        if self.destroyed {
            return;
        }

        warn!("Join rejected for document {}: {}", self.config.document_id, reason);
        self.joining = false;
        self.timers.cancel(TimerKind::JoinTimeout);
        self.error = Some(reason.clone());
        self.emit(ProviderEvent::ConnectionError(reason));
    }

    /// The relay sent its state vector; answer with what it is missing
    pub fn on_state_vector_received(&mut self, state_vector: &[u8]) {
        if !self.joined {
            debug!("Ignoring sync-step1 before join");
            return;
        }

        let diff = self.document.lock().encode_state_as_update(Some(state_vector));
        match diff {
            Ok(delta) if delta.is_empty() => debug!("Relay already has everything we have"),
            Ok(delta) => {
                self.send(ClientMessage::Update {
                    document_id: self.config.document_id.clone(),
                    delta,
                });
            }
            Err(e) => self.report_sync_error("Cannot answer sync-step1", e.into()),
        }
    }

    pub fn on_full_state_received(&mut self, full_state: &[u8]) {
        if self.apply_remote(full_state, "full state") {
            self.mark_synced();
        }
    }

    pub fn on_incremental_update_received(&mut self, delta: &[u8]) {
        if self.apply_remote(delta, "update") {
            self.mark_synced();
        }
    }

    pub fn on_presence_received(&mut self, data: &[u8]) {
        match self.presence.apply_remote(data) {
            Ok(Some(client_id)) => debug!("Presence updated for {}", client_id),
            Ok(None) => {}
            Err(e) => self.report_sync_error("Bad presence payload", e.into()),
        }
    }

    pub fn on_sync_error(&mut self, message: String) {
        warn!("Relay reported sync error: {}", message);
        self.emit(ProviderEvent::SyncError(message));
    }

    // =========================================================================
    // Local changes
    // =========================================================================

    pub fn handle_update_event(&mut self, event: UpdateEvent) {
        self.on_local_mutation(&event.update, &event.origin);
    }

    /// A replica delta appeared. Our own applies are echoes and are dropped.
    pub fn on_local_mutation(&mut self, update: &[u8], origin: &Origin) {
        if self.destroyed {
            return;
        }
        if matches!(origin, Origin::Sync(id) if *id == self.client_id) {
            return;
        }

        if self.joined && self.queue.has_pending() {
            // Earlier deltas are still waiting and must go first
            self.queue.enqueue(update.to_vec());
            self.flush_pending_updates();
        } else if self.joined {
            let sent = self.send(ClientMessage::Update {
                document_id: self.config.document_id.clone(),
                delta: update.to_vec(),
            });
            if !sent {
                self.queue.enqueue(update.to_vec());
            }
        } else {
            debug!("Queueing local update until joined ({} pending)", self.queue.len() + 1);
            self.queue.enqueue(update.to_vec());
        }
    }

    /// Send every queued delta in order. Returns how many went out.
    ///
    /// Deltas stay queued while the session is not joined.
    pub fn flush_pending_updates(&mut self) -> usize {
        if !self.joined {
            if self.queue.has_pending() {
                debug!("Deferring flush of {} updates until joined", self.queue.len());
            }
            return 0;
        }

        let mut pending = self.queue.drain().into_iter();
        let mut sent = 0;

        while let Some(update) = pending.next() {
            let delivered = self.send(ClientMessage::Update {
                document_id: self.config.document_id.clone(),
                delta: update.payload.clone(),
            });
            if !delivered {
                let mut undelivered = vec![update];
                undelivered.extend(pending);
                self.queue.requeue_front(undelivered);
                break;
            }
            sent += 1;
        }

        if sent > 0 {
            info!("Flushed {} pending updates", sent);
        }
        sent
    }

    /// Set (or clear with `None`) the local participant's presence
    pub fn set_local_presence(&mut self, state: Option<Value>) {
        if self.destroyed {
            return;
        }

        match self.presence.set_local(state, self.joined) {
            Ok(Some(data)) => {
                self.send(ClientMessage::Presence(data));
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to encode local presence: {}", SyncError::from(e)),
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Fire every timer that is due
    pub fn poll_timers(&mut self) {
        if self.destroyed {
            return;
        }

        let now = self.clock.now();
        for kind in self.timers.take_expired(now) {
            match kind {
                TimerKind::JoinTimeout => self.on_join_timeout(),
                TimerKind::Resync => self.on_resync_timer(),
                TimerKind::Liveness => self.on_liveness_timer(),
                TimerKind::Reconnect => self.on_reconnect_timer(),
            }
        }
    }

    fn on_join_timeout(&mut self) {
        if !self.joining {
            return;
        }

        warn!("Join for document {} timed out", self.config.document_id);
        self.joining = false;
        if self.connected && self.error.is_none() {
            self.send_join();
        }
    }

    /// Single early retry; later ones are left to the liveness monitor
    fn on_resync_timer(&mut self) {
        if self.joined && !self.synced {
            debug!("Still not synced, re-sending sync-step1");
            self.resync_retried = true;
            self.send_sync_step1();
        }
    }

    fn on_liveness_timer(&mut self) {
        let now = self.clock.now();
        let snapshot = LivenessSnapshot {
            connected: self.connected,
            transport_active: self.transport.is_active(),
            joined: self.joined,
            synced: self.synced,
            reconnect_pending: self.reconnecting || self.timers.is_scheduled(TimerKind::Reconnect),
            connected_at: self.backoff.last_connected_at(),
        };

        match self.liveness.check(snapshot, now) {
            LivenessAction::ForceReconnect => self.force_reconnect(),
            LivenessAction::Resync => {
                info!("Session stuck unsynced, re-sending sync-step1");
                self.send_sync_step1();
            }
            LivenessAction::None => {}
        }

        self.schedule_liveness();
    }

    fn on_reconnect_timer(&mut self) {
        if self.connected || self.reconnecting {
            return;
        }

        info!(
            "Reconnecting to relay (attempt {})",
            self.backoff.attempt_count()
        );
        self.begin_connect();
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear the session down. Safe to call more than once.
    ///
    /// The replica and presence state are left intact for their owners.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        info!("Destroying sync provider {}", self.client_id);

        self.flush_pending_updates();
        if self.queue.has_pending() {
            warn!(
                "Dropping {} unsent updates ({} bytes) on teardown",
                self.queue.len(),
                self.queue.total_bytes()
            );
            self.queue.clear();
        }

        if self.joined {
            match self.presence.removal_delta() {
                Ok(data) => {
                    self.send(ClientMessage::Presence(data));
                }
                Err(e) => warn!("Failed to encode presence removal: {}", e),
            }
            self.send(ClientMessage::Leave {
                document_id: self.config.document_id.clone(),
            });
        }

        self.timers.cancel_all();
        self.liveness.reset();
        // Graceful: the leave and anything flushed above still go out
        self.transport.close();

        self.connected = false;
        self.joining = false;
        self.joined = false;
        self.synced = false;
        self.reconnecting = false;
        self.error = None;
        self.destroyed = true;

        // Closing the channel detaches every host listener
        self.events = None;
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn begin_connect(&mut self) {
        if self.transport.is_active() {
            self.on_transport_connected();
            return;
        }

        self.reconnecting = true;
        self.emit(ProviderEvent::Status(ConnectionStatus::Connecting));
        self.transport.connect();
    }

    fn force_reconnect(&mut self) {
        warn!(
            "Transport inactive while connected to {}, forcing reconnect",
            self.config.document_id
        );
        self.transport.disconnect();
        self.reset_session();
        self.begin_connect();
    }

    /// Back to `Disconnected`, keeping queued updates
    fn reset_session(&mut self) {
        let was_synced = self.synced;

        self.connected = false;
        self.joining = false;
        self.joined = false;
        self.synced = false;
        self.resync_retried = false;
        self.timers.cancel(TimerKind::JoinTimeout);
        self.timers.cancel(TimerKind::Resync);

        self.emit(ProviderEvent::Status(ConnectionStatus::Disconnected));
        if was_synced {
            self.emit(ProviderEvent::SyncStateChanged(false));
        }
    }

    fn send_join(&mut self) {
        if self.joined || self.joining {
            debug!("Join already confirmed or in flight");
            return;
        }

        let sent = self.send(ClientMessage::Join {
            document_id: self.config.document_id.clone(),
            share_token: self.tokens.share_token(),
            auth_token: self.tokens.auth_token(),
        });

        if sent {
            self.joining = true;
            let deadline = self.clock.now() + self.config.join_timeout;
            self.timers.schedule(TimerKind::JoinTimeout, deadline);
        }
    }

    fn send_sync_step1(&mut self) {
        let state_vector = self.document.lock().encode_state_vector();
        let sent = self.send(ClientMessage::SyncStep1 {
            document_id: self.config.document_id.clone(),
            state_vector,
        });

        if sent {
            let now = self.clock.now();
            self.liveness.note_step1_sent(now);
            if let Some(interval) = self.config.resync_interval.filter(|_| !self.resync_retried) {
                self.timers.schedule(TimerKind::Resync, now + interval);
            }
        }
    }

    fn broadcast_local_presence(&mut self) {
        match self.presence.local_delta() {
            Ok(Some(data)) => {
                self.send(ClientMessage::Presence(data));
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to encode local presence: {}", SyncError::from(e)),
        }
    }

    fn apply_remote(&mut self, data: &[u8], what: &str) -> bool {
        let origin = self.origin();
        let result = self.document.lock().apply_update(data, origin);
        match result {
            Ok(()) => {
                debug!("Applied {} ({} bytes)", what, data.len());
                true
            }
            Err(e) => {
                self.report_sync_error(&format!("Failed to apply {}", what), e.into());
                false
            }
        }
    }

    fn mark_synced(&mut self) {
        if !self.joined || self.synced {
            return;
        }

        self.synced = true;
        self.timers.cancel(TimerKind::Resync);
        info!("Document {} synced", self.config.document_id);
        self.emit(ProviderEvent::SyncStateChanged(true));
    }

    fn schedule_reconnect(&mut self, delay: std::time::Duration) {
        if self.timers.is_scheduled(TimerKind::Reconnect) {
            debug!("Reconnect already scheduled");
            return;
        }

        info!("Reconnecting in {:?}", delay);
        let deadline = self.clock.now() + delay;
        self.timers.schedule(TimerKind::Reconnect, deadline);
    }

    fn schedule_liveness(&mut self) {
        let deadline = self.clock.now() + self.liveness.interval();
        self.timers.schedule(TimerKind::Liveness, deadline);
    }

    fn is_this_document(&self, document_id: &str) -> bool {
        if document_id != self.config.document_id {
            debug!("Ignoring message for document {}", document_id);
            return false;
        }
        true
    }

    fn send(&mut self, msg: ClientMessage) -> bool {
        let kind = msg.message_type();
        match self.try_send(&msg) {
            Ok(()) => {
                debug!("Sent {:?}", kind);
                true
            }
            Err(e) => {
                warn!("Failed to send {:?}: {}", kind, e);
                false
            }
        }
    }

    fn try_send(&mut self, msg: &ClientMessage) -> SyncResult<()> {
        let bytes = SyncProtocol::encode_client(msg)?;
        self.transport
            .send(WireFrame::encode(bytes, self.config.wire_mode))?;
        Ok(())
    }

    fn report_sync_error(&mut self, context: &str, error: SyncError) {
        warn!("{} on {}: {}", context, self.config.document_id, error);
        self.emit(ProviderEvent::SyncError(format!("{}: {}", context, error)));
    }

    fn emit(&self, event: ProviderEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
