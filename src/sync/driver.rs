//! Tokio driver for a [`SyncProvider`].
//!
//! The provider itself never awaits. This module gives it a task of its own
//! and feeds it transport events, replica updates, host commands and expired
//! timers, one at a time. Hosts talk to the task through a [`ProviderHandle`].

use serde_json::Value;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::document::ReplicaDocument;
use super::provider::SyncProvider;
use super::{ClientId, SyncError, SyncResult};
use crate::transport::{Transport, TransportEvent};

/// Requests from a [`ProviderHandle`] to the driver task
#[derive(Debug)]
pub enum ProviderCommand {
    Flush(oneshot::Sender<usize>),
    HasPending(oneshot::Sender<bool>),
    SetPresence(Option<Value>),
    Destroy(oneshot::Sender<()>),
}

/// Cloneable handle to a running provider
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    client_id: ClientId,
    commands: mpsc::UnboundedSender<ProviderCommand>,
}

impl ProviderHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send queued local updates now. Returns how many went out.
    pub async fn flush_pending_updates(&self) -> SyncResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.request(ProviderCommand::Flush(tx))?;
        rx.await.map_err(|_| SyncError::Destroyed)
    }

    pub async fn has_pending_updates(&self) -> SyncResult<bool> {
        let (tx, rx) = oneshot::channel();
        self.request(ProviderCommand::HasPending(tx))?;
        rx.await.map_err(|_| SyncError::Destroyed)
    }

    pub fn set_local_presence(&self, state: Option<Value>) -> SyncResult<()> {
        self.request(ProviderCommand::SetPresence(state))
    }

    /// Tear the provider down and wait for it. Calling it again is a no-op.
    pub async fn destroy(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.request(ProviderCommand::Destroy(tx)).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn request(&self, command: ProviderCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::Destroyed)
    }
}

/// Start `provider` on its own task.
///
/// `transport_events` must be the receiver paired with the provider's
/// transport. The task ends on destroy or once every handle is dropped.
pub fn spawn_provider<D, T>(
    mut provider: SyncProvider<D, T>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> (ProviderHandle, JoinHandle<()>)
where
    D: ReplicaDocument,
    T: Transport,
{
    let mut updates = provider.document().lock().subscribe();
    let (commands, mut command_rx) = mpsc::unbounded_channel();

    let handle = ProviderHandle {
        client_id: provider.client_id().to_string(),
        commands,
    };

    let task = tokio::spawn(async move {
        provider.start();

        loop {
            let deadline = provider.next_deadline();

            tokio::select! {
                Some(event) = transport_events.recv() => {
                    provider.handle_transport_event(event);
                }
                Some(update) = updates.recv() => {
                    provider.handle_update_event(update);
                }
                command = command_rx.recv() => match command {
                    Some(ProviderCommand::Flush(reply)) => {
                        let _ = reply.send(provider.flush_pending_updates());
                    }
                    Some(ProviderCommand::HasPending(reply)) => {
                        let _ = reply.send(provider.has_pending_updates());
                    }
                    Some(ProviderCommand::SetPresence(state)) => {
                        provider.set_local_presence(state);
                    }
                    Some(ProviderCommand::Destroy(reply)) => {
                        provider.destroy();
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("All provider handles dropped");
                        provider.destroy();
                        break;
                    }
                },
                _ = sleep_until(deadline) => {
                    provider.poll_timers();
                }
            }
        }

        info!("Provider task for {} finished", provider.client_id());
    });

    (handle, task)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::codec::{WireFrame, WireMode};
    use crate::sync::config::ProviderConfig;
    use crate::sync::document::NoteDocument;
    use crate::sync::presence::{PresenceDelta, PresenceState};
    use crate::sync::protocol::{ClientMessage, MessageType, ServerMessage, SyncProtocol};
    use crate::sync::provider::{ConnectionStatus, ProviderEvent, StaticTokens};
    use crate::sync::timers::SystemClock;
    use crate::transport::TransportError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Loopback transport: connects instantly, hands sent messages to the test
    struct ChannelTransport {
        active: Arc<AtomicBool>,
        events: mpsc::UnboundedSender<TransportEvent>,
        sent: mpsc::UnboundedSender<ClientMessage>,
    }

    impl Transport for ChannelTransport {
        fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
            if !self.is_active() {
                return Err(TransportError::NotConnected);
            }
            let data = frame.decode().unwrap();
            let msg = SyncProtocol::decode_client(&data).unwrap();
            self.sent.send(msg).map_err(|_| TransportError::Closed)
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn connect(&mut self) {
            self.active.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Connected);
        }

        fn disconnect(&mut self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    struct Running {
        handle: ProviderHandle,
        task: JoinHandle<()>,
        document: crate::sync::document::SharedReplica<NoteDocument>,
        relay: mpsc::UnboundedSender<TransportEvent>,
        sent: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<ProviderEvent>,
    }

    impl Running {
        async fn next_sent(&mut self) -> ClientMessage {
            tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("transport dropped")
        }

        fn deliver(&self, msg: ServerMessage) {
            let bytes = SyncProtocol::encode_server(&msg).unwrap();
            self.relay
                .send(TransportEvent::Frame(WireFrame::encode(bytes, WireMode::Binary)))
                .unwrap();
        }
    }

    fn launch() -> Running {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            active: Arc::new(AtomicBool::new(false)),
            events: events_tx.clone(),
            sent: sent_tx,
        };

        let document = NoteDocument::new().into_shared();
        let (provider, provider_events) = SyncProvider::new(
            ProviderConfig::new("note-1"),
            document.clone(),
            PresenceState::new(),
            transport,
            Arc::new(StaticTokens::default()),
            Arc::new(SystemClock),
        );

        let (handle, task) = spawn_provider(provider, events_rx);
        Running {
            handle,
            task,
            document,
            relay: events_tx,
            sent: sent_rx,
            events: provider_events,
        }
    }

    #[tokio::test]
    async fn test_driver_runs_session() {
        let mut running = launch();

        assert_eq!(running.next_sent().await.message_type(), MessageType::Join);
        running.deliver(ServerMessage::JoinConfirmed);
        assert_eq!(running.next_sent().await.message_type(), MessageType::SyncStep1);

        running.document.lock().splice(0, 0, "typed").unwrap();
        assert_eq!(running.next_sent().await.message_type(), MessageType::Update);

        assert_eq!(running.handle.flush_pending_updates().await.unwrap(), 0);
        assert!(!running.handle.has_pending_updates().await.unwrap());

        running
            .handle
            .set_local_presence(Some(json!({"name": "Ada"})))
            .unwrap();
        assert_eq!(running.next_sent().await.message_type(), MessageType::Presence);

        tokio_test::assert_ok!(running.handle.destroy().await);

        match running.next_sent().await {
            ClientMessage::Presence(data) => {
                assert!(PresenceDelta::decode(&data).unwrap().state.is_none());
            }
            other => panic!("Expected presence removal, got {:?}", other),
        }
        assert_eq!(running.next_sent().await.message_type(), MessageType::Leave);

        tokio::time::timeout(Duration::from_secs(2), running.task)
            .await
            .unwrap()
            .unwrap();

        tokio_test::assert_err!(running.handle.flush_pending_updates().await);
        tokio_test::assert_ok!(running.handle.destroy().await);
        assert!(!running.handle.is_running());

        let mut statuses = Vec::new();
        while let Ok(event) = running.events.try_recv() {
            if let ProviderEvent::Status(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_provider() {
        let mut running = launch();
        assert_eq!(running.next_sent().await.message_type(), MessageType::Join);

        let task = running.task;
        drop(running.handle);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
