//! WebSocket transport over tokio-tungstenite.
//!
//! One background task owns the socket per connection. Frames from the relay
//! and connectivity changes go out through an unbounded channel; frames to the
//! relay come in through another. Every connection gets a generation number so
//! that events from a connection we already dropped are never reported, and
//! its own `active` flag so a stale task can never mark the transport live.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{DisconnectReason, Transport, TransportError, TransportEvent};
use crate::sync::codec::WireFrame;

/// How long the relay may stay silent before the connection counts as dead
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive ping period
const PING_INTERVAL: Duration = Duration::from_secs(25);

/// How long a closing connection may take to write out queued frames
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct WsTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    /// Liveness of the current connection only
    active: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl WsTransport {
    /// Create a transport for `url` and the receiver of its events
    pub fn new(url: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            url: url.into(),
            events,
            outgoing: None,
            active: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            task: None,
        };
        (transport, events_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Forget the current connection: its events and its `active` flag no
    /// longer count. Returns the task still owning the socket, if any.
    fn detach(&mut self) -> Option<JoinHandle<()>> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.active = Arc::new(AtomicBool::new(false));
        self.outgoing = None;
        self.task.take()
    }
}

impl Transport for WsTransport {
    fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::NotConnected);
        }

        let message = match frame {
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
            WireFrame::Text(text) => Message::Text(text),
        };

        self.outgoing
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn connect(&mut self) {
        if let Some(stale) = self.detach() {
            if !stale.is_finished() {
                debug!("Replacing connection task still running for {}", self.url);
                stale.abort();
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(out_tx);

        let connection = Connection {
            url: self.url.clone(),
            generation,
            current: self.generation.clone(),
            active: self.active.clone(),
            events: self.events.clone(),
        };
        self.task = Some(tokio::spawn(connection.run(out_rx)));
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.detach() {
            task.abort();
        }
    }

    fn close(&mut self) {
        let Some(mut task) = self.detach() else {
            return;
        };

        // Dropping the sender lets the task write what is queued, then close
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                        warn!("WebSocket close did not finish in {:?}, aborting", CLOSE_GRACE);
                        task.abort();
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// State moved into the per-connection task
struct Connection {
    url: String,
    generation: u64,
    current: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Connection {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn report(&self, event: TransportEvent) {
        if self.is_current() {
            let _ = self.events.send(event);
        }
    }

    async fn run(self, mut out_rx: mpsc::UnboundedReceiver<Message>) {
        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("WebSocket connect to {} failed: {}", self.url, e);
                self.report(TransportEvent::Disconnected(DisconnectReason::TransportError));
                return;
            }
        };

        info!("WebSocket connected: {}", self.url);
        // A detached connection owns an orphaned flag, so this never leaks
        self.active.store(true, Ordering::SeqCst);
        self.report(TransportEvent::Connected);

        let (mut sink, mut source) = stream.split();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        let mut last_seen = tokio::time::Instant::now();

        let reason = loop {
            tokio::select! {
                outgoing = out_rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!("WebSocket send failed: {}", e);
                            break DisconnectReason::TransportError;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break DisconnectReason::ClientDisconnect;
                    }
                },
                incoming = source.next() => {
                    last_seen = tokio::time::Instant::now();
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            self.report(TransportEvent::Frame(WireFrame::Binary(data.into())));
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.report(TransportEvent::Frame(WireFrame::Text(text)));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!("WebSocket closed by relay: {:?}", frame);
                            break DisconnectReason::ServerDisconnect;
                        }
                        // Pings are answered by tungstenite on the next write
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break DisconnectReason::TransportError;
                        }
                        None => break DisconnectReason::TransportClose,
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break DisconnectReason::TransportError;
                    }
                },
                _ = tokio::time::sleep_until(last_seen + IDLE_TIMEOUT) => {
                    break DisconnectReason::PingTimeout;
                },
            }
        };

        info!("WebSocket disconnected from {}: {:?}", self.url, reason);
        self.active.store(false, Ordering::SeqCst);
        self.report(TransportEvent::Disconnected(reason));
    }
}
