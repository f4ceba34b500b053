//! Presence (awareness) state and its propagation.
//!
//! Presence is ephemeral: cursor positions, user names and colors. It is never
//! persisted in the CRDT and never queued while the session is not joined.
//! Each participant's state is keyed by its client id, so a newer delta from
//! the same sender simply overwrites the older one.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::ClientId;

/// Errors that can occur while handling presence payloads
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Invalid presence payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Presence events for subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Updated { client_id: ClientId },
    Removed { client_id: ClientId },
}

/// Wire form of one participant's presence change.
///
/// A `None` state means the participant went away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceDelta {
    pub client_id: ClientId,
    pub state: Option<Value>,
}

impl PresenceDelta {
    pub fn encode(&self) -> Result<Vec<u8>, PresenceError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PresenceError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Shared map from client id to presence blob.
///
/// Owned by the host application; the provider reads and writes it but never
/// tears it down. Cloning shares the same underlying map.
#[derive(Debug, Clone)]
pub struct PresenceState {
    states: Arc<DashMap<ClientId, Value>>,
    event_tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceState {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            states: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to presence events
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.event_tx.subscribe()
    }

    pub fn get(&self, client_id: &str) -> Option<Value> {
        self.states.get(client_id).map(|entry| entry.value().clone())
    }

    /// Insert or overwrite a participant's state
    pub fn set(&self, client_id: &str, state: Value) {
        self.states.insert(client_id.to_string(), state);
        let _ = self.event_tx.send(PresenceEvent::Updated {
            client_id: client_id.to_string(),
        });
    }

    pub fn remove(&self, client_id: &str) -> Option<Value> {
        let removed = self.states.remove(client_id).map(|(_, v)| v);
        if removed.is_some() {
            let _ = self.event_tx.send(PresenceEvent::Removed {
                client_id: client_id.to_string(),
            });
        }
        removed
    }

    /// Copy of every participant's state
    pub fn snapshot(&self) -> HashMap<ClientId, Value> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves presence between the shared state and the wire
#[derive(Debug, Clone)]
pub struct PresenceBridge {
    client_id: ClientId,
    state: PresenceState,
}

impl PresenceBridge {
    pub fn new(client_id: impl Into<ClientId>, state: PresenceState) -> Self {
        Self {
            client_id: client_id.into(),
            state,
        }
    }

    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Record the local participant's presence.
    ///
    /// Returns the encoded delta when it should go out, which is only while
    /// joined. Otherwise the change stays local and nothing is queued.
    pub fn set_local(&self, state: Option<Value>, joined: bool) -> Result<Option<Vec<u8>>, PresenceError> {
        match &state {
            Some(value) => self.state.set(&self.client_id, value.clone()),
            None => {
                self.state.remove(&self.client_id);
            }
        }

        if !joined {
            debug!("Dropping presence change for {} while not joined", self.client_id);
            return Ok(None);
        }

        let delta = PresenceDelta {
            client_id: self.client_id.clone(),
            state,
        };
        Ok(Some(delta.encode()?))
    }

    /// Encoded delta carrying the current local presence, if any
    pub fn local_delta(&self) -> Result<Option<Vec<u8>>, PresenceError> {
        match self.state.get(&self.client_id) {
            Some(state) => Ok(Some(
                PresenceDelta {
                    client_id: self.client_id.clone(),
                    state: Some(state),
                }
                .encode()?,
            )),
            None => Ok(None),
        }
    }

    /// Encoded delta announcing that the local participant left
    pub fn removal_delta(&self) -> Result<Vec<u8>, PresenceError> {
        PresenceDelta {
            client_id: self.client_id.clone(),
            state: None,
        }
        .encode()
    }

    /// Apply an inbound delta. Returns the sender whose entry changed.
    pub fn apply_remote(&self, data: &[u8]) -> Result<Option<ClientId>, PresenceError> {
        let delta = PresenceDelta::decode(data)?;

        if delta.client_id == self.client_id {
            debug!("Ignoring relayed copy of our own presence");
            return Ok(None);
        }

        match delta.state {
            Some(state) => self.state.set(&delta.client_id, state),
            None => {
                self.state.remove(&delta.client_id);
            }
        }

        Ok(Some(delta.client_id))
    }
}

/// Helper to generate a random color for the local user
pub fn generate_user_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
        "#84cc16", // lime
        "#6366f1", // indigo
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_presence_dropped_while_not_joined() {
        let state = PresenceState::new();
        let bridge = PresenceBridge::new("me", state.clone());

        let out = bridge.set_local(Some(json!({"cursor": 3})), false).unwrap();
        assert!(out.is_none());
        // Still visible locally
        assert_eq!(state.get("me"), Some(json!({"cursor": 3})));
    }

    #[test]
    fn test_local_presence_sent_while_joined() {
        let bridge = PresenceBridge::new("me", PresenceState::new());

        let out = bridge.set_local(Some(json!({"name": "Ada"})), true).unwrap().unwrap();
        let delta = PresenceDelta::decode(&out).unwrap();
        assert_eq!(delta.client_id, "me");
        assert_eq!(delta.state, Some(json!({"name": "Ada"})));
    }

    #[test]
    fn test_remote_presence_overwrites_per_sender() {
        let state = PresenceState::new();
        let bridge = PresenceBridge::new("me", state.clone());

        for line in 1..=3 {
            let delta = PresenceDelta {
                client_id: "peer-1".to_string(),
                state: Some(json!({ "line": line })),
            };
            bridge.apply_remote(&delta.encode().unwrap()).unwrap();
        }

        assert_eq!(state.len(), 1);
        assert_eq!(state.get("peer-1"), Some(json!({"line": 3})));
    }

    #[test]
    fn test_remote_removal() {
        let state = PresenceState::new();
        let mut events = state.subscribe();
        let bridge = PresenceBridge::new("me", state.clone());

        state.set("peer-1", json!({}));
        let delta = PresenceDelta {
            client_id: "peer-1".to_string(),
            state: None,
        };
        let changed = bridge.apply_remote(&delta.encode().unwrap()).unwrap();

        assert_eq!(changed, Some("peer-1".to_string()));
        assert!(state.is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            PresenceEvent::Updated { client_id: "peer-1".to_string() }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PresenceEvent::Removed { client_id: "peer-1".to_string() }
        );
    }

    #[test]
    fn test_own_presence_not_overwritten_from_wire() {
        let state = PresenceState::new();
        let bridge = PresenceBridge::new("me", state.clone());
        state.set("me", json!({"line": 1}));

        let echo = PresenceDelta {
            client_id: "me".to_string(),
            state: Some(json!({"line": 99})),
        };
        assert_eq!(bridge.apply_remote(&echo.encode().unwrap()).unwrap(), None);
        assert_eq!(state.get("me"), Some(json!({"line": 1})));
    }

    #[test]
    fn test_garbage_presence_is_error() {
        let bridge = PresenceBridge::new("me", PresenceState::new());
        assert!(bridge.apply_remote(b"\x00\x01not json").is_err());
    }

    #[test]
    fn test_generate_color() {
        let color = generate_user_color();
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }
}
