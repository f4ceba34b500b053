//! Provider configuration.

use std::time::Duration;

use super::codec::WireMode;
use super::{DocumentId, SyncError, SyncResult};

/// Configuration for a SyncProvider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Relay endpoint, e.g. `ws://localhost:5000/ws`
    pub server_url: String,
    /// Document to join
    pub document_id: DocumentId,
    /// How binary payloads cross the transport
    pub wire_mode: WireMode,
    /// First reconnect delay
    pub base_reconnect_delay: Duration,
    /// Upper bound for reconnect delays
    pub max_reconnect_delay: Duration,
    /// How long a join may stay unconfirmed
    pub join_timeout: Duration,
    /// Delay before the one early sync-step1 retry per connection (`None` disables it)
    pub resync_interval: Option<Duration>,
    /// Liveness check period
    pub liveness_interval: Duration,
    /// How long joined-but-unsynced may last before a resync
    pub stale_sync_threshold: Duration,
}

impl ProviderConfig {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            server_url: "ws://localhost:5000/ws".to_string(),
            document_id: document_id.into(),
            wire_mode: WireMode::Binary,
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            resync_interval: Some(Duration::from_secs(10)),
            liveness_interval: Duration::from_secs(30),
            stale_sync_threshold: Duration::from_secs(30),
        }
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_wire_mode(mut self, mode: WireMode) -> Self {
        self.wire_mode = mode;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_reconnect_delay = base;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_resync_interval(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_liveness(mut self, interval: Duration, stale_sync_threshold: Duration) -> Self {
        self.liveness_interval = interval;
        self.stale_sync_threshold = stale_sync_threshold;
        self
    }

    /// The URL the transport dials for this document
    pub fn document_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.document_id)
    }

    /// Build a configuration from `COLLAB_*` environment variables.
    ///
    /// `COLLAB_DOCUMENT_ID` is required; everything else falls back to the
    /// defaults of [`ProviderConfig::new`].
    pub fn from_env() -> SyncResult<Self> {
        let document_id = std::env::var("COLLAB_DOCUMENT_ID")
            .map_err(|_| SyncError::Config("COLLAB_DOCUMENT_ID is not set".to_string()))?;

        let mut config = Self::new(document_id);

        if let Ok(url) = std::env::var("COLLAB_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(mode) = std::env::var("COLLAB_WIRE_MODE") {
            config.wire_mode = mode.parse().map_err(SyncError::Config)?;
        }
        if let Some(ms) = env_u64("COLLAB_RECONNECT_BASE_MS")? {
            config.base_reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("COLLAB_RECONNECT_MAX_MS")? {
            config.max_reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("COLLAB_JOIN_TIMEOUT_SECS")? {
            config.join_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("COLLAB_RESYNC_INTERVAL_SECS")? {
            config.resync_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = env_u64("COLLAB_LIVENESS_INTERVAL_SECS")? {
            config.liveness_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("COLLAB_STALE_SYNC_SECS")? {
            config.stale_sync_threshold = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.document_id.trim().is_empty() {
            return Err(SyncError::Config("document id is empty".to_string()));
        }
        if self.base_reconnect_delay.is_zero() {
            return Err(SyncError::Config("reconnect base delay must be positive".to_string()));
        }
        if self.liveness_interval.is_zero() {
            return Err(SyncError::Config("liveness interval must be positive".to_string()));
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> SyncResult<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{} must be an integer, got {:?}", key, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_default() {
        let config = ProviderConfig::new("note-1");
        assert_eq!(config.document_id, "note-1");
        assert_eq!(config.wire_mode, WireMode::Binary);
        assert!(config.max_reconnect_delay >= config.base_reconnect_delay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_document_url() {
        let config = ProviderConfig::new("note-1").with_server_url("ws://relay:9000/ws/");
        assert_eq!(config.document_url(), "ws://relay:9000/ws/note-1");
    }

    #[test]
    fn test_validate_rejects_empty_document() {
        let config = ProviderConfig::new("  ");
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("COLLAB_DOCUMENT_ID", "env-note");
        std::env::set_var("COLLAB_WIRE_MODE", "text");
        std::env::set_var("COLLAB_RECONNECT_BASE_MS", "250");
        std::env::set_var("COLLAB_RESYNC_INTERVAL_SECS", "0");

        let config = ProviderConfig::from_env().unwrap();
        assert_eq!(config.document_id, "env-note");
        assert_eq!(config.wire_mode, WireMode::Text);
        assert_eq!(config.base_reconnect_delay, Duration::from_millis(250));
        assert!(config.resync_interval.is_none());

        for key in [
            "COLLAB_DOCUMENT_ID",
            "COLLAB_WIRE_MODE",
            "COLLAB_RECONNECT_BASE_MS",
            "COLLAB_RESYNC_INTERVAL_SECS",
        ] {
            std::env::remove_var(key);
        }
    }
}
