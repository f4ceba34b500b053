//! collab-sync - join a collaborative note from the terminal
//!
//! Connects to a relay, keeps a local replica of the note in sync and logs
//! connection and sync status. Every line typed on stdin is appended to the
//! note. Ctrl-C leaves the document cleanly.

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use collab_sync::sync::presence::generate_user_color;
use collab_sync::sync::timers::SystemClock;
use collab_sync::transport::WsTransport;
use collab_sync::{
    spawn_provider, NoteDocument, PresenceState, ProviderConfig, ProviderEvent, StaticTokens,
    SyncProvider,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_sync=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ProviderConfig::from_env().context("Failed to load configuration")?;
    let tokens = StaticTokens {
        share_token: std::env::var("COLLAB_SHARE_TOKEN").ok(),
        auth_token: std::env::var("COLLAB_AUTH_TOKEN").ok(),
    };
    let user_name = std::env::var("COLLAB_USER_NAME").unwrap_or_else(|_| "anonymous".to_string());

    info!("Joining {} as {}", config.document_url(), user_name);

    let document = NoteDocument::new().into_shared();
    let presence = PresenceState::new();
    let (transport, transport_events) = WsTransport::new(config.document_url());

    let (provider, mut events) = SyncProvider::new(
        config,
        document.clone(),
        presence.clone(),
        transport,
        Arc::new(tokens),
        Arc::new(SystemClock),
    );
    let (handle, task) = spawn_provider(provider, transport_events);

    handle.set_local_presence(Some(json!({
        "name": user_name,
        "color": generate_user_color(),
    })))?;

    // Log provider events
    let log_document = document.clone();
    let log_presence = presence.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProviderEvent::Status(status) => info!("Status: {:?}", status),
                ProviderEvent::SyncStateChanged(true) => {
                    let text = log_document.lock().text().unwrap_or_default();
                    let names: Vec<String> = log_presence
                        .snapshot()
                        .values()
                        .filter_map(|state| state.get("name")?.as_str().map(str::to_string))
                        .collect();
                    info!(
                        "Synced: {} chars, participants: {}",
                        text.chars().count(),
                        names.join(", ")
                    );
                }
                ProviderEvent::SyncStateChanged(false) => info!("Sync lost"),
                ProviderEvent::ConnectionError(reason) => error!("Connection error: {}", reason),
                ProviderEvent::SyncError(message) => warn!("Sync error: {}", message),
            }
        }
    });

    // Append stdin lines to the note
    let stdin_document = document.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut doc = stdin_document.lock();
            let end = match doc.text() {
                Ok(text) => text.chars().count(),
                Err(e) => {
                    warn!("Cannot read note: {}", e);
                    continue;
                }
            };
            if let Err(e) = doc.splice(end, 0, &format!("{}\n", line)) {
                warn!("Failed to append line: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down");
    handle.destroy().await?;
    task.await.context("Provider task panicked")?;

    let text = document.lock().text().unwrap_or_default();
    info!("Left document with {} chars", text.chars().count());

    Ok(())
}
