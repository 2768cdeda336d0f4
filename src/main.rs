//! Demo for chatwire
//!
//! Runs one chat round-trip against the in-memory backend: subscribe,
//! typing state, publish, participants, history, unsubscribe, disconnect.

use std::sync::Arc;

use chatwire::client::memory::MemoryBackend;
use chatwire::client::{MessageEvent, PresenceEvent};
use chatwire::config::load_config;
use chatwire::session::{MessageHandler, PresenceHandler};
use chatwire::{Session, utils};
use serde_json::json;
use tracing::{error, info};

const CHANNEL: &str = "lobby";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    utils::logging::init(&config.logging.level);

    let backend = MemoryBackend::new();
    let session = Session::from_settings(Arc::new(backend), &config);

    if let Err(e) = run(&session).await {
        error!("Demo failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    let on_presence: Arc<dyn PresenceHandler> = Arc::new(|event: &PresenceEvent| {
        info!(channel = %event.channel, action = ?event.action, uuid = ?event.uuid, "presence");
    });
    let on_message: Arc<dyn MessageHandler> = Arc::new(|event: &MessageEvent| {
        info!(channel = %event.channel, message = %event.message, "message");
    });

    let mut subscription = session.subscribe(CHANNEL, on_presence, on_message);
    subscription.confirmed().await?;

    let me = session.connect().await?.uuid().to_string();
    session.publish_typing_state(CHANNEL, &me, true).await?;
    session
        .publish_message(CHANNEL, json!({ "text": "Hello from chatwire" }))
        .await?;
    session.publish_typing_state(CHANNEL, &me, false).await?;

    for occupant in session.participants(CHANNEL).await? {
        info!(uuid = %occupant.uuid, state = ?occupant.state, "participant");
    }

    let history = session.history(CHANNEL, None).await?;
    info!(count = history.messages.len(), "history page");

    subscription.unsubscribe().await?;
    session.disconnect().await?;
    Ok(())
}
