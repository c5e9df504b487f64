//! Joins one chat conversation, prints what arrives, and says hello.
//!
//! Point it at a server with the usual variables:
//! ```sh
//! CHAT_REALTIME_WS_URL=wss://chat.example.com/cable CHAT_REALTIME_TOKEN=... \
//!     RUST_LOG=info cargo run --example chat --features tracing -- 42
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use chat_realtime::auth::StaticToken;
use chat_realtime::network::AlwaysOnline;
use chat_realtime::types::{ChannelDescriptor, ConversationId, Frame};
use chat_realtime::ws::ConnectionManager;
use chat_realtime::ws::config::{Config, TransportKind};
use serde_json::json;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let chat = ConversationId(env::args().nth(1).unwrap_or_else(|| "1".to_owned()).parse()?);
    let token = env::var("CHAT_REALTIME_TOKEN")?;

    let mut config = Config::from_env()?;
    config.transport = TransportKind::Cable;
    let manager = ConnectionManager::new(config, StaticToken::new(token), AlwaysOnline::default())?;

    let mut updates = manager.status_updates();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            info!(id = %update.id, status = %update.status, retries = update.retry_count);
        }
    });

    manager.on_message(
        chat,
        Arc::new(|frame: &Frame| match frame.json::<serde_json::Value>() {
            Ok(message) => info!(%message, "received"),
            Err(e) => warn!(error = %e, "unreadable frame"),
        }),
    );
    manager.connect(chat, ChannelDescriptor::chat(chat));

    if !manager.wait_for_connection_default(chat).await {
        warn!(id = %chat, status = ?manager.status(chat), "not connected");
        return Ok(());
    }

    manager.send(chat, &json!({ "body": "hello from chat-realtime" }));
    tokio::time::sleep(Duration::from_secs(30)).await;
    manager.close_all();

    Ok(())
}
