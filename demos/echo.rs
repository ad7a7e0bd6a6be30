//! Connects to a channel socket, prints everything published on a few topics and sends a
//! greeting on the `chat` channel once connected.
//!
//! Run with tracing enabled:
//! ```sh
//! CHANNEL_SOCKET_URL=wss://example.com/socket SOCKET_TOKEN=... RUST_LOG=debug \
//!     cargo run --example echo
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use channel_socket::SOCKET_URL_VAR;
use channel_socket::auth::StaticToken;
use channel_socket::bus::Bus;
use channel_socket::session::SessionInvalidator;
use channel_socket::ws::Client;
use channel_socket::ws::config::Config;
use futures::StreamExt as _;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct LogOut;

#[async_trait]
impl SessionInvalidator for LogOut {
    async fn invalidate(&self) {
        warn!("Session was terminated by the server, log in again");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint = env::var(SOCKET_URL_VAR)?;
    let token = env::var("SOCKET_TOKEN").unwrap_or_default();

    let bus = Arc::new(Bus::new());
    let chat = bus.stream("socket.chat");
    let errors = bus.stream("socket.error");
    let exhausted = bus.stream("socket.reconnect_exhausted");

    let client = Client::builder()
        .endpoint(endpoint)
        .tokens(Arc::new(StaticToken::new(token)))
        .bus(bus.clone())
        .invalidator(Arc::new(LogOut))
        .config(
            Config::builder()
                .heartbeat_interval(Duration::from_secs(30))
                .build(),
        )
        .build()?;

    client.open();

    let mut state_rx = client.state_receiver();
    timeout(
        Duration::from_secs(10),
        state_rx.wait_for(|state| state.is_connected()),
    )
    .await??;
    info!(endpoint = %client.endpoint(), "Connected");

    client.send_to("chat", &json!({ "text": "hello from channel-socket" }));

    let mut events = futures::stream::select_all([
        chat.map(|m| ("chat", m)).boxed(),
        errors.map(|m| ("error", m)).boxed(),
        exhausted.map(|m| ("exhausted", m)).boxed(),
    ]);

    while let Some((topic, message)) = events.next().await {
        match message {
            Ok(payload) => info!(%topic, %payload),
            Err(e) => warn!(%topic, error = %e),
        }
    }

    Ok(())
}
