//! Reconnecting channel socket.
//!
//! # Architecture
//!
//! - [`Client`]: cheap, cloneable handle. `open`, `close` and `send_to` enqueue commands
//!   and return immediately.
//! - A driver task per client owns the connection and runs every state transition in order:
//!   connecting, routing inbound [`Envelope`]s, heartbeats and linear-backoff reconnects.
//! - [`Connector`]: opens a [`Transport`] for an endpoint and token.
//!   [`TungsteniteConnector`] is the production implementation.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::builder()
//!     .endpoint("wss://example.com/socket")
//!     .tokens(tokens)
//!     .bus(bus)
//!     .invalidator(invalidator)
//!     .build()?;
//!
//! client.open();
//! client.send_to("chat", &json!({ "text": "hi" }));
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod transport;

pub use client::Client;
pub use connection::ClientState;
pub use envelope::{Envelope, Inbound};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use transport::{Connector, Transport, TransportEvent, TungsteniteConnector};
