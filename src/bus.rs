//! Topic-based fan-out of decoded socket payloads.
//!
//! The client only ever *publishes*; it never reads the registry. Any type implementing
//! [`EventBus`] can be injected. [`Bus`] is the in-process implementation shipped with the
//! crate, backed by one [`tokio::sync::broadcast`] channel per topic.
#![expect(
    clippy::module_name_repetitions,
    reason = "EventBus is the conventional name for the publish side of a bus"
)]

use async_stream::stream;
use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::error::Error;
use crate::ws::WsError;

/// Broadcast channel capacity for each topic.
const TOPIC_CAPACITY: usize = 256;

/// Topic used for transport errors, relative to the topic prefix.
pub const ERROR_TOPIC: &str = "error";
/// Topic used when reconnection gives up, relative to the topic prefix.
pub const RECONNECT_EXHAUSTED_TOPIC: &str = "reconnect_exhausted";

/// Build the namespaced topic for `channel`, e.g. `socket.chat`.
#[must_use]
pub fn topic(prefix: &str, channel: &str) -> String {
    format!("{prefix}.{channel}")
}

/// Publish side of a subscriber bus.
pub trait EventBus: Send + Sync + 'static {
    /// Deliver `payload` to every current subscriber of `topic`.
    fn publish(&self, topic: &str, payload: Value);
}

/// In-process topic bus.
///
/// ```
/// use channel_socket::bus::{Bus, EventBus as _};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let bus = Bus::default();
/// let mut first = bus.subscribe("socket.chat");
/// let mut second = bus.subscribe("socket.chat");
///
/// bus.publish("socket.chat", json!({ "foo": 1 }));
///
/// assert_eq!(first.recv().await.unwrap(), json!({ "foo": 1 }));
/// assert_eq!(second.recv().await.unwrap(), json!({ "foo": 1 }));
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Bus {
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic`.
    ///
    /// Each call returns a new independent receiver that sees every payload published
    /// after the call.
    #[must_use]
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to `topic` as a stream.
    ///
    /// A subscriber that falls behind receives one [`WsError::Lagged`] item and then
    /// resumes with the oldest payload still buffered.
    pub fn stream(&self, topic: &str) -> impl Stream<Item = Result<Value>> + use<> {
        let mut rx = self.subscribe(topic);

        stream! {
            loop {
                match rx.recv().await {
                    Ok(payload) => yield Ok(payload),
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Topic subscription lagged, missed {n} messages");
                        yield Err(Error::from(WsError::Lagged { count: n }));
                    }
                    Err(RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    /// Number of topics that have been subscribed to at least once.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl EventBus for Bus {
    fn publish(&self, topic: &str, payload: Value) {
        let Some(sender) = self.topics.get(topic) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(%topic, "No subscribers, dropping payload");
            return;
        };

        // Err only means every receiver has been dropped.
        if sender.send(payload).is_err() {
            #[cfg(feature = "tracing")]
            tracing::trace!(%topic, "All subscribers gone, dropping payload");
        }
    }
}
