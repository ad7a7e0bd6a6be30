//! Wire envelope and inbound frame classification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::config::Config;
use super::error::WsError;
use crate::Result;
use crate::bus::topic;

/// The `{ "channel": ..., "data": ... }` unit exchanged over the socket.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Wrap `data` for `channel`.
    ///
    /// Strings, numbers and booleans are boxed as `{ "data": value }` so that the
    /// payload on the wire is always structured. Objects, arrays and `null` are kept as is.
    #[must_use]
    pub fn new<S: Into<String>>(channel: S, data: Value) -> Self {
        let data = match data {
            scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_)) => {
                let mut boxed = Map::with_capacity(1);
                boxed.insert("data".to_owned(), scalar);
                Value::Object(boxed)
            }
            other => other,
        };

        Self {
            channel: channel.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What the client should do with one inbound text frame.
#[non_exhaustive]
#[derive(Debug)]
pub enum Inbound {
    /// Frame on the default channel
    Heartbeat,
    /// The server is forcing the session out
    KickOff,
    /// Fan `data` out to every subscriber of `topic`
    Publish { topic: String, data: Value },
    /// The frame is not an envelope and is discarded
    Dropped(WsError),
}

impl Inbound {
    /// Classify a raw text frame according to the reserved channels in `config`.
    #[must_use]
    pub fn classify(text: &str, config: &Config) -> Self {
        let envelope = match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => return Self::Dropped(WsError::MessageParse(e)),
        };

        if envelope.channel == config.default_channel {
            Self::Heartbeat
        } else if envelope.channel == config.kick_off_channel {
            Self::KickOff
        } else {
            Self::Publish {
                topic: topic(&config.topic_prefix, &envelope.channel),
                data: envelope.data,
            }
        }
    }
}
