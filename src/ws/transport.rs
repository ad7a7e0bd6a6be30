//! Connection establishment and the per-connection frame pipes.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt as _, Stream, StreamExt as _, future};
use secrecy::{ExposeSecret as _, SecretString};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use url::Url;

use crate::Result;
use crate::error::Error;

type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;
type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Something that happened on an open connection.
///
/// The end of the event stream is the close event.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound text frame
    Text(String),
    /// A transport-level error. A close may or may not follow.
    Error(Error),
}

/// One live connection: outgoing text frames in, [`TransportEvent`]s out.
///
/// A `Transport` is never reused. Every (re)connect attempt produces a fresh one.
pub struct Transport {
    pub(crate) sink: FrameSink,
    pub(crate) events: EventStream,
}

impl Transport {
    pub fn new<Si, St>(sink: Si, events: St) -> Self
    where
        Si: Sink<String, Error = Error> + Send + 'static,
        St: Stream<Item = TransportEvent> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            events: Box::pin(events),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports. The token is a connection-level credential, never part of a frame.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url, token: &SecretString) -> Result<Transport>;
}

/// [`Connector`] over `tokio-tungstenite`, presenting the token as the WebSocket
/// subprotocol.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, endpoint: &Url, token: &SecretString) -> Result<Transport> {
        let mut request = endpoint.as_str().into_client_request()?;

        let token = token.expose_secret();
        if token.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Connecting without a token, no subprotocol offered");
        } else {
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(token)?);
        }

        let (ws_stream, _) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let sink = write.with(|text: String| {
            future::ready(Ok::<_, Error>(Message::Text(text.into())))
        });

        let events = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(TransportEvent::Text(text.to_string())),
                Err(e) => Some(TransportEvent::Error(e.into())),
                // Binary frames and control frames carry no envelopes.
                Ok(_) => None,
            })
        });

        Ok(Transport::new(sink, events))
    }
}
