use std::sync::Arc;

use bon::bon;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use url::Url;

use super::config::Config;
use super::connection::{ClientState, Collaborators, Command, Driver};
use super::envelope::Envelope;
use super::transport::{Connector, TungsteniteConnector};
use crate::Result;
use crate::auth::TokenProvider;
use crate::bus::EventBus;
use crate::error::Error;
use crate::session::SessionInvalidator;

/// Reconnecting channel socket client.
///
/// Owns one WebSocket connection, routes every inbound envelope to the [`EventBus`] under
/// `<topic_prefix>.<channel>`, hands forced logouts to the [`SessionInvalidator`] and
/// reconnects with bounded linear backoff. All operations are non-blocking: they enqueue
/// work for a background task and return immediately.
///
/// # Examples
///
/// ```rust, no_run
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use channel_socket::auth::StaticToken;
/// use channel_socket::bus::Bus;
/// use channel_socket::session::SessionInvalidator;
/// use channel_socket::ws::Client;
///
/// struct Logout;
///
/// #[async_trait]
/// impl SessionInvalidator for Logout {
///     async fn invalidate(&self) {}
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let bus = Arc::new(Bus::new());
///     let mut chat = bus.subscribe("socket.chat");
///
///     let client = Client::builder()
///         .endpoint("wss://example.com/socket")
///         .tokens(Arc::new(StaticToken::new("token")))
///         .bus(bus)
///         .invalidator(Arc::new(Logout))
///         .build()?;
///
///     client.open();
///     client.send_to("chat", &serde_json::json!({ "text": "hello" }));
///
///     while let Ok(message) = chat.recv().await {
///         println!("chat: {message}");
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Validated endpoint of the remote socket
    endpoint: Url,
    /// Configuration shared with the driver
    config: Config,
    /// Commands for the driver task
    commands: mpsc::UnboundedSender<Command>,
    /// Latest state published by the driver
    state_rx: watch::Receiver<ClientState>,
}

#[bon]
impl Client {
    /// Create a client and start its driver task. No connection is made until
    /// [`Client::open`].
    ///
    /// Must be called from within a tokio runtime.
    #[builder]
    pub fn new(
        #[builder(into)] endpoint: String,
        tokens: Arc<dyn TokenProvider>,
        bus: Arc<dyn EventBus>,
        invalidator: Arc<dyn SessionInvalidator>,
        #[builder(default)] config: Config,
        #[builder(default = Arc::new(TungsteniteConnector) as Arc<dyn Connector>)]
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let endpoint = Url::parse(&endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint scheme must be ws or wss, got {}",
                endpoint.scheme()
            )));
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);

        let driver = Driver::new(
            endpoint.clone(),
            config.clone(),
            Collaborators {
                connector,
                tokens,
                bus,
                invalidator,
            },
            commands_rx,
            commands.downgrade(),
            state_tx,
        );
        tokio::spawn(driver.run());

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                config,
                commands,
                state_rx,
            }),
        })
    }
}

impl Client {
    /// Open the connection. A no-op while already connecting or connected.
    ///
    /// Re-enables automatic reconnection after [`Client::close`].
    pub fn open(&self) {
        self.command(Command::Open);
    }

    /// Close the connection and disable automatic reconnection until the next
    /// [`Client::open`].
    pub fn close(&self) {
        self.command(Command::Close);
    }

    /// Send `payload` on the default channel. See [`Client::send_to`].
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) {
        self.send_to(&self.inner.config.default_channel, payload);
    }

    /// Send `payload` on `channel`.
    ///
    /// Fire-and-forget: when the client is not connected the payload is dropped, and
    /// nothing is queued for a later connection. Scalar payloads are boxed as
    /// `{ "data": payload }`.
    pub fn send_to<T: Serialize + ?Sized>(&self, channel: &str, payload: &T) {
        if !self.state().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::trace!(%channel, "Not connected, dropping outgoing payload");
            return;
        }

        match encode(channel, payload) {
            Ok(text) => self.command(Command::Send(text)),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%channel, error = %e, "Failed to encode outgoing payload");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    /// Get the current client state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state_rx.borrow()
    }

    /// Check if the client currently holds an open connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to client state changes.
    ///
    /// Intermediate states may be coalesced when several transitions happen back to back.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.inner.state_rx.clone()
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn command(&self, command: Command) {
        // Fails only once the driver has stopped, which happens after the last handle
        // is dropped.
        _ = self.inner.commands.send(command);
    }
}

fn encode<T: Serialize + ?Sized>(channel: &str, payload: &T) -> Result<String> {
    let data = serde_json::to_value(payload)?;
    Envelope::new(channel, data).to_json()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::channel::mpsc as pipe;
    use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
    use secrecy::{ExposeSecret as _, SecretString};
    use serde_json::{Value, json};
    use tokio::sync::broadcast;
    use tokio::time::{Instant, sleep};

    use super::*;
    use crate::auth::StaticToken;
    use crate::bus::Bus;
    use crate::ws::WsError;
    use crate::ws::config::ReconnectConfig;
    use crate::ws::transport::{Transport, TransportEvent};

    #[derive(Clone, Copy, Debug)]
    enum Outcome {
        Accept,
        Refuse,
    }

    /// Server side of an in-memory connection.
    struct ServerEnd {
        to_client: pipe::UnboundedSender<TransportEvent>,
        from_client: pipe::UnboundedReceiver<String>,
    }

    impl ServerEnd {
        fn push(&self, text: &str) {
            self.to_client
                .unbounded_send(TransportEvent::Text(text.to_owned()))
                .unwrap();
        }
    }

    /// Scripted connector. Once the script runs out every attempt is refused.
    struct MockConnector {
        script: Mutex<VecDeque<Outcome>>,
        attempts: Mutex<Vec<(Instant, String)>>,
        servers: mpsc::UnboundedSender<ServerEnd>,
    }

    impl MockConnector {
        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .map(|(at, _)| *at)
                .collect()
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _endpoint: &Url, token: &SecretString) -> Result<Transport> {
            self.attempts
                .lock()
                .unwrap()
                .push((Instant::now(), token.expose_secret().to_owned()));

            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Refuse);

            match outcome {
                Outcome::Refuse => Err(WsError::ConnectionClosed.into()),
                Outcome::Accept => {
                    let (client_tx, from_client) = pipe::unbounded::<String>();
                    let (to_client, client_rx) = pipe::unbounded::<TransportEvent>();
                    drop(self.servers.send(ServerEnd {
                        to_client,
                        from_client,
                    }));

                    let sink =
                        client_tx.sink_map_err(|_e| Error::from(WsError::ConnectionClosed));
                    Ok(Transport::new(sink, client_rx))
                }
            }
        }
    }

    /// Records invalidations along with the client state seen at that moment.
    #[derive(Default)]
    struct RecordingInvalidator {
        state_rx: OnceLock<watch::Receiver<ClientState>>,
        seen: Mutex<Vec<ClientState>>,
    }

    #[async_trait]
    impl SessionInvalidator for RecordingInvalidator {
        async fn invalidate(&self) {
            let state = *self.state_rx.get().unwrap().borrow();
            self.seen.lock().unwrap().push(state);
        }
    }

    struct Harness {
        client: Client,
        bus: Arc<Bus>,
        connector: Arc<MockConnector>,
        invalidator: Arc<RecordingInvalidator>,
        servers: mpsc::UnboundedReceiver<ServerEnd>,
    }

    impl Harness {
        fn new(script: &[Outcome]) -> Self {
            Self::with_config(script, Config::default())
        }

        fn with_config(script: &[Outcome], config: Config) -> Self {
            let (servers_tx, servers) = mpsc::unbounded_channel();
            let connector = Arc::new(MockConnector {
                script: Mutex::new(script.iter().copied().collect()),
                attempts: Mutex::new(Vec::new()),
                servers: servers_tx,
            });
            let bus = Arc::new(Bus::new());
            let invalidator = Arc::new(RecordingInvalidator::default());

            let client = Client::builder()
                .endpoint("ws://socket.test/ws")
                .tokens(Arc::new(StaticToken::new("secret-token")))
                .bus(Arc::clone(&bus) as Arc<dyn EventBus>)
                .invalidator(Arc::clone(&invalidator) as Arc<dyn SessionInvalidator>)
                .connector(Arc::clone(&connector) as Arc<dyn Connector>)
                .config(config)
                .build()
                .unwrap();
            assert!(
                invalidator.state_rx.set(client.state_receiver()).is_ok(),
                "state receiver is set once"
            );

            Self {
                client,
                bus,
                connector,
                invalidator,
                servers,
            }
        }

        fn next_server(&mut self) -> ServerEnd {
            self.servers.try_recv().unwrap()
        }
    }

    /// Let every ready task run. The paused clock advances by one millisecond.
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<Value>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn open_connects_with_current_token() {
        let mut harness = Harness::new(&[Outcome::Accept]);

        harness.client.open();
        settle().await;

        assert!(harness.client.is_connected());
        let attempts = harness.connector.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].1, "secret-token");
        let _server = harness.next_server();
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_idempotent_while_live() {
        let harness = Harness::new(&[Outcome::Accept]);

        harness.client.open();
        harness.client.open();
        settle().await;
        harness.client.open();
        settle().await;

        assert!(harness.client.is_connected());
        assert_eq!(harness.connector.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_publish_nothing() {
        let mut harness = Harness::new(&[Outcome::Accept]);
        let mut chat = harness.bus.subscribe("socket.chat");
        let mut errors = harness.bus.subscribe("socket.error");

        harness.client.open();
        settle().await;
        let server = harness.next_server();

        server.push("not json at all");
        server.push(r#"{"data":{"foo":1}}"#);
        server.push(r#"{"channel":"chat","data":{"foo":2}}"#);
        settle().await;

        assert_eq!(drain(&mut chat), vec![json!({ "foo": 2 })]);
        assert!(drain(&mut errors).is_empty());
        assert!(harness.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn default_channel_frames_are_ignored() {
        let mut harness = Harness::new(&[Outcome::Accept]);
        let mut default = harness.bus.subscribe("socket.default");

        harness.client.open();
        settle().await;
        let server = harness.next_server();

        server.push(r#"{"channel":"default","data":{"ping":true}}"#);
        settle().await;

        assert!(drain(&mut default).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_not_connected_is_dropped() {
        let mut harness = Harness::new(&[Outcome::Accept]);

        harness.client.send(&json!({ "early": true }));
        harness.client.send_to("chat", "too early");
        harness.client.open();
        settle().await;

        let mut server = harness.next_server();
        assert!(server.from_client.next().now_or_never().is_none(), "nothing was queued");

        harness.client.close();
        settle().await;
        harness.client.send_to("chat", &json!({ "late": true }));
        settle().await;

        assert_eq!(server.from_client.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sent_frame_echoed_back_publishes_once() {
        let mut harness = Harness::new(&[Outcome::Accept]);
        let mut chat = harness.bus.subscribe("socket.chat");

        harness.client.open();
        settle().await;
        let mut server = harness.next_server();

        harness.client.send_to("chat", &json!({ "foo": 1 }));
        let frame = server.from_client.next().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({ "channel": "chat", "data": { "foo": 1 } }));

        server.push(&frame);
        settle().await;

        assert_eq!(drain(&mut chat), vec![json!({ "foo": 1 })]);
    }

    #[tokio::test(start_paused = true)]
    async fn scalar_payload_on_default_channel_is_boxed() {
        let mut harness = Harness::new(&[Outcome::Accept]);

        harness.client.open();
        settle().await;
        let mut server = harness.next_server();

        harness.client.send("hello");
        let frame = server.from_client.next().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(
            value,
            json!({ "channel": "default", "data": { "data": "hello" } })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reconnect_three_times_with_linear_backoff() {
        let harness = Harness::new(&[]);
        let mut errors = harness.bus.subscribe("socket.error");
        let mut exhausted = harness.bus.subscribe("socket.reconnect_exhausted");

        harness.client.open();
        sleep(Duration::from_secs(120)).await;

        let times = harness.connector.attempt_times();
        assert_eq!(times.len(), 4, "one open plus three reconnects");
        assert_eq!(times[1] - times[0], Duration::from_millis(5000));
        assert_eq!(times[2] - times[1], Duration::from_millis(10000));
        assert_eq!(times[3] - times[2], Duration::from_millis(15000));

        assert_eq!(harness.client.state(), ClientState::Disconnected);
        assert_eq!(drain(&mut errors).len(), 4);
        assert_eq!(drain(&mut exhausted), vec![json!({ "attempts": 3 })]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_disarms_pending_reconnect() {
        let harness = Harness::new(&[]);

        harness.client.open();
        settle().await;
        assert_eq!(
            harness.client.state(),
            ClientState::ReconnectWaiting {
                attempt: 1,
                delay: Duration::from_millis(5000)
            }
        );

        harness.client.close();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(harness.connector.attempt_count(), 1);
        assert_eq!(harness.client.state(), ClientState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_inside_backoff_window_ignores_stale_timer() {
        let harness = Harness::new(&[]);
        let mut exhausted = harness.bus.subscribe("socket.reconnect_exhausted");

        harness.client.open();
        sleep(Duration::from_secs(1)).await;
        harness.client.close();
        sleep(Duration::from_secs(1)).await;
        harness.client.open();
        sleep(Duration::from_secs(120)).await;

        let times = harness.connector.attempt_times();
        assert_eq!(times.len(), 5, "first open, reopen, then three reconnects");
        assert_eq!(times[2] - times[1], Duration::from_millis(5000));
        assert_eq!(times[3] - times[2], Duration::from_millis(10000));
        assert_eq!(times[4] - times[3], Duration::from_millis(15000));
        assert_eq!(drain(&mut exhausted), vec![json!({ "attempts": 3 })]);
        assert_eq!(harness.client.state(), ClientState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn open_while_waiting_replaces_pending_timer() {
        let harness = Harness::new(&[]);
        let mut exhausted = harness.bus.subscribe("socket.reconnect_exhausted");

        harness.client.open();
        sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            harness.client.state(),
            ClientState::ReconnectWaiting { attempt: 1, .. }
        ));

        harness.client.open();
        sleep(Duration::from_secs(120)).await;

        let times = harness.connector.attempt_times();
        assert_eq!(times.len(), 4, "the timer armed before the open never fires");
        assert_eq!(times[1] - times[0], Duration::from_millis(1000));
        assert_eq!(times[2] - times[1], Duration::from_millis(10000));
        assert_eq!(times[3] - times[2], Duration::from_millis(15000));
        assert_eq!(drain(&mut exhausted), vec![json!({ "attempts": 3 })]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_reconnects_after_one_unit() {
        let mut harness = Harness::new(&[Outcome::Accept, Outcome::Accept]);

        harness.client.open();
        settle().await;
        let server = harness.next_server();

        let dropped_at = Instant::now();
        drop(server);
        settle().await;
        assert_eq!(
            harness.client.state(),
            ClientState::ReconnectWaiting {
                attempt: 1,
                delay: Duration::from_millis(5000)
            }
        );

        sleep(Duration::from_secs(6)).await;

        let times = harness.connector.attempt_times();
        assert_eq!(times.len(), 2);
        assert_eq!(times[1] - dropped_at, Duration::from_millis(5000));
        assert!(harness.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_backoff() {
        let mut harness =
            Harness::new(&[Outcome::Refuse, Outcome::Refuse, Outcome::Accept]);

        harness.client.open();
        sleep(Duration::from_secs(20)).await;
        assert!(harness.client.is_connected());
        let server = harness.next_server();

        let dropped_at = Instant::now();
        drop(server);
        sleep(Duration::from_secs(6)).await;

        let times = harness.connector.attempt_times();
        assert_eq!(times.len(), 4);
        assert_eq!(times[3] - dropped_at, Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn kick_off_closes_then_invalidates_once() {
        let mut harness = Harness::new(&[Outcome::Accept, Outcome::Accept]);

        harness.client.open();
        settle().await;
        let mut server = harness.next_server();

        server.push(r#"{"channel":"kick_off","data":{"reason":"login elsewhere"}}"#);
        settle().await;

        assert_eq!(
            *harness.invalidator.seen.lock().unwrap(),
            vec![ClientState::Stopped]
        );
        assert_eq!(server.from_client.next().await, None, "connection closed");

        sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.connector.attempt_count(), 1, "no reconnect");
        assert_eq!(harness.client.state(), ClientState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_open_after_close_reconnects() {
        let mut harness = Harness::new(&[Outcome::Accept, Outcome::Accept, Outcome::Accept]);

        harness.client.open();
        settle().await;
        let _first = harness.next_server();

        harness.client.close();
        settle().await;
        assert_eq!(harness.client.state(), ClientState::Stopped);

        harness.client.open();
        settle().await;
        assert!(harness.client.is_connected());
        let second = harness.next_server();

        // Reconnection is enabled again.
        drop(second);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(harness.connector.attempt_count(), 3);
        assert!(harness.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_published_without_closing() {
        let mut harness = Harness::new(&[Outcome::Accept]);
        let mut errors = harness.bus.subscribe("socket.error");

        harness.client.open();
        settle().await;
        let server = harness.next_server();

        server
            .to_client
            .unbounded_send(TransportEvent::Error(WsError::ConnectionClosed.into()))
            .unwrap();
        settle().await;

        let published = drain(&mut errors);
        assert_eq!(published.len(), 1);
        assert!(published[0]["message"].as_str().unwrap().contains("closed"));
        assert!(harness.client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_are_sent_while_connected() {
        let config = Config::builder()
            .heartbeat_interval(Duration::from_secs(30))
            .reconnect(ReconnectConfig::builder().max_attempts(0).build())
            .build();
        let mut harness = Harness::with_config(&[Outcome::Accept], config);

        harness.client.open();
        settle().await;
        let mut server = harness.next_server();

        sleep(Duration::from_secs(65)).await;

        for _ in 0..2 {
            let frame = server.from_client.next().await.unwrap();
            let value: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value, json!({ "channel": "default", "data": null }));
        }
        assert!(server.from_client.next().now_or_never().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_gives_up_immediately() {
        let config = Config::builder()
            .reconnect(ReconnectConfig::builder().max_attempts(0).build())
            .build();
        let harness = Harness::with_config(&[], config);
        let mut exhausted = harness.bus.subscribe("socket.reconnect_exhausted");

        harness.client.open();
        sleep(Duration::from_secs(60)).await;

        assert_eq!(harness.connector.attempt_count(), 1);
        assert_eq!(drain(&mut exhausted), vec![json!({ "attempts": 0 })]);
    }

    #[tokio::test]
    async fn non_websocket_endpoint_is_rejected() {
        let result = Client::builder()
            .endpoint("https://example.com")
            .tokens(Arc::new(StaticToken::new("t")) as Arc<dyn TokenProvider>)
            .bus(Arc::new(Bus::new()) as Arc<dyn EventBus>)
            .invalidator(Arc::new(RecordingInvalidator::default()) as Arc<dyn SessionInvalidator>)
            .build();

        let Err(error) = result else {
            panic!("expected validation error");
        };
        assert_eq!(error.kind(), crate::error::Kind::Validation);
    }
}
