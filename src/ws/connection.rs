use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use futures::future::BoxFuture;
use futures::{SinkExt as _, StreamExt as _, future};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, interval_at, sleep};
use url::Url;

use super::config::{Config, LinearBackoff, ReconnectConfig};
use super::envelope::{Envelope, Inbound};
use super::transport::{Connector, Transport, TransportEvent};
use crate::Result;
use crate::auth::TokenProvider;
use crate::bus::{ERROR_TOPIC, EventBus, RECONNECT_EXHAUSTED_TOPIC, topic};
use crate::error::Error;
use crate::session::SessionInvalidator;

/// Client state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No live connection. Either never opened, or closed by the transport with no
    /// reconnect pending.
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the backoff before the next reconnect
    ReconnectWaiting {
        /// Reconnect attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Closed by the owner. Only an explicit open leaves this state.
    Stopped,
}

impl ClientState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Open,
    Close,
    Send(String),
    /// A reconnect timer fired. Carries the generation it was scheduled in.
    ReconnectDue(u64),
}

/// Injected collaborators of one client.
pub(crate) struct Collaborators {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) tokens: Arc<dyn TokenProvider>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) invalidator: Arc<dyn SessionInvalidator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextDelay {
    NotAllowed,
    Wait(Duration),
    Exhausted,
}

/// Whether the client may reconnect on its own, and how many times it already has.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectState {
    allowed: bool,
    backoff: LinearBackoff,
}

impl ReconnectState {
    pub(crate) fn new(config: ReconnectConfig) -> Self {
        Self {
            allowed: true,
            backoff: config.into(),
        }
    }

    pub(crate) const fn allowed(&self) -> bool {
        self.allowed
    }

    pub(crate) const fn attempt_count(&self) -> u32 {
        self.backoff.attempts()
    }

    fn allow(&mut self) {
        self.allowed = true;
    }

    fn on_open(&mut self) {
        self.allowed = true;
        self.backoff.reset();
    }

    fn stop(&mut self) {
        self.allowed = false;
        self.backoff.reset();
    }

    fn next_delay(&mut self) -> NextDelay {
        if !self.allowed {
            return NextDelay::NotAllowed;
        }
        match self.backoff.next_backoff() {
            Some(delay) => NextDelay::Wait(delay),
            None => NextDelay::Exhausted,
        }
    }
}

enum Link {
    Idle,
    Connecting(BoxFuture<'static, Result<Transport>>),
    Open {
        transport: Transport,
        heartbeat: Option<Interval>,
    },
}

enum Event {
    Command(Command),
    Connected(Result<Transport>),
    Transport(Option<TransportEvent>),
    Heartbeat,
}

/// Owns the connection and serializes every state transition.
///
/// Runs on its own task until every [`super::Client`] handle has been dropped.
pub(crate) struct Driver {
    endpoint: Url,
    config: Config,
    collaborators: Collaborators,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Weak so that pending reconnect timers do not keep the driver alive
    timers: mpsc::WeakUnboundedSender<Command>,
    state_tx: watch::Sender<ClientState>,
    reconnect: ReconnectState,
    /// Bumped by `close()` and by explicit opens; older reconnect timers are stale
    generation: u64,
    link: Link,
}

impl Driver {
    pub(crate) fn new(
        endpoint: Url,
        config: Config,
        collaborators: Collaborators,
        commands: mpsc::UnboundedReceiver<Command>,
        timers: mpsc::WeakUnboundedSender<Command>,
        state_tx: watch::Sender<ClientState>,
    ) -> Self {
        let reconnect = ReconnectState::new(config.reconnect.clone());
        Self {
            endpoint,
            config,
            collaborators,
            commands,
            timers,
            state_tx,
            reconnect,
            generation: 0,
            link: Link::Idle,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(event) = self.next_event().await {
            match event {
                Event::Command(command) => self.handle_command(command).await,
                Event::Connected(result) => self.handle_connected(result),
                Event::Transport(Some(TransportEvent::Text(text))) => self.dispatch(&text),
                Event::Transport(Some(TransportEvent::Error(e))) => self.publish_error(&e),
                Event::Transport(None) => {
                    self.link = Link::Idle;
                    self.handle_closed();
                }
                Event::Heartbeat => self.send_heartbeat().await,
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("All client handles dropped, shutting down socket driver");
        self.shutdown_link();
    }

    async fn next_event(&mut self) -> Option<Event> {
        match &mut self.link {
            Link::Idle => self.commands.recv().await.map(Event::Command),
            Link::Connecting(connect) => tokio::select! {
                command = self.commands.recv() => command.map(Event::Command),
                result = connect => Some(Event::Connected(result)),
            },
            Link::Open {
                transport,
                heartbeat,
            } => tokio::select! {
                command = self.commands.recv() => command.map(Event::Command),
                event = transport.events.next() => Some(Event::Transport(event)),
                () = tick(heartbeat) => Some(Event::Heartbeat),
            },
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open => {
                if matches!(self.link, Link::Idle) {
                    self.reconnect.allow();
                    self.generation = self.generation.wrapping_add(1);
                }
                self.open();
            }
            Command::Close => self.close(),
            Command::Send(text) => self.send(text).await,
            Command::ReconnectDue(generation) => {
                // Timers are never cancelled. One scheduled before a close() or an explicit
                // open() carries an older generation.
                if generation != self.generation || !self.reconnect.allowed() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        generation,
                        current = self.generation,
                        "Stale reconnect timer, ignoring"
                    );
                    return;
                }
                self.open();
            }
        }
    }

    fn open(&mut self) {
        if !matches!(self.link, Link::Idle) {
            #[cfg(feature = "tracing")]
            tracing::trace!("Open requested while a connection is live, ignoring");
            return;
        }

        let token = self.collaborators.tokens.current_token();
        let connector = Arc::clone(&self.collaborators.connector);
        let endpoint = self.endpoint.clone();

        #[cfg(feature = "tracing")]
        tracing::debug!(%endpoint, "Connecting");

        self.link = Link::Connecting(Box::pin(async move {
            connector.connect(&endpoint, &token).await
        }));
        self.set_state(ClientState::Connecting);
    }

    fn close(&mut self) {
        self.reconnect.stop();
        self.generation = self.generation.wrapping_add(1);
        self.shutdown_link();
        self.set_state(ClientState::Stopped);
    }

    /// Drop the live connection, if any. An open transport gets a close frame from a
    /// detached task so the driver never waits on the peer.
    fn shutdown_link(&mut self) {
        match mem::replace(&mut self.link, Link::Idle) {
            Link::Idle => {}
            Link::Connecting(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Abandoning pending connection");
            }
            Link::Open { transport, .. } => {
                let mut sink = transport.sink;
                tokio::spawn(async move {
                    if let Err(e) = sink.close().await {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %e, "Error while closing connection");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                });
            }
        }
    }

    async fn send(&mut self, text: String) {
        let Link::Open { transport, .. } = &mut self.link else {
            #[cfg(feature = "tracing")]
            tracing::trace!(%text, "Not connected, dropping outgoing frame");
            return;
        };

        if let Err(e) = transport.sink.send(text).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to send frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    async fn send_heartbeat(&mut self) {
        match Envelope::new(self.config.default_channel.clone(), Value::Null).to_json() {
            Ok(text) => self.send(text).await,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to encode heartbeat");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn handle_connected(&mut self, result: Result<Transport>) {
        match result {
            Ok(transport) => {
                self.reconnect.on_open();
                let heartbeat = self
                    .config
                    .heartbeat_interval
                    .map(|period| interval_at(tokio::time::Instant::now() + period, period));
                self.link = Link::Open {
                    transport,
                    heartbeat,
                };

                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, "Connected");
                self.set_state(ClientState::Connected {
                    since: Instant::now(),
                });
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Unable to connect");
                self.link = Link::Idle;
                // A failed handshake is an error followed by a close.
                self.publish_error(&e);
                self.handle_closed();
            }
        }
    }

    fn handle_closed(&mut self) {
        self.set_state(ClientState::Disconnected);

        match self.reconnect.next_delay() {
            NextDelay::NotAllowed => {}
            NextDelay::Wait(delay) => {
                let attempt = self.reconnect.attempt_count();
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, ?delay, "Scheduling reconnect");
                self.set_state(ClientState::ReconnectWaiting { attempt, delay });
                self.schedule_reconnect(delay);
            }
            NextDelay::Exhausted => {
                let attempts = self.config.reconnect.max_attempts;
                #[cfg(feature = "tracing")]
                tracing::warn!(attempts, "Giving up reconnecting");
                self.collaborators.bus.publish(
                    &topic(&self.config.topic_prefix, RECONNECT_EXHAUSTED_TOPIC),
                    json!({ "attempts": attempts }),
                );
            }
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let timers = self.timers.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(commands) = timers.upgrade() {
                _ = commands.send(Command::ReconnectDue(generation));
            }
        });
    }

    fn dispatch(&mut self, text: &str) {
        #[cfg(feature = "tracing")]
        tracing::trace!(%text, "Received WebSocket text message");

        match Inbound::classify(text, &self.config) {
            Inbound::Heartbeat => {}
            Inbound::KickOff => {
                #[cfg(feature = "tracing")]
                tracing::info!("Session terminated by server");
                self.close();
                let invalidator = Arc::clone(&self.collaborators.invalidator);
                tokio::spawn(async move { invalidator.invalidate().await });
            }
            Inbound::Publish { topic, data } => self.collaborators.bus.publish(&topic, data),
            Inbound::Dropped(reason) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(%text, %reason, "Dropping frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &reason;
            }
        }
    }

    fn publish_error(&self, error: &Error) {
        self.collaborators.bus.publish(
            &topic(&self.config.topic_prefix, ERROR_TOPIC),
            json!({ "message": error.to_string() }),
        );
    }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_replace(state);
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
