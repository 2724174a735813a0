//! One remote agent's connection: identity, turn timing, RPC dispatch and
//! teardown, independent of the wire transport underneath.
//!
//! A [`Client`] is a cheap, cloneable handle. Constructing one spawns a
//! connection task that owns the transport and handles inbound documents and
//! owner commands one at a time, in arrival order. The handle exposes:
//! - identity set once during the handshake ([`Client::set_info`],
//!   [`Client::set_player`]),
//! - the compute-budget clock ([`Client::start_ticking`],
//!   [`Client::pause_ticking`]),
//! - outbound sends and disconnects,
//! - socket hand-off ([`Client::stop_listening_to_socket`],
//!   [`Client::pop_net_socket`], [`Client::from_hand_off`]).
//!
//! Inbound procedures arrive as [`SentEvent`]s and terminal transitions as
//! [`Lifecycle`] signals, both fanned out over broadcast channels.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::Config;
use crate::player::Player;
use crate::protocol::{self, Outbound, Payload, ProtocolViolation, SentEvent};
use crate::timing::{self, Ticker};
use crate::transport::{Transport, TransportError};

const DEFAULT_STR: &str = "Unknown";

/// Longest name a client may pick before it is replaced.
pub const MAX_NAME_LENGTH: usize = 80;

/// Sent with the final `fatal` event when a client exhausts its budget.
pub const TIMED_OUT_MESSAGE: &str = "Your client has run out of time, and has been timed out.";

const EVENT_CAPACITY: usize = 256;

/// Terminal signals observed by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The compute budget ran out. Always followed by `Disconnected`.
    TimedOut,
    /// The connection is gone. Emitted exactly once.
    Disconnected,
}

/// Subscriptions to one client's channels.
#[derive(Debug)]
pub struct ClientEvents {
    /// Procedures the agent invoked.
    pub sent: broadcast::Receiver<SentEvent>,
    /// Timeout and disconnect signals.
    pub lifecycle: broadcast::Receiver<Lifecycle>,
}

/// Identity an agent declares while joining a game.
///
/// Deserializes from either the short handshake keys (`name`, `type`,
/// `index`) or the `play` request keys (`playerName`, `clientType`,
/// `playerIndex`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default, alias = "playerName")]
    pub name: Option<String>,
    /// Programming language of the agent.
    #[serde(default, rename = "type", alias = "clientType")]
    pub language: Option<String>,
    #[serde(default, alias = "playerIndex")]
    pub index: Option<usize>,
    #[serde(default)]
    pub meta_deltas: bool,
    #[serde(default)]
    pub spectating: bool,
}

/// A detached connection ready to be driven by a new owner.
#[derive(Debug)]
pub struct HandOff<R> {
    /// The raw connection.
    pub socket: R,
    /// Bytes read off the wire but never dispatched. Replay before reading.
    pub buffered: Bytes,
    /// Identity of the client the socket belonged to.
    pub info: ClientInfo,
}

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Client info has already been set")]
    AlreadyConfigured,
    #[error("Client already controls a player")]
    PlayerAlreadySet,
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
struct Identity {
    name: String,
    programming_language: String,
    player_index: Option<usize>,
    send_meta_deltas: bool,
    spectating: bool,
}

impl Identity {
    fn from_info(info: ClientInfo) -> Self {
        let programming_language = info
            .language
            .filter(|language| !language.is_empty())
            .unwrap_or_else(|| DEFAULT_STR.to_string());
        let mut name = info
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_STR.to_string());
        if name.chars().count() > MAX_NAME_LENGTH {
            name = format!("{programming_language} Player");
        }

        Self {
            name,
            programming_language,
            player_index: info.index,
            send_meta_deltas: info.meta_deltas,
            spectating: info.spectating,
        }
    }

    fn to_info(&self) -> ClientInfo {
        ClientInfo {
            name: Some(self.name.clone()),
            language: Some(self.programming_language.clone()),
            index: self.player_index,
            meta_deltas: self.send_meta_deltas,
            spectating: self.spectating,
        }
    }
}

/// State shared by the handles and the connection task.
struct Shared {
    config: Config,
    identity: OnceLock<Identity>,
    player: OnceLock<Arc<dyn Player>>,
    ticker: Mutex<Ticker>,
    /// Orders `TimedOut` before `Disconnected`.
    terminal: Mutex<()>,
    listening: AtomicBool,
    timed_out: AtomicBool,
    disconnected: AtomicBool,
    sent: broadcast::Sender<SentEvent>,
    lifecycle: broadcast::Sender<Lifecycle>,
}

impl Shared {
    fn name(&self) -> &str {
        self.identity
            .get()
            .map_or(DEFAULT_STR, |identity| identity.name.as_str())
    }

    fn ticker(&self) -> MutexGuard<'_, Ticker> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn has_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    fn pause_ticking(&self) {
        let Some(player) = self.player.get() else {
            return;
        };
        let elapsed = self.ticker().stop();
        if let Some(elapsed) = elapsed {
            player.deduct_time(timing::elapsed_nanos(elapsed));
        }
    }

    fn terminal(&self) -> MutexGuard<'_, ()> {
        self.terminal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the client as timed out and signals it, unless it has already
    /// disconnected.
    fn time_out(&self) -> bool {
        let _terminal = self.terminal();
        if self.has_disconnected() {
            return false;
        }
        self.timed_out.store(true, Ordering::Release);
        let _ = self.lifecycle.send(Lifecycle::TimedOut);
        true
    }

    /// Enters the terminal state. Only the first caller gets `true`.
    fn finish(&self) -> bool {
        let _terminal = self.terminal();
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pause_ticking();
        self.listening.store(false, Ordering::Release);
        tracing::info!(
            client = %self.name(),
            timed_out = self.has_timed_out(),
            "client disconnected"
        );
        let _ = self.lifecycle.send(Lifecycle::Disconnected);
        true
    }

    fn log_incoming(&self, payload: &Payload) {
        if self.config.print_tcp {
            tracing::debug!(client = %self.name(), "< from client <-- {payload}");
        }
    }

    fn log_outgoing(&self, text: &str) {
        if self.config.print_tcp {
            tracing::debug!(client = %self.name(), "> to client --> {text}");
        }
    }
}

enum Command<T: Transport> {
    Send {
        text: String,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    StopListening {
        done: oneshot::Sender<bool>,
    },
    Listen,
    Pop {
        done: oneshot::Sender<Option<(T::Raw, Bytes)>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to one remote agent's connection.
pub struct Client<T: Transport> {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command<T>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            commands: self.commands.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    /// Wrap `transport` and start receiving immediately.
    ///
    /// The returned subscriptions exist before the first read, so nothing the
    /// agent sends can be missed.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(transport: T, config: Config) -> (Self, ClientEvents) {
        Self::spawn(transport, config, None)
    }

    /// Resume a connection detached with [`Client::pop_net_socket`].
    ///
    /// Identity is restored before the buffered bytes are replayed.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn from_hand_off(hand_off: HandOff<T::Raw>, config: Config) -> (Self, ClientEvents) {
        let transport = T::from_raw(hand_off.socket, hand_off.buffered);
        Self::spawn(transport, config, Some(Identity::from_info(hand_off.info)))
    }

    fn spawn(transport: T, config: Config, identity: Option<Identity>) -> (Self, ClientEvents) {
        let (sent, sent_rx) = broadcast::channel(EVENT_CAPACITY);
        let (lifecycle, lifecycle_rx) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            config,
            identity: identity.map_or_else(OnceLock::new, OnceLock::from),
            player: OnceLock::new(),
            ticker: Mutex::new(Ticker::default()),
            terminal: Mutex::new(()),
            listening: AtomicBool::new(true),
            timed_out: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            sent,
            lifecycle,
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        let connection = Connection {
            transport,
            shared: Arc::clone(&shared),
            commands: command_rx,
        };
        tokio::spawn(connection.run());

        let events = ClientEvents {
            sent: sent_rx,
            lifecycle: lifecycle_rx,
        };
        (Self { shared, commands }, events)
    }

    /// Additional subscriptions. Only events emitted from now on are seen.
    #[must_use]
    pub fn subscribe(&self) -> ClientEvents {
        ClientEvents {
            sent: self.shared.sent.subscribe(),
            lifecycle: self.shared.lifecycle.subscribe(),
        }
    }

    #[must_use]
    pub fn has_disconnected(&self) -> bool {
        self.shared.has_disconnected()
    }

    #[must_use]
    pub fn has_timed_out(&self) -> bool {
        self.shared.has_timed_out()
    }

    /// Whether inbound data is currently being read and dispatched.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.shared.is_listening()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    #[must_use]
    pub fn programming_language(&self) -> &str {
        self.shared
            .identity
            .get()
            .map_or(DEFAULT_STR, |identity| identity.programming_language.as_str())
    }

    /// Index of this client's player in the game, if it asked for one.
    #[must_use]
    pub fn player_index(&self) -> Option<usize> {
        self.shared.identity.get().and_then(|identity| identity.player_index)
    }

    #[must_use]
    pub fn is_spectating(&self) -> bool {
        self.shared
            .identity
            .get()
            .is_some_and(|identity| identity.spectating)
    }

    /// Whether this client wants meta deltas instead of normal deltas.
    #[must_use]
    pub fn send_meta_deltas(&self) -> bool {
        self.shared
            .identity
            .get()
            .is_some_and(|identity| identity.send_meta_deltas)
    }

    /// The player this client controls; `None` while lobbied or spectating.
    #[must_use]
    pub fn player(&self) -> Option<&Arc<dyn Player>> {
        self.shared.player.get()
    }

    /// Snapshot of the declared identity, defaults filled in.
    #[must_use]
    pub fn info(&self) -> ClientInfo {
        self.shared.identity.get().map_or_else(
            || Identity::from_info(ClientInfo::default()).to_info(),
            Identity::to_info,
        )
    }

    /// Record the identity the agent declared. Names longer than
    /// [`MAX_NAME_LENGTH`] become `"<language> Player"`.
    ///
    /// # Errors
    /// Returns error if info was already set.
    pub fn set_info(&self, info: ClientInfo) -> Result<(), ClientError> {
        self.shared
            .identity
            .set(Identity::from_info(info))
            .map_err(|_| ClientError::AlreadyConfigured)
    }

    /// Bind the player whose budget this client spends.
    ///
    /// # Errors
    /// Returns error if a player was already bound.
    pub fn set_player(&self, player: Arc<dyn Player>) -> Result<(), ClientError> {
        self.shared
            .player
            .set(player)
            .map_err(|_| ClientError::PlayerAlreadySet)
    }

    /// Whether the compute budget is currently being spent.
    #[must_use]
    pub fn is_ticking(&self) -> bool {
        self.shared.ticker().is_ticking()
    }

    /// Start spending the player's budget; call when the agent is expected to
    /// be computing. Schedules a timeout for the remaining balance.
    ///
    /// Returns false when there is no player, timing is disabled, or the
    /// client is gone. Returns true without restarting if already ticking.
    pub fn start_ticking(&self) -> bool {
        let Some(player) = self.shared.player.get() else {
            return false;
        };
        if !self.shared.config.timeouts_enabled || self.has_disconnected() {
            return false;
        }

        let delay = timing::budget_to_delay(player.time_remaining());
        let client = self.clone();
        self.shared
            .ticker()
            .start(delay, move |generation| client.trigger_timed_out(generation));
        true
    }

    /// Stop the clock and charge the player for the time spent since
    /// [`Client::start_ticking`]. No-op when not ticking.
    pub fn pause_ticking(&self) {
        self.shared.pause_ticking();
    }

    /// Stop reading from the socket. Once this resolves no further inbound
    /// data is read until [`Client::listen_to_socket`].
    ///
    /// Returns false if the client was not listening.
    pub async fn stop_listening_to_socket(&self) -> bool {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::StopListening { done }).is_err() {
            return false;
        }
        stopped.await.unwrap_or(false)
    }

    /// Resume reading after [`Client::stop_listening_to_socket`].
    pub fn listen_to_socket(&self) {
        let _ = self.commands.send(Command::Listen);
    }

    /// Detach the socket for another owner. The client stops reading and can
    /// no longer send; it does not count as disconnected.
    ///
    /// Returns `None` if the socket was already popped or closed.
    pub async fn pop_net_socket(&self) -> Option<HandOff<T::Raw>> {
        let (done, popped) = oneshot::channel();
        self.commands.send(Command::Pop { done }).ok()?;
        let (socket, buffered) = popped.await.ok()??;
        Some(HandOff {
            socket,
            buffered,
            info: self.info(),
        })
    }

    /// Serialize `event` and send it.
    ///
    /// # Errors
    /// Returns error if serialization or the write fails.
    pub async fn send<E: Serialize + Sync + ?Sized>(&self, event: &E) -> Result<(), ClientError> {
        let text = protocol::to_wire(event)?;
        self.send_raw(text).await
    }

    /// Send an already serialized document. Resolves once the transport
    /// confirms the write, or immediately if there is no socket any more.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn send_raw(&self, text: String) -> Result<(), ClientError> {
        if self.has_disconnected() {
            return Ok(());
        }
        let (done, written) = oneshot::channel();
        if self.commands.send(Command::Send { text, done }).is_err() {
            return Ok(());
        }
        match written.await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Ok(()),
        }
    }

    /// Disconnect, optionally telling the agent why with a final `fatal`
    /// event first.
    pub async fn disconnect(&self, fatal_message: Option<&str>) {
        if let Some(message) = fatal_message {
            let fatal = Outbound::fatal(message, self.has_timed_out());
            if let Err(e) = self.send(&fatal).await {
                tracing::debug!(client = %self.name(), "Failed to send fatal message: {e}");
            }
        }
        self.disconnected().await;
    }

    async fn disconnected(&self) {
        if self.has_disconnected() {
            return;
        }
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = closed.await;
        }
        self.shared.finish();
    }

    async fn trigger_timed_out(self, generation: u64) {
        let elapsed = self.shared.ticker().expire(generation);
        let Some(elapsed) = elapsed else {
            return;
        };

        if let Some(player) = self.shared.player.get() {
            player.deduct_time(timing::elapsed_nanos(elapsed));
        }
        if !self.shared.time_out() {
            return;
        }
        tracing::warn!(client = %self.name(), "client ran out of time");

        self.disconnect(Some(TIMED_OUT_MESSAGE)).await;
    }
}

/// The connection task: sole owner of the transport.
struct Connection<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command<T>>,
}

impl<T: Transport> Connection<T> {
    async fn run(mut self) {
        loop {
            if self.shared.has_disconnected() {
                self.transport.close().await;
                return;
            }
            let listening = self.shared.is_listening();

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Send { text, done }) => {
                        let result = self.write(text).await;
                        let failed = result.is_err();
                        let _ = done.send(result);
                        if failed {
                            self.teardown().await;
                            return;
                        }
                    }
                    Some(Command::StopListening { done }) => {
                        let _ = done.send(self.shared.listening.swap(false, Ordering::AcqRel));
                    }
                    Some(Command::Listen) => {
                        self.shared.listening.store(true, Ordering::Release);
                    }
                    Some(Command::Pop { done }) => {
                        self.shared.listening.store(false, Ordering::Release);
                        let _ = done.send(self.transport.into_raw().await);
                        return;
                    }
                    Some(Command::Shutdown { done }) => {
                        self.transport.close().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        tracing::debug!(client = %self.shared.name(), "All client handles dropped");
                        self.teardown().await;
                        return;
                    }
                },

                incoming = self.transport.receive(), if listening => {
                    let flow = match incoming {
                        Some(Ok(payload)) => self.on_payload(payload).await,
                        Some(Err(e)) => {
                            tracing::debug!(client = %self.shared.name(), "Transport error: {e}");
                            self.teardown().await;
                            ControlFlow::Break(())
                        }
                        None => {
                            self.teardown().await;
                            ControlFlow::Break(())
                        }
                    };
                    if flow.is_break() {
                        return;
                    }
                }
            }
        }
    }

    async fn on_payload(&mut self, payload: Payload) -> ControlFlow<()> {
        self.shared.log_incoming(&payload);
        let Some(value) = self.parse_data(&payload).await else {
            return ControlFlow::Break(());
        };
        self.handle_sent(value).await
    }

    /// Parses a payload, fatally disconnecting on anything that is not JSON.
    async fn parse_data(&mut self, payload: &Payload) -> Option<Value> {
        match protocol::parse_payload(payload) {
            Ok(value) => Some(value),
            Err(violation) => {
                self.fatal(&violation).await;
                None
            }
        }
    }

    async fn handle_sent(&mut self, value: Value) -> ControlFlow<()> {
        match protocol::decode_sent(value) {
            Ok(event) => {
                let _ = self.shared.sent.send(event);
                ControlFlow::Continue(())
            }
            Err(violation) => {
                self.fatal(&violation).await;
                ControlFlow::Break(())
            }
        }
    }

    async fn fatal(&mut self, violation: &ProtocolViolation) {
        tracing::warn!(client = %self.shared.name(), "Protocol violation: {violation}");
        let fatal = Outbound::fatal(violation.to_string(), self.shared.has_timed_out());
        match protocol::to_wire(&fatal) {
            Ok(text) => {
                if let Err(e) = self.write(text).await {
                    tracing::debug!(client = %self.shared.name(), "Failed to send fatal message: {e}");
                }
            }
            Err(e) => tracing::error!("Failed to serialize fatal message: {e}"),
        }
        self.teardown().await;
    }

    async fn write(&mut self, text: String) -> Result<(), TransportError> {
        if self.shared.has_disconnected() {
            return Ok(());
        }
        self.shared.log_outgoing(&text);
        self.transport.send(text).await
    }

    /// Destroys the transport, then enters the terminal state.
    async fn teardown(&mut self) {
        self.transport.close().await;
        self.shared.finish();
    }
}
