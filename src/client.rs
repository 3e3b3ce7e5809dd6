//! Transport session: authentication, connection lifecycle, and message routing.
//!
//! [`SessionClient`] owns the single logical connection to the game server. Once
//! connected, a background transport loop multiplexes outgoing commands and
//! incoming frames with `tokio::select!`. Inbound messages are routed by
//! [`MessageKind`] to at most one [`Subscription`] each, in arrival order.
//!
//! [`SessionHandle`] is a cheap clone of the shared state used by the
//! matchmaker and match session so all of them share one connection.
//!
//! # Example
//!
//! ```rust,ignore
//! let connector = WebSocketConnector::new("ws://localhost:7350/ws");
//! let (mut client, mut events) = SessionClient::new(connector, ClientConfig::new());
//!
//! let credential = client.authenticate(&device_id).await?;
//! client.connect(&credential).await?;
//!
//! let matchmaker = Matchmaker::new(client.handle());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{GameClientError, Result};
use crate::event::SessionEvent;
use crate::game::OpCode;
use crate::protocol::{
    ClientMessage, Credential, DeviceId, MatchId, MessageKind, ServerMessage, Ticket, UserId,
};
use crate::router::{Router, Subscription};
use crate::transport::{Connector, Transport};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for request/response exchanges (handshakes, tickets, joins).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionClient`].
///
/// # Example
///
/// ```
/// use tictactoe_session_client::client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new()
///     .with_event_channel_capacity(64)
///     .with_request_timeout(Duration::from_secs(5));
/// assert_eq!(config.event_channel_capacity, 64);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped with a warning rather
    /// than stalling the transport loop. `Disconnected` is always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the transport loop gets to close the transport on
    /// [`SessionClient::disconnect`] before it is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Upper bound for every request that waits on a server response:
    /// authentication, session start, ticket issuance, and match join.
    ///
    /// Defaults to **10 seconds**.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the capacity of the bounded event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the timeout for request/response exchanges.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// Lifecycle of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last attempt or the live connection failed.
    Failed,
}

/// Connection-wide ownership of the matchmaking request or the active match.
struct Claim<T> {
    owner: u64,
    value: T,
}

struct Link {
    state: ConnectionState,
    cmd_tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    /// Bumped for every transport loop so a stale loop cannot tear down a newer one.
    generation: u64,
    /// The one outstanding search; `None` inside while the ticket is not issued yet.
    search: Option<Claim<Option<Ticket>>>,
    /// The one joined (or joining) match.
    active_match: Option<Claim<MatchId>>,
}

/// State shared between the client, its handles, and the transport loop.
struct Shared {
    link: Mutex<Link>,
    credential: Mutex<Option<Credential>>,
    router: Arc<Router>,
    request_timeout: Duration,
    next_owner: AtomicU64,
}

impl Shared {
    fn new(request_timeout: Duration) -> Self {
        Self {
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                cmd_tx: None,
                generation: 0,
                search: None,
                active_match: None,
            }),
            credential: Mutex::new(None),
            router: Arc::new(Router::default()),
            request_timeout,
            next_owner: AtomicU64::new(1),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credential(&self) -> MutexGuard<'_, Option<Credential>> {
        self.credential.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.link().state = state;
    }

    /// Installs the command channel of a freshly spawned loop and returns its generation.
    fn install(&self, cmd_tx: mpsc::UnboundedSender<ClientMessage>) -> u64 {
        let mut link = self.link();
        link.generation += 1;
        link.cmd_tx = Some(cmd_tx);
        link.state = ConnectionState::Connected;
        link.search = None;
        link.active_match = None;
        link.generation
    }

    /// Tears down the connection owned by `generation`.
    ///
    /// Searches and matches die with the connection, so their claims go too.
    /// Returns `true` only for the call that actually performed the teardown.
    fn mark_down(&self, generation: u64, state: ConnectionState) -> bool {
        let mut link = self.link();
        if link.generation != generation || link.cmd_tx.is_none() {
            return false;
        }
        link.cmd_tx = None;
        link.state = state;
        link.search = None;
        link.active_match = None;
        // Still under the link lock, so no subscribe lands between the two.
        self.router.close_all();
        true
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable handle onto a [`SessionClient`]'s connection.
///
/// Sending is queue-and-return: methods succeed once the message is handed
/// to the transport loop and never wait for a server round trip.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.link().state
    }

    /// Returns `true` if the connection is live.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// The authenticated user, once a credential has been obtained.
    pub fn user_id(&self) -> Option<UserId> {
        self.shared.credential().as_ref().map(|c| c.user_id().to_owned())
    }

    /// Timeout applied to request/response exchanges.
    pub fn request_timeout(&self) -> Duration {
        self.shared.request_timeout
    }

    /// Registers the sole subscriber for `kind`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] without a live connection.
    pub fn subscribe(&self, kind: MessageKind) -> Result<Subscription> {
        // Holding the link lock keeps a concurrent teardown from missing this slot.
        let link = self.shared.link();
        if link.state != ConnectionState::Connected {
            return Err(GameClientError::NotConnected);
        }
        let subscription = self.shared.router.subscribe(kind);
        drop(link);
        Ok(subscription)
    }

    /// Returns `true` if some subscriber currently owns `kind`.
    pub fn is_subscribed(&self, kind: MessageKind) -> bool {
        self.shared.router.is_subscribed(kind)
    }

    /// Sends an op-code tagged payload to a match.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] without a live connection.
    pub fn send_match_data(&self, match_id: &str, op_code: OpCode, data: Vec<u8>) -> Result<()> {
        self.send(ClientMessage::MatchDataSend {
            match_id: match_id.to_owned(),
            op_code: op_code.code(),
            data,
        })
    }

    /// Send a heartbeat ping.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] without a live connection.
    pub fn ping(&self) -> Result<()> {
        self.send(ClientMessage::Ping)
    }

    /// Queue a `ClientMessage` to the transport loop.
    pub(crate) fn send(&self, msg: ClientMessage) -> Result<()> {
        let link = self.shared.link();
        if link.state != ConnectionState::Connected {
            return Err(GameClientError::NotConnected);
        }
        link.cmd_tx
            .as_ref()
            .ok_or(GameClientError::NotConnected)?
            .send(msg)
            .map_err(|_| GameClientError::NotConnected)
    }

    /// Removes subscription `id` for `kind` unless it has been replaced already.
    pub(crate) fn unsubscribe(&self, kind: MessageKind, id: u64) {
        self.shared.router.unsubscribe(kind, id);
    }

    // ── Connection-wide claims ──────────────────────────────────────

    /// A fresh owner id for a matchmaker or match session on this connection.
    pub(crate) fn owner_id(&self) -> u64 {
        self.shared.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves the connection's single matchmaking slot for `owner`.
    ///
    /// # Errors
    ///
    /// - [`GameClientError::NotConnected`] without a live connection.
    /// - [`GameClientError::MatchmakingPending`] if another owner is searching.
    pub(crate) fn claim_search(&self, owner: u64) -> Result<()> {
        let mut link = self.shared.link();
        if link.state != ConnectionState::Connected {
            return Err(GameClientError::NotConnected);
        }
        match &link.search {
            Some(claim) if claim.owner != owner => Err(GameClientError::MatchmakingPending {
                ticket: claim.value.clone(),
            }),
            _ => {
                link.search = Some(Claim {
                    owner,
                    value: None,
                });
                Ok(())
            }
        }
    }

    /// Records the ticket issued to `owner`'s search.
    pub(crate) fn note_ticket(&self, owner: u64, ticket: &str) {
        if let Some(claim) = self.shared.link().search.as_mut() {
            if claim.owner == owner {
                claim.value = Some(ticket.to_owned());
            }
        }
    }

    /// Frees the matchmaking slot if `owner` still holds it.
    pub(crate) fn release_search(&self, owner: u64) {
        let mut link = self.shared.link();
        if link.search.as_ref().is_some_and(|c| c.owner == owner) {
            link.search = None;
        }
    }

    /// Reserves the connection's single match slot for `owner`.
    ///
    /// # Errors
    ///
    /// - [`GameClientError::NotConnected`] without a live connection.
    /// - [`GameClientError::AlreadyJoined`] if another owner holds a match.
    pub(crate) fn claim_match(&self, owner: u64, match_id: &str) -> Result<()> {
        let mut link = self.shared.link();
        if link.state != ConnectionState::Connected {
            return Err(GameClientError::NotConnected);
        }
        match &link.active_match {
            Some(claim) if claim.owner != owner => Err(GameClientError::AlreadyJoined {
                active: claim.value.clone(),
            }),
            _ => {
                link.active_match = Some(Claim {
                    owner,
                    value: match_id.to_owned(),
                });
                Ok(())
            }
        }
    }

    /// Returns `true` while `owner` holds the match slot on the live connection.
    pub(crate) fn holds_match(&self, owner: u64) -> bool {
        self.shared
            .link()
            .active_match
            .as_ref()
            .is_some_and(|c| c.owner == owner)
    }

    /// Frees the match slot if `owner` still holds it.
    pub(crate) fn release_match(&self, owner: u64) {
        let mut link = self.shared.link();
        if link.active_match.as_ref().is_some_and(|c| c.owner == owner) {
            link.active_match = None;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.connection_state())
            .field("user_id", &self.user_id())
            .field("router", &self.shared.router)
            .finish()
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Owner of the connection to the game server.
///
/// Construct one per process at the composition root and pass
/// [`handle`](Self::handle)s to the matchmaker and match session.
pub struct SessionClient<C: Connector> {
    connector: C,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<SessionEvent>,
    /// Transport opened by `authenticate`, reused by the next `connect`.
    parked: Option<C::Transport>,
    /// Handle to the background transport loop task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to signal the transport loop to shut down gracefully.
    shutdown_tx: Option<oneshot::Sender<()>>,
    generation: u64,
    shutdown_timeout: Duration,
}

impl<C: Connector> SessionClient<C> {
    /// Create a disconnected client plus the lifecycle event receiver.
    ///
    /// The receiver stays valid across reconnects.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn new(connector: C, config: ClientConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let client = Self {
            connector,
            shared: Arc::new(Shared::new(config.request_timeout)),
            event_tx,
            parked: None,
            task: None,
            shutdown_tx: None,
            generation: 0,
            shutdown_timeout: config.shutdown_timeout,
        };
        (client, event_rx)
    }

    /// A cloneable handle onto this client's connection.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Exchange a stable device id for a session credential.
    ///
    /// The transport opened for the exchange is kept for the following
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::AuthFailure`] if the server is unreachable,
    /// does not answer within the request timeout, or rejects the device.
    pub async fn authenticate(&mut self, device_id: &DeviceId) -> Result<Credential> {
        info!(%device_id, "authenticating device");

        let mut transport = match self.parked.take() {
            Some(transport) => transport,
            None => self
                .connector
                .connect()
                .await
                .map_err(|e| GameClientError::auth(format!("could not reach server: {e}")))?,
        };

        let request = ClientMessage::Authenticate {
            device_id: *device_id,
            create: true,
        };
        let response = handshake(
            &mut transport,
            &request,
            MessageKind::Authentication,
            self.shared.request_timeout,
        )
        .await;

        match response {
            Ok(ServerMessage::Authenticated {
                token,
                user_id,
                created,
            }) => {
                info!(%user_id, created, "device authenticated");
                let credential = Credential::new(token, user_id);
                *self.shared.credential() = Some(credential.clone());
                self.parked = Some(transport);
                Ok(credential)
            }
            Ok(ServerMessage::AuthenticationError { error, error_code }) => {
                warn!(%error, ?error_code, "authentication rejected");
                close_quietly(&mut transport).await;
                Err(GameClientError::AuthFailure {
                    reason: error,
                    error_code: Some(error_code),
                })
            }
            Ok(other) => {
                close_quietly(&mut transport).await;
                Err(GameClientError::auth(format!(
                    "unexpected response: {:?}",
                    other.kind()
                )))
            }
            Err(e) => {
                warn!("authentication failed: {e}");
                close_quietly(&mut transport).await;
                Err(match e {
                    GameClientError::ServerError {
                        message,
                        error_code,
                    } => GameClientError::AuthFailure {
                        reason: message,
                        error_code,
                    },
                    other => GameClientError::auth(other.to_string()),
                })
            }
        }
    }

    /// Open the realtime session with `credential` and start the transport loop.
    ///
    /// Does nothing if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::ConnectFailure`] if no transport could be
    /// opened or the server refused the credential. The connection state is
    /// then [`ConnectionState::Failed`].
    pub async fn connect(&mut self, credential: &Credential) -> Result<()> {
        if self.shared.link().state == ConnectionState::Connected {
            debug!("connect called while connected; ignoring");
            return Ok(());
        }
        self.shared.set_state(ConnectionState::Connecting);

        let result = self.open_session(credential).await;
        if let Err(e) = &result {
            warn!("connect failed: {e}");
            self.shared.set_state(ConnectionState::Failed);
        }
        result
    }

    async fn open_session(&mut self, credential: &Credential) -> Result<()> {
        let mut transport = match self.parked.take() {
            Some(transport) => transport,
            None => self
                .connector
                .connect()
                .await
                .map_err(|e| GameClientError::connect(format!("could not open transport: {e}")))?,
        };

        let request = ClientMessage::SessionStart {
            token: credential.token().to_owned(),
        };
        let response = handshake(
            &mut transport,
            &request,
            MessageKind::Session,
            self.shared.request_timeout,
        )
        .await;

        let user_id = match response {
            Ok(ServerMessage::SessionAccepted { user_id }) => user_id,
            Ok(ServerMessage::SessionRejected { reason, error_code }) => {
                close_quietly(&mut transport).await;
                return Err(GameClientError::ConnectFailure { reason, error_code });
            }
            Ok(other) => {
                close_quietly(&mut transport).await;
                return Err(GameClientError::connect(format!(
                    "unexpected response: {:?}",
                    other.kind()
                )));
            }
            Err(GameClientError::ServerError {
                message,
                error_code,
            }) => {
                close_quietly(&mut transport).await;
                return Err(GameClientError::ConnectFailure {
                    reason: message,
                    error_code,
                });
            }
            Err(e) => {
                close_quietly(&mut transport).await;
                return Err(GameClientError::connect(e.to_string()));
            }
        };

        if user_id != credential.user_id() {
            warn!(
                expected = credential.user_id(),
                actual = %user_id,
                "server accepted session for a different user"
            );
        }
        *self.shared.credential() = Some(credential.clone());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let generation = self.shared.install(cmd_tx);

        self.task = Some(tokio::spawn(transport_loop(
            transport,
            cmd_rx,
            self.event_tx.clone(),
            Arc::clone(&self.shared),
            generation,
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
        self.generation = generation;

        info!(%user_id, "session connected");
        emit_event(&self.event_tx, SessionEvent::Connected { user_id });
        Ok(())
    }

    /// Drop the current connection (if any) and connect again with the stored credential.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] if no credential has been
    /// obtained yet, otherwise whatever [`connect`](Self::connect) returns.
    pub async fn reconnect(&mut self) -> Result<()> {
        let credential = self
            .shared
            .credential()
            .clone()
            .ok_or(GameClientError::NotConnected)?;
        self.disconnect().await;
        self.connect(&credential).await
    }

    /// Close the connection and stop the background task.
    ///
    /// Idempotent. Subsequent sends fail with [`GameClientError::NotConnected`].
    pub async fn disconnect(&mut self) {
        debug!("disconnect requested");

        if let Some(mut transport) = self.parked.take() {
            close_quietly(&mut transport).await;
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the transport loop with a timeout. If it doesn't exit in time,
        // abort it so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("transport loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("transport loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("transport loop aborted: {join_err}");
                    }
                }
            }
        }

        // Covers an aborted loop that never reached its own teardown.
        if self
            .shared
            .mark_down(self.generation, ConnectionState::Disconnected)
        {
            emit_disconnected(&self.event_tx, Some("client shut down".into())).await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    // ── Delegates ───────────────────────────────────────────────────

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.link().state
    }

    /// Returns `true` if the connection is live.
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// The credential from the last successful authentication or connection.
    pub fn credential(&self) -> Option<Credential> {
        self.shared.credential().clone()
    }

    /// See [`SessionHandle::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] without a live connection.
    pub fn subscribe(&self, kind: MessageKind) -> Result<Subscription> {
        self.handle().subscribe(kind)
    }

    /// See [`SessionHandle::send_match_data`].
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] without a live connection.
    pub fn send_match_data(&self, match_id: &str, op_code: OpCode, data: Vec<u8>) -> Result<()> {
        self.handle().send_match_data(match_id, op_code, data)
    }

    /// Send a heartbeat ping.
    ///
    /// # Errors
    ///
    /// Returns [`GameClientError::NotConnected`] without a live connection.
    pub fn ping(&self) -> Result<()> {
        self.handle().ping()
    }
}

impl<C: Connector> std::fmt::Debug for SessionClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.connection_state())
            .field("has_task", &self.task.is_some())
            .field("has_parked_transport", &self.parked.is_some())
            .finish()
    }
}

impl<C: Connector> Drop for SessionClient<C> {
    fn drop(&mut self) {
        // `Drop` is synchronous so we cannot await a graceful shutdown.
        // Abort the loop and tear the shared state down directly so handles
        // held elsewhere observe the disconnect.
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self
            .shared
            .mark_down(self.generation, ConnectionState::Disconnected)
        {
            let _ = self.event_tx.try_send(SessionEvent::Disconnected {
                reason: Some("client dropped".into()),
            });
        }
    }
}

// ── Handshake ───────────────────────────────────────────────────────

/// Sends `request` and waits for the first response of kind `expect`.
///
/// Unrelated frames are skipped. A server `Error` frame ends the exchange.
async fn handshake<T: Transport>(
    transport: &mut T,
    request: &ClientMessage,
    expect: MessageKind,
    timeout: Duration,
) -> Result<ServerMessage> {
    let json = serde_json::to_string(request)?;
    transport.send(json).await?;

    let exchange = async {
        loop {
            let text = match transport.recv().await {
                Some(Ok(text)) => text,
                Some(Err(e)) => return Err(e),
                None => return Err(GameClientError::TransportClosed),
            };
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) if msg.kind() == expect => return Ok(msg),
                Ok(ServerMessage::Error {
                    message,
                    error_code,
                }) => {
                    return Err(GameClientError::ServerError {
                        message,
                        error_code,
                    })
                }
                Ok(other) => debug!(kind = ?other.kind(), "skipping frame during handshake"),
                Err(e) => warn!("undecodable frame during handshake: {e}"),
            }
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| GameClientError::Timeout)?
}

async fn close_quietly<T: Transport>(transport: &mut T) {
    if let Err(e) = transport.close().await {
        debug!("transport close failed: {e}");
    }
}

// ── Transport loop ──────────────────────────────────────────────────

/// Background transport loop that multiplexes send/receive via `tokio::select!`.
///
/// Exits when:
/// - Shutdown is signalled or the command channel closes
/// - The transport returns `None` (server closed connection)
/// - A transport error occurs
async fn transport_loop<T: Transport>(
    mut transport: T,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: mpsc::Sender<SessionEvent>,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(generation, "transport loop started");

    let (final_state, reason) = loop {
        tokio::select! {
            // Branch 1: outgoing command from a handle
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(msg) => {
                        debug!("sending client message: {:?}", std::mem::discriminant(&msg));
                        match serde_json::to_string(&msg) {
                            Ok(json) => {
                                if let Err(e) = transport.send(json).await {
                                    error!("transport send error: {e}");
                                    break (
                                        ConnectionState::Failed,
                                        Some(format!("transport send error: {e}")),
                                    );
                                }
                            }
                            Err(e) => {
                                error!("failed to serialize ClientMessage: {e}");
                            }
                        }
                    }
                    None => {
                        debug!("command channel closed, shutting down transport loop");
                        close_quietly(&mut transport).await;
                        break (ConnectionState::Disconnected, Some("client shut down".into()));
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                close_quietly(&mut transport).await;
                break (ConnectionState::Disconnected, Some("client shut down".into()));
            }

            // Branch 3: incoming message from the server
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => route(&shared, &event_tx, msg),
                        Err(e) => warn!("failed to deserialize server message: {e} (raw: {text})"),
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        break (
                            ConnectionState::Failed,
                            Some(format!("transport receive error: {e}")),
                        );
                    }
                    None => {
                        debug!("transport closed by server");
                        break (ConnectionState::Disconnected, None);
                    }
                }
            }
        }
    };

    if shared.mark_down(generation, final_state) {
        emit_disconnected(&event_tx, reason).await;
    }
    debug!(generation, "transport loop exited");
}

/// Hands `msg` to its subscriber; unclaimed server errors become events.
fn route(shared: &Shared, event_tx: &mpsc::Sender<SessionEvent>, msg: ServerMessage) {
    match shared.router.dispatch(msg) {
        None => {}
        Some(ServerMessage::Error {
            message,
            error_code,
        }) => {
            warn!(%message, ?error_code, "server error");
            emit_event(
                event_tx,
                SessionEvent::ServerError {
                    message,
                    error_code,
                },
            );
        }
        Some(other) => debug!(kind = ?other.kind(), "no subscriber for message; dropping"),
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid blocking the transport loop.
fn emit_event(event_tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit a [`Disconnected`](SessionEvent::Disconnected) event.
///
/// Uses `send().await` instead of `try_send` because `Disconnected` ends a
/// connection's event sequence and must never be silently dropped.
async fn emit_disconnected(event_tx: &mpsc::Sender<SessionEvent>, reason: Option<String>) {
    if event_tx
        .send(SessionEvent::Disconnected { reason })
        .await
        .is_err()
    {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    type Script = Vec<Option<std::result::Result<String, GameClientError>>>;

    // ── Mock transport ──────────────────────────────────────────────

    /// A mock transport that records sent messages and replays scripted responses.
    struct MockTransport {
        incoming: VecDeque<Option<std::result::Result<String, GameClientError>>>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), GameClientError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, GameClientError>> {
            if let Some(item) = self.incoming.pop_front() {
                item
            } else {
                // All scripted messages have been delivered; hang forever
                // so the transport loop stays alive until shutdown.
                std::future::pending().await
            }
        }

        async fn close(&mut self) -> std::result::Result<(), GameClientError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Hands out one scripted transport per `connect` call.
    struct MockConnector {
        scripts: StdMutex<VecDeque<Script>>,
        opened: Arc<AtomicUsize>,
        sent: Arc<StdMutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    impl MockConnector {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: StdMutex::new(scripts.into()),
                opened: Arc::new(AtomicUsize::new(0)),
                sent: Arc::new(StdMutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&self) -> std::result::Result<MockTransport, GameClientError> {
            let script = self.scripts.lock().unwrap().pop_front().ok_or_else(|| {
                GameClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "no server",
                ))
            })?;
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockTransport {
                incoming: script.into(),
                sent: Arc::clone(&self.sent),
                closed: Arc::clone(&self.closed),
            })
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn frame(msg: &ServerMessage) -> Option<std::result::Result<String, GameClientError>> {
        Some(Ok(serde_json::to_string(msg).unwrap()))
    }

    fn authenticated() -> Option<std::result::Result<String, GameClientError>> {
        frame(&ServerMessage::Authenticated {
            token: "tok-1".into(),
            user_id: "user-1".into(),
            created: true,
        })
    }

    fn accepted() -> Option<std::result::Result<String, GameClientError>> {
        frame(&ServerMessage::SessionAccepted {
            user_id: "user-1".into(),
        })
    }

    fn sent_messages(connector: &MockConnector) -> Vec<ClientMessage> {
        connector
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::new()
            .with_request_timeout(Duration::from_millis(200))
            .with_shutdown_timeout(Duration::from_millis(100))
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn authenticate_then_connect_reuses_transport() {
        let connector = MockConnector::new(vec![vec![authenticated(), accepted()]]);
        let opened = Arc::clone(&connector.opened);
        let (mut client, mut events) = SessionClient::new(connector, fast_config());

        let credential = client.authenticate(&DeviceId::generate()).await.unwrap();
        assert_eq!(credential.user_id(), "user-1");
        assert_eq!(credential.token(), "tok-1");

        client.connect(&credential).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        let ev = events.recv().await.unwrap();
        assert_eq!(
            ev,
            SessionEvent::Connected {
                user_id: "user-1".into()
            }
        );

        let sent = sent_messages(&client.connector);
        assert!(matches!(sent[0], ClientMessage::Authenticate { create: true, .. }));
        assert!(matches!(&sent[1], ClientMessage::SessionStart { token } if token == "tok-1"));

        client.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_device_is_auth_failure() {
        let connector = MockConnector::new(vec![vec![frame(&ServerMessage::AuthenticationError {
            error: "device banned".into(),
            error_code: crate::ErrorCode::AccountDisabled,
        })]]);
        let closed = Arc::clone(&connector.closed);
        let (mut client, _events) = SessionClient::new(connector, fast_config());

        let err = client.authenticate(&DeviceId::generate()).await.unwrap_err();
        assert!(matches!(
            err,
            GameClientError::AuthFailure {
                error_code: Some(crate::ErrorCode::AccountDisabled),
                ..
            }
        ));
        assert!(closed.load(Ordering::Relaxed));
        assert!(client.credential().is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_auth_failure() {
        let (mut client, _events) = SessionClient::new(MockConnector::new(vec![]), fast_config());
        let err = client.authenticate(&DeviceId::generate()).await.unwrap_err();
        assert!(matches!(err, GameClientError::AuthFailure { .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out_authentication() {
        let (mut client, _events) =
            SessionClient::new(MockConnector::new(vec![vec![]]), fast_config());
        let err = client.authenticate(&DeviceId::generate()).await.unwrap_err();
        match err {
            GameClientError::AuthFailure { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected AuthFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let connector = MockConnector::new(vec![vec![accepted()]]);
        let opened = Arc::clone(&connector.opened);
        let (mut client, mut events) = SessionClient::new(connector, fast_config());
        let credential = Credential::new("tok-1", "user-1");

        client.connect(&credential).await.unwrap();
        client.connect(&credential).await.unwrap();

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::Connected { .. })
        ));
        assert!(events.try_recv().is_err(), "only one Connected expected");

        client.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_session_sets_failed_state() {
        let connector = MockConnector::new(vec![vec![frame(&ServerMessage::SessionRejected {
            reason: "token expired".into(),
            error_code: Some(crate::ErrorCode::InvalidToken),
        })]]);
        let (mut client, _events) = SessionClient::new(connector, fast_config());

        let err = client
            .connect(&Credential::new("old", "user-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GameClientError::ConnectFailure {
                error_code: Some(crate::ErrorCode::InvalidToken),
                ..
            }
        ));
        assert_eq!(client.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let (client, _events) = SessionClient::new(MockConnector::new(vec![]), fast_config());
        assert!(matches!(client.ping(), Err(GameClientError::NotConnected)));
        assert!(matches!(
            client.subscribe(MessageKind::Pong),
            Err(GameClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn unclaimed_server_error_becomes_event() {
        let connector = MockConnector::new(vec![vec![
            accepted(),
            frame(&ServerMessage::Error {
                message: "slow down".into(),
                error_code: Some(crate::ErrorCode::RateLimitExceeded),
            }),
        ]]);
        let (mut client, mut events) = SessionClient::new(connector, fast_config());
        client.connect(&Credential::new("t", "user-1")).await.unwrap();

        let _ = events.recv().await; // Connected
        let ev = events.recv().await.unwrap();
        assert_eq!(
            ev,
            SessionEvent::ServerError {
                message: "slow down".into(),
                error_code: Some(crate::ErrorCode::RateLimitExceeded),
            }
        );

        client.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let connector = MockConnector::new(vec![vec![
            accepted(),
            Some(Ok("{not json".into())),
            frame(&ServerMessage::Pong),
        ]]);
        let (mut client, _events) = SessionClient::new(connector, fast_config());
        client.connect(&Credential::new("t", "user-1")).await.unwrap();

        // The loop has not been polled yet, so this subscription sees everything.
        let mut pongs = client.subscribe(MessageKind::Pong).unwrap();
        assert!(matches!(pongs.recv().await, Some(ServerMessage::Pong)));
        assert!(client.is_connected());

        client.disconnect().await;
    }

    #[tokio::test]
    async fn server_close_ends_subscriptions() {
        let connector = MockConnector::new(vec![vec![accepted(), None]]);
        let (mut client, mut events) = SessionClient::new(connector, fast_config());
        client.connect(&Credential::new("t", "user-1")).await.unwrap();
        let mut data = client.subscribe(MessageKind::MatchData).unwrap();

        assert!(data.recv().await.is_none());
        let _ = events.recv().await; // Connected
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Disconnected { reason: None })
        );
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!client.handle().is_subscribed(MessageKind::MatchData));
    }

    #[tokio::test]
    async fn teardown_clears_claims_and_ignores_stale_generations() {
        let handle = SessionHandle {
            shared: Arc::new(Shared::new(Duration::from_millis(50))),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = handle.shared.install(tx);
        let (searcher, player) = (handle.owner_id(), handle.owner_id());
        handle.claim_search(searcher).unwrap();
        handle.claim_match(player, "m-1").unwrap();
        let mut old = handle.subscribe(MessageKind::MatchData).unwrap();

        assert!(handle.shared.mark_down(first, ConnectionState::Disconnected));
        assert!(!handle.holds_match(player));
        assert!(old.recv().await.is_none());
        assert!(!handle.is_subscribed(MessageKind::MatchData));

        let (tx, _rx) = mpsc::unbounded_channel();
        let second = handle.shared.install(tx);
        handle.claim_match(player, "m-1").unwrap();
        let _fresh = handle.subscribe(MessageKind::MatchData).unwrap();

        // A late teardown for the old connection touches nothing.
        assert!(!handle.shared.mark_down(first, ConnectionState::Disconnected));
        assert!(handle.holds_match(player));
        assert!(handle.is_subscribed(MessageKind::MatchData));
        assert!(handle.shared.mark_down(second, ConnectionState::Disconnected));
        assert!(!handle.is_subscribed(MessageKind::MatchData));
    }

    #[tokio::test]
    async fn receive_error_marks_failed() {
        let connector = MockConnector::new(vec![vec![
            accepted(),
            Some(Err(GameClientError::TransportReceive("boom".into()))),
        ]]);
        let (mut client, mut events) = SessionClient::new(connector, fast_config());
        client.connect(&Credential::new("t", "user-1")).await.unwrap();

        let _ = events.recv().await; // Connected
        match events.recv().await.unwrap() {
            SessionEvent::Disconnected { reason } => assert!(reason.unwrap().contains("boom")),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        assert_eq!(client.connection_state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_emits_once() {
        let connector = MockConnector::new(vec![vec![accepted()]]);
        let closed = Arc::clone(&connector.closed);
        let (mut client, mut events) = SessionClient::new(connector, fast_config());
        client.connect(&Credential::new("t", "user-1")).await.unwrap();
        let handle = client.handle();

        client.disconnect().await;
        client.disconnect().await;

        assert!(closed.load(Ordering::Relaxed));
        assert!(!handle.is_connected());
        assert!(matches!(handle.ping(), Err(GameClientError::NotConnected)));

        let _ = events.recv().await; // Connected
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Disconnected {
                reason: Some("client shut down".into())
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_uses_stored_credential() {
        let connector = MockConnector::new(vec![vec![accepted()], vec![accepted()]]);
        let opened = Arc::clone(&connector.opened);
        let (mut client, _events) = SessionClient::new(connector, fast_config());
        client
            .connect(&Credential::new("tok-9", "user-1"))
            .await
            .unwrap();

        client.reconnect().await.unwrap();

        assert!(client.is_connected());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        let starts = sent_messages(&client.connector)
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::SessionStart { token } if token == "tok-9"))
            .count();
        assert_eq!(starts, 2);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn reconnect_without_credential_fails() {
        let (mut client, _events) = SessionClient::new(MockConnector::new(vec![]), fast_config());
        assert!(matches!(
            client.reconnect().await,
            Err(GameClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn dropping_client_tears_down_handles() {
        let connector = MockConnector::new(vec![vec![accepted()]]);
        let (mut client, _events) = SessionClient::new(connector, fast_config());
        client.connect(&Credential::new("t", "user-1")).await.unwrap();
        let handle = client.handle();
        let mut sub = handle.subscribe(MessageKind::MatchData).unwrap();

        drop(client);

        assert!(!handle.is_connected());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn config_defaults_and_clamping() {
        let config = ClientConfig::default();
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(
            ClientConfig::new()
                .with_event_channel_capacity(0)
                .event_channel_capacity,
            1
        );
    }
}
