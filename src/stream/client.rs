//! Public handle for the realtime event connection.
//!
//! [`RealtimeClient`] owns a background controller task that keeps one logical
//! connection alive: it reconnects with backoff, replays the caller's
//! subscription after every reconnect and delivers server events to the
//! registered handlers.

use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::warn;

use crate::retry::{ReconnectPolicy, ReconnectScheduler};
use crate::stream::controller::{Command, Controller, ControllerSettings, Input};
use crate::stream::dispatch::{Dispatcher, Event, HandlerRegistry};
use crate::stream::proto::{DecodeError, PROTOCOL_VERSION};
use crate::stream::subscription::Identity;
use crate::stream::transport::{build_request, Transport, WebSocketTransport};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
    pub const SUBSCRIBE_KIND: &'static str = "feeds";
}

/// Connection settings for [`RealtimeClient`].
#[derive(Clone)]
pub struct RealtimeConfig {
    endpoint: String,
    session_cookie: Option<SecretString>,
    subscribe_kind: String,
    connect_timeout: Duration,
    reconnect_policy: ReconnectPolicy,
    dispatch_runtime: Option<Handle>,
}

impl RealtimeConfig {
    /// Creates a config for a socket endpoint such as
    /// `wss://host/socket.io/`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end().to_string(),
            session_cookie: None,
            subscribe_kind: RealtimeDefaults::SUBSCRIBE_KIND.to_string(),
            connect_timeout: RealtimeDefaults::CONNECT_TIMEOUT,
            reconnect_policy: ReconnectPolicy::default(),
            dispatch_runtime: None,
        }
    }

    /// Sends `cookie` as the `Cookie` header of the websocket upgrade.
    pub fn with_session_cookie(mut self, cookie: SecretString) -> Self {
        self.session_cookie = Some(cookie);
        self
    }

    /// Sets `<kind>` in the `subscribe:<kind>` replay event.
    pub fn with_subscribe_kind(mut self, kind: impl Into<String>) -> Self {
        self.subscribe_kind = kind.into();
        self
    }

    /// Time allowed between opening a socket and receiving the handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    /// Runs event handlers on `runtime` instead of the current runtime.
    pub fn with_dispatch_runtime(mut self, runtime: Handle) -> Self {
        self.dispatch_runtime = Some(runtime);
        self
    }

    /// Full socket URL with the protocol query parameters appended.
    pub fn socket_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}EIO={PROTOCOL_VERSION}&transport=websocket",
            self.endpoint
        )
    }

    fn validate(&self) -> Result<(), RealtimeError> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(RealtimeError::Config(format!(
                "endpoint must use ws:// or wss://, got {:?}",
                self.endpoint
            )));
        }
        if self.subscribe_kind.is_empty() {
            return Err(RealtimeError::Config(
                "subscribe kind must not be empty".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(RealtimeError::Config(
                "connect timeout must be > 0".to_string(),
            ));
        }
        build_request(&self.socket_url(), self.session_cookie.as_ref())?;
        Ok(())
    }
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("endpoint", &self.endpoint)
            .field("session_cookie", &self.session_cookie.as_ref().map(|_| "[redacted]"))
            .field("subscribe_kind", &self.subscribe_kind)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect_policy", &self.reconnect_policy)
            .finish()
    }
}

/// Externally visible connection status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnecting stopped after `attempts` consecutive failures. Calling
    /// [`RealtimeClient::connect`] starts over.
    GaveUp { attempts: u32 },
}

/// Handle to a realtime connection.
///
/// Every operation is fire-and-forget and is applied by the controller task in
/// call order. Dropping the handle disconnects.
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Input>,
    handlers: HandlerRegistry,
    status: watch::Receiver<ConnectionStatus>,
}

impl RealtimeClient {
    /// Creates a client backed by the websocket transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: RealtimeConfig) -> Result<Self, RealtimeError> {
        let transport = WebSocketTransport::new(config.session_cookie.clone());
        Self::with_transport(config, transport)
    }

    /// Creates a client that opens connections through `transport`.
    pub fn with_transport<T: Transport>(
        config: RealtimeConfig,
        transport: T,
    ) -> Result<Self, RealtimeError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|err| {
            RealtimeError::Config(format!("a tokio runtime is required: {err}"))
        })?;

        let handlers = HandlerRegistry::default();
        let dispatch_runtime = config.dispatch_runtime.clone().unwrap_or_else(|| runtime.clone());
        let dispatcher = Dispatcher::spawn(handlers.clone(), &dispatch_runtime);

        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);
        let settings = ControllerSettings {
            url: config.socket_url(),
            connect_timeout: config.connect_timeout,
            subscribe_kind: config.subscribe_kind.clone(),
            reconnect: ReconnectScheduler::new(config.reconnect_policy.clone()),
        };
        let controller = Controller::new(
            settings,
            Box::new(transport),
            inbox,
            commands.clone(),
            dispatcher,
            status_tx,
        );
        runtime.spawn(controller.run());

        Ok(Self {
            commands,
            handlers,
            status,
        })
    }

    /// Starts a logical session for `principal` following `topics`.
    ///
    /// Ignored while a connection attempt is already in flight or connected.
    pub fn connect<I, S>(&self, principal: impl Into<String>, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(Command::Connect(Identity::new(principal, topics)));
    }

    /// Ends the session; no reconnect is attempted afterwards.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Registers `handler` for `event`. Use [`crate::stream::dispatch::WILDCARD_EVENT`]
    /// to receive every event. Handlers run on the dispatch runtime, never on
    /// the connection task.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers.subscribe(event, std::sync::Arc::new(handler));
    }

    /// Removes every handler registered for `event`.
    pub fn unsubscribe(&self, event: &str) {
        self.handlers.unsubscribe(event);
    }

    /// Sends an application event. Dropped with a warning unless connected.
    pub fn emit<T: Serialize>(&self, event: impl Into<String>, payload: T) {
        let name = event.into();
        match serde_json::to_value(payload) {
            Ok(value) => self.send(Command::Emit {
                name,
                args: vec![value],
            }),
            Err(err) => {
                let error = RealtimeError::Json(err);
                warn!(event = "emit_rejected", name = %name, error = %error);
            }
        }
    }

    /// Whether the connection is currently established, as seen by the
    /// controller after every previously issued call.
    pub async fn connected(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::QueryConnected(reply_tx));
        reply_rx.await.unwrap_or(false)
    }

    /// Latest published status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(Input::Command(command)).is_err() {
            warn!(event = "command_dropped", reason = "controller stopped");
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Input::Command(Command::Shutdown));
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("status", &self.status())
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// Failure taxonomy for the realtime connection.
///
/// Only construction surfaces these as `Err`; at runtime they are logged and
/// folded into the reconnect path.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Malformed frame; dropped, connection stays up.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Socket-level failure reported by a transport.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport closed (code {code:?})")]
    TransportClosed { code: Option<u16> },

    #[error("server ended the session")]
    ServerDisconnect,

    #[error("no server ping within {0:?}")]
    KeepAliveTimeout(Duration),

    #[error("no handshake within {0:?}")]
    ConnectTimeout(Duration),

    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Call not valid in the current connection state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Session cookie could not be converted to a valid HTTP header value.
    #[error("invalid cookie header: {0}")]
    InvalidCookieHeader(#[from] InvalidHeaderValue),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Config(String),
}
