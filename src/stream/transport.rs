//! One physical websocket per connection attempt.
//!
//! A transport never touches controller state. It reports what happened on the
//! socket through [`TransportEvents`], which stamps every report with the
//! generation of the attempt that opened it so the controller can drop
//! reports from superseded sockets.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::stream::client::RealtimeError;
use crate::stream::controller::Input;

/// Monotonic tag distinguishing connection attempts.
pub type Generation = u64;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Socket-level occurrence reported by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Frame(String),
    Close(Option<u16>),
    Error(String),
}

/// Callback sink handed to [`Transport::open`].
#[derive(Clone, Debug)]
pub struct TransportEvents {
    generation: Generation,
    tx: mpsc::UnboundedSender<Input>,
}

impl TransportEvents {
    pub(crate) fn new(generation: Generation, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn on_open(&self) {
        self.emit(TransportEvent::Open);
    }

    pub fn on_frame(&self, text: impl Into<String>) {
        self.emit(TransportEvent::Frame(text.into()));
    }

    pub fn on_close(&self, code: Option<u16>) {
        self.emit(TransportEvent::Close(code));
    }

    pub fn on_error(&self, error: impl Display) {
        self.emit(TransportEvent::Error(error.to_string()));
    }

    fn emit(&self, event: TransportEvent) {
        // The controller is gone when this fails; nothing is left to notify.
        let _ = self.tx.send(Input::Transport {
            generation: self.generation,
            event,
        });
    }
}

/// Owner's grip on an open transport.
///
/// Dropping the handle closes the transport.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            outbound,
            shutdown: Some(shutdown),
        }
    }

    /// Queues a text frame. Delivery failures surface as transport events.
    pub fn send(&self, text: String) {
        if self.outbound.send(text).is_err() {
            debug!(event = "transport_send_after_close");
        }
    }

    /// Tears the transport down. Idempotent.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens physical connections on behalf of the controller.
pub trait Transport: Send + Sync + 'static {
    /// Starts connecting to `url` without blocking and returns the handle
    /// for the new socket. Progress is reported through `events`.
    fn open(&self, url: &str, events: TransportEvents) -> TransportHandle;
}

/// Websocket transport backed by `tokio-tungstenite`.
#[derive(Clone, Default)]
pub struct WebSocketTransport {
    session_cookie: Option<SecretString>,
}

impl WebSocketTransport {
    pub fn new(session_cookie: Option<SecretString>) -> Self {
        Self { session_cookie }
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &str, events: TransportEvents) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let request = build_request(url, self.session_cookie.as_ref());

        tokio::spawn(async move {
            match request {
                Ok(request) => run_socket(request, outbound_rx, shutdown_rx, events).await,
                Err(err) => events.on_error(err),
            }
        });

        TransportHandle::new(outbound_tx, shutdown_tx)
    }
}

pub(crate) fn build_request(
    url: &str,
    session_cookie: Option<&SecretString>,
) -> Result<Request, RealtimeError> {
    let mut request = url.into_client_request()?;
    if let Some(cookie) = session_cookie {
        let mut value: HeaderValue = cookie.expose_secret().parse()?;
        value.set_sensitive(true);
        request.headers_mut().insert(COOKIE, value);
    }
    Ok(request)
}

async fn run_socket(
    request: Request,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: oneshot::Receiver<()>,
    events: TransportEvents,
) {
    let generation = events.generation();
    let mut socket = tokio::select! {
        _ = &mut shutdown_rx => {
            debug!(event = "transport_cancelled", generation);
            return;
        }
        result = connect_async(request) => match result {
            Ok((socket, _)) => socket,
            Err(err) => {
                events.on_error(err);
                return;
            }
        },
    };
    events.on_open();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let flush = async {
                    while let Ok(text) = outbound_rx.try_recv() {
                        if socket.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    let _ = socket.close(None).await;
                };
                let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;
                debug!(event = "transport_closed", generation);
                return;
            }
            maybe_outbound = outbound_rx.recv() => {
                let Some(text) = maybe_outbound else {
                    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, socket.close(None)).await;
                    return;
                };
                let outcome =
                    send_unless_shutdown(&mut socket, Message::Text(text), &mut shutdown_rx).await;
                match outcome {
                    SendOutcome::Sent => {}
                    SendOutcome::Failed(err) => {
                        events.on_error(err);
                        return;
                    }
                    SendOutcome::Shutdown => {
                        debug!(event = "transport_closed", generation, reason = "send stalled");
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => events.on_frame(text),
                    Some(Ok(Message::Ping(payload))) => {
                        let pong = Message::Pong(payload);
                        match send_unless_shutdown(&mut socket, pong, &mut shutdown_rx).await {
                            SendOutcome::Sent => {}
                            SendOutcome::Failed(err) => {
                                events.on_error(err);
                                return;
                            }
                            SendOutcome::Shutdown => {
                                debug!(event = "transport_closed", generation, reason = "send stalled");
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Binary(payload))) => {
                        debug!(
                            event = "binary_frame_dropped",
                            generation,
                            len = payload.len()
                        );
                    }
                    Some(Ok(Message::Close(frame))) => {
                        events.on_close(frame.map(|frame| u16::from(frame.code)));
                        return;
                    }
                    Some(Err(err)) => {
                        events.on_error(err);
                        return;
                    }
                    None => {
                        events.on_close(None);
                        return;
                    }
                }
            }
        }
    }
}

enum SendOutcome<E> {
    Sent,
    Failed(E),
    Shutdown,
}

/// Writes one frame, giving up as soon as shutdown is requested. A peer that
/// stops reading must not keep the socket alive past `close`.
async fn send_unless_shutdown<S>(
    sink: &mut S,
    message: Message,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> SendOutcome<S::Error>
where
    S: Sink<Message> + Unpin,
{
    tokio::select! {
        _ = shutdown_rx => SendOutcome::Shutdown,
        result = sink.send(message) => match result {
            Ok(()) => SendOutcome::Sent,
            Err(err) => SendOutcome::Failed(err),
        },
    }
}
