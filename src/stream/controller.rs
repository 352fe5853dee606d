//! Connection state machine.
//!
//! The controller runs as a single task that owns every piece of mutable
//! connection state. Caller commands, transport reports and timer expiries
//! are all processed one at a time from that task, so no two transitions can
//! interleave. Transport reports carry the generation of the attempt that
//! produced them and are discarded unless it matches the current one.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::retry::{ReconnectDecision, ReconnectScheduler};
use crate::stream::client::{ConnectionStatus, RealtimeError};
use crate::stream::dispatch::{Dispatcher, Event};
use crate::stream::keepalive::KeepAliveMonitor;
use crate::stream::proto::{Handshake, Message, Packet};
use crate::stream::subscription::{Identity, SubscriptionRegistry};
use crate::stream::timer::Deadline;
use crate::stream::transport::{
    Generation, Transport, TransportEvent, TransportEvents, TransportHandle,
};

/// Lifecycle of the logical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ConnectionState {
    Idle,
    /// Transport is being opened.
    Connecting,
    /// Socket is up; waiting for the server handshake.
    Open,
    Connected,
    Disconnecting,
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect(Identity),
    Disconnect,
    Emit { name: String, args: Vec<Value> },
    QueryConnected(oneshot::Sender<bool>),
    Shutdown,
}

/// Everything the controller task reacts to, in arrival order.
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Transport {
        generation: Generation,
        event: TransportEvent,
    },
}

pub(crate) struct ControllerSettings {
    pub(crate) url: String,
    pub(crate) connect_timeout: Duration,
    pub(crate) subscribe_kind: String,
    pub(crate) reconnect: ReconnectScheduler,
}

pub(crate) struct Controller {
    url: String,
    transport: Box<dyn Transport>,
    state: ConnectionState,
    generation: Generation,
    handshake: Handshake,
    subscriptions: SubscriptionRegistry,
    reconnect: ReconnectScheduler,
    keep_alive: KeepAliveMonitor,
    connect_timeout: Duration,
    connect_deadline: Deadline,
    reconnect_timer: Deadline,
    link: Option<TransportHandle>,
    inbox: mpsc::UnboundedReceiver<Input>,
    inbox_tx: mpsc::UnboundedSender<Input>,
    dispatcher: Dispatcher,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Controller {
    pub(crate) fn new(
        settings: ControllerSettings,
        transport: Box<dyn Transport>,
        inbox: mpsc::UnboundedReceiver<Input>,
        inbox_tx: mpsc::UnboundedSender<Input>,
        dispatcher: Dispatcher,
        status_tx: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            url: settings.url,
            transport,
            state: ConnectionState::Idle,
            generation: 0,
            handshake: Handshake::default(),
            subscriptions: SubscriptionRegistry::new(settings.subscribe_kind),
            reconnect: settings.reconnect,
            keep_alive: KeepAliveMonitor::new(),
            connect_timeout: settings.connect_timeout,
            connect_deadline: Deadline::default(),
            reconnect_timer: Deadline::default(),
            link: None,
            inbox,
            inbox_tx,
            dispatcher,
            status_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                maybe_input = self.inbox.recv() => {
                    let Some(input) = maybe_input else {
                        break;
                    };
                    if !self.handle_input(input) {
                        break;
                    }
                }
                _ = self.keep_alive.expired() => {
                    let window = self.keep_alive.window();
                    self.handle_disconnect(RealtimeError::KeepAliveTimeout(window));
                }
                _ = self.connect_deadline.expired() => {
                    let timeout = self.connect_timeout;
                    self.handle_disconnect(RealtimeError::ConnectTimeout(timeout));
                }
                _ = self.reconnect_timer.expired() => self.on_reconnect_due(),
            }
        }
        self.teardown();
        debug!(event = "controller_stopped");
    }

    /// Returns `false` once the controller should stop.
    fn handle_input(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Connect(identity)) => self.connect(identity),
            Input::Command(Command::Disconnect) => self.disconnect(),
            Input::Command(Command::Emit { name, args }) => self.emit(name, args),
            Input::Command(Command::QueryConnected(reply)) => {
                let _ = reply.send(self.state == ConnectionState::Connected);
            }
            Input::Command(Command::Shutdown) => {
                self.disconnect();
                return false;
            }
            Input::Transport { generation, event } => {
                if generation != self.generation {
                    trace!(
                        event = "stale_transport_event",
                        generation,
                        current = self.generation
                    );
                } else {
                    self.on_transport_event(event);
                }
            }
        }
        true
    }

    fn connect(&mut self, identity: Identity) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Connected => {
                warn!(
                    event = "connect_ignored",
                    state = ?self.state,
                    reason = "connection attempt already in flight"
                );
                return;
            }
            ConnectionState::Idle | ConnectionState::Disconnecting => {}
        }

        if self.reconnect_timer.is_armed() {
            debug!(event = "reconnect_preempted", attempt = self.reconnect.attempt_count());
        }
        self.reconnect_timer.cancel();
        self.reconnect.reset();
        self.subscriptions.remember(identity);
        self.open_transport();
    }

    fn disconnect(&mut self) {
        self.reconnect_timer.cancel();
        if self.state == ConnectionState::Connected {
            self.send(&Packet::Message(Message::Disconnect));
        }
        self.state = ConnectionState::Disconnecting;
        self.teardown();
        self.reconnect.reset();
        self.subscriptions.forget();
        self.state = ConnectionState::Idle;
        self.publish(ConnectionStatus::Disconnected);
        info!(event = "disconnected", generation = self.generation);
    }

    fn emit(&mut self, name: String, args: Vec<Value>) {
        if self.state != ConnectionState::Connected {
            let error = RealtimeError::InvalidState(format!(
                "cannot emit {name:?} while {:?}",
                self.state
            ));
            warn!(event = "emit_rejected", error = %error);
            return;
        }
        self.send(&Packet::Message(Message::event(name, args)));
    }

    fn open_transport(&mut self) {
        self.teardown();
        self.generation += 1;
        self.handshake = Handshake::default();
        self.state = ConnectionState::Connecting;
        self.connect_deadline.arm(self.connect_timeout);

        let events = TransportEvents::new(self.generation, self.inbox_tx.clone());
        self.link = Some(self.transport.open(&self.url, events));
        self.publish(ConnectionStatus::Connecting);
        info!(
            event = "connect_attempt",
            generation = self.generation,
            attempt = self.reconnect.attempt_count()
        );
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Open;
                }
                debug!(event = "transport_open", generation = self.generation);
            }
            TransportEvent::Frame(text) => match Packet::from_text(&text) {
                Ok(packet) => self.on_packet(packet),
                Err(err) => {
                    let error = RealtimeError::Decode(err);
                    warn!(event = "frame_dropped", error = %error, frame_len = text.len());
                }
            },
            TransportEvent::Close(code) => {
                self.handle_disconnect(RealtimeError::TransportClosed { code });
            }
            TransportEvent::Error(message) => {
                self.handle_disconnect(RealtimeError::Transport(message));
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Open(handshake) => match self.state {
                ConnectionState::Connecting | ConnectionState::Open => self.on_handshake(handshake),
                state => warn!(event = "unexpected_handshake", state = ?state),
            },
            Packet::Ping => {
                if self.state == ConnectionState::Connected {
                    self.send(&Packet::Pong);
                    self.keep_alive.on_ping();
                }
            }
            Packet::Close => self.handle_disconnect(RealtimeError::ServerDisconnect),
            Packet::Message(message) => self.on_message(message),
            Packet::Pong | Packet::Noop => trace!(event = "keepalive_noise"),
        }
    }

    fn on_handshake(&mut self, handshake: Handshake) {
        self.connect_deadline.cancel();
        self.keep_alive.start(&handshake);
        self.reconnect.reset();
        self.state = ConnectionState::Connected;
        self.send(&Packet::Message(Message::Connect(None)));
        info!(
            event = "connected",
            generation = self.generation,
            sid = %handshake.sid,
            ping_interval_ms = handshake.ping_interval_ms,
            ping_timeout_ms = handshake.ping_timeout_ms
        );
        self.handshake = handshake;
        self.publish(ConnectionStatus::Connected);
    }

    fn on_message(&mut self, message: Message) {
        if self.state != ConnectionState::Connected {
            debug!(event = "message_before_handshake", state = ?self.state);
            return;
        }
        match message {
            Message::Connect(_) => {
                if let Some(subscribe) = self.subscriptions.subscribe_message() {
                    self.send(&Packet::Message(subscribe));
                    info!(
                        event = "subscribed",
                        generation = self.generation,
                        topics = self
                            .subscriptions
                            .identity()
                            .map(|identity| identity.topics.len())
                            .unwrap_or(0)
                    );
                }
            }
            Message::Disconnect => self.handle_disconnect(RealtimeError::ServerDisconnect),
            Message::Event { name, args, .. } => {
                self.dispatcher.dispatch(Event { name, args });
            }
            Message::Ack { id, .. } => debug!(event = "ack_ignored", id = ?id),
            Message::Error(payload) => {
                warn!(event = "server_error", sid = %self.handshake.sid, payload = %payload);
            }
        }
    }

    /// Single funnel for every failure: tear down, then maybe retry.
    fn handle_disconnect(&mut self, reason: RealtimeError) {
        if self.state == ConnectionState::Idle && self.link.is_none() {
            return;
        }
        warn!(
            event = "connection_lost",
            generation = self.generation,
            state = ?self.state,
            error = %reason
        );
        self.state = ConnectionState::Disconnecting;
        self.teardown();
        self.state = ConnectionState::Idle;
        self.publish(ConnectionStatus::Disconnected);

        if self.subscriptions.identity().is_some() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_attempt() {
            ReconnectDecision::Retry { attempt, delay } => {
                self.reconnect_timer.arm(delay);
                info!(
                    event = "reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.reconnect_timer.cancel();
                let error = RealtimeError::ReconnectExhausted { attempts };
                warn!(event = "reconnect_gave_up", error = %error);
                self.publish(ConnectionStatus::GaveUp { attempts });
            }
        }
    }

    fn on_reconnect_due(&mut self) {
        if self.state != ConnectionState::Idle || self.subscriptions.identity().is_none() {
            return;
        }
        self.open_transport();
    }

    /// Cancels liveness timers and closes the live transport. Bumping the
    /// generation makes any report still in flight from it stale.
    fn teardown(&mut self) {
        self.keep_alive.cancel();
        self.connect_deadline.cancel();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.generation += 1;
    }

    fn send(&self, packet: &Packet) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        match packet.to_text() {
            Ok(text) => {
                trace!(event = "frame_out", generation = self.generation, frame = %text);
                link.send(text);
            }
            Err(err) => warn!(event = "encode_failed", error = %err),
        }
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::{sleep, timeout, Instant};

    use crate::stream::client::{ConnectionStatus, RealtimeClient, RealtimeConfig};
    use crate::stream::dispatch::Event;
    use crate::stream::transport::{Transport, TransportEvents, TransportHandle};

    const HANDSHAKE: &str = r#"0{"sid":"abc","pingInterval":25000,"pingTimeout":5000}"#;

    struct FakeLink {
        events: TransportEvents,
        outbound: mpsc::UnboundedReceiver<String>,
        shutdown: oneshot::Receiver<()>,
    }

    impl FakeLink {
        async fn expect_frame(&mut self) -> String {
            timeout(Duration::from_secs(1), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound frame")
                .expect("outbound channel closed")
        }

        fn assert_quiet(&mut self) {
            assert!(self.outbound.try_recv().is_err(), "unexpected outbound frame");
        }

        fn is_closed(&mut self) -> bool {
            !matches!(
                self.shutdown.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            )
        }

        /// Socket up + handshake + namespace ack, leaving the subscribe frame
        /// unread.
        async fn establish(&mut self) {
            self.events.on_open();
            self.events.on_frame(HANDSHAKE);
            assert_eq!(self.expect_frame().await, "40");
            self.events.on_frame("40");
        }
    }

    struct FakeTransport {
        links: mpsc::UnboundedSender<FakeLink>,
    }

    impl Transport for FakeTransport {
        fn open(&self, _url: &str, events: TransportEvents) -> TransportHandle {
            let (outbound_tx, outbound) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown) = oneshot::channel();
            let _ = self.links.send(FakeLink {
                events,
                outbound,
                shutdown,
            });
            TransportHandle::new(outbound_tx, shutdown_tx)
        }
    }

    fn client() -> (RealtimeClient, mpsc::UnboundedReceiver<FakeLink>) {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let config = RealtimeConfig::new("wss://realtime.example/socket.io/");
        let client = RealtimeClient::with_transport(config, FakeTransport { links: links_tx })
            .expect("client");
        (client, links_rx)
    }

    async fn next_link(links: &mut mpsc::UnboundedReceiver<FakeLink>) -> FakeLink {
        timeout(Duration::from_secs(120), links.recv())
            .await
            .expect("timed out waiting for transport open")
            .expect("transport channel closed")
    }

    fn payload_sink(client: &RealtimeClient, name: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        client.subscribe(name, move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_subscribe_and_event_delivery() {
        let (client, mut links) = client();
        let mut stories = payload_sink(&client, "story:new");
        client.connect("bob", ["10"]);

        let mut link = next_link(&mut links).await;
        link.events.on_open();
        link.events.on_frame(HANDSHAKE);
        assert_eq!(link.expect_frame().await, "40");
        assert!(client.connected().await);

        link.events.on_frame("40");
        assert_eq!(
            link.expect_frame().await,
            r#"42["subscribe:feeds",["10"],"bob"]"#
        );

        link.events.on_frame(r#"42["story:new",{"id":42}]"#);
        let event = timeout(Duration::from_secs(1), stories.recv())
            .await
            .expect("story delivered")
            .expect("handler channel open");
        assert_eq!(event.payload(), &json!({"id": 42}));

        assert!(client.connected().await);
        sleep(Duration::from_millis(10)).await;
        assert!(stories.try_recv().is_err(), "delivered more than once");
    }

    #[tokio::test(start_paused = true)]
    async fn wildcard_handlers_see_every_event_name() {
        let (client, mut links) = client();
        let mut everything = payload_sink(&client, "*");
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;

        link.events.on_frame(r#"42["feed:update","10"]"#);
        link.events.on_frame(r#"42["story:new",{"id":1}]"#);
        let first = everything.recv().await.expect("first event");
        let second = everything.recv().await.expect("second event");
        assert_eq!(first.name, "feed:update");
        assert_eq!(first.payload(), &json!("10"));
        assert_eq!(second.name, "story:new");
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_connects_open_a_single_transport() {
        let (client, mut links) = client();
        for _ in 0..5 {
            client.connect("bob", ["10"]);
        }
        let mut link = next_link(&mut links).await;
        assert!(!client.connected().await);
        assert!(links.try_recv().is_err());

        link.establish().await;
        for _ in 0..5 {
            client.connect("someone-else", ["99"]);
        }
        assert!(client.connected().await);
        assert!(links.try_recv().is_err());
        assert!(!link.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn pings_keep_the_link_alive_and_silence_kills_it() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;

        for _ in 0..4 {
            sleep(Duration::from_secs(25)).await;
            link.events.on_frame("2");
            assert_eq!(link.expect_frame().await, "3");
        }
        assert!(client.connected().await);

        let silent_since = Instant::now();
        let next = next_link(&mut links).await;
        // 30s of silence, then reconnect attempt 1 after 2s.
        assert_eq!(silent_since.elapsed().as_secs(), 32);
        assert!(link.is_closed());
        assert!(next.events.generation() > link.events.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_replayed_after_reconnect() {
        let (client, mut links) = client();
        client.connect("alice", ["1", "2", "3"]);
        let mut first = next_link(&mut links).await;
        first.establish().await;
        let original = first.expect_frame().await;
        assert_eq!(original, r#"42["subscribe:feeds",["1","2","3"],"alice"]"#);

        first.events.on_close(Some(1006));
        let mut second = next_link(&mut links).await;
        second.establish().await;
        assert_eq!(second.expect_frame().await, original);
        assert!(client.connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_callbacks_never_touch_the_new_connection() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let mut first = next_link(&mut links).await;
        first.establish().await;
        first.expect_frame().await;

        first.events.on_error("connection reset");
        let mut second = next_link(&mut links).await;
        second.establish().await;
        second.expect_frame().await;

        first.events.on_close(None);
        first.events.on_error("late failure");
        first.events.on_frame(HANDSHAKE);
        first.events.on_frame("1");

        assert!(client.connected().await);
        assert!(!second.is_closed());
        second.assert_quiet();
        // Well inside the 30s keep-alive window of the second link.
        assert!(timeout(Duration::from_secs(20), links.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_gives_up_after_ten_attempts() {
        let (client, mut links) = client();
        let mut status = client.status_receiver();
        client.connect("bob", ["10"]);

        let started = Instant::now();
        let mut last_opened = started;
        let mut opened = 0;
        while let Ok(Some(link)) = timeout(Duration::from_secs(120), links.recv()).await {
            opened += 1;
            last_opened = Instant::now();
            link.events.on_error("refused");
        }
        assert_eq!(opened, 11);
        // 2 + 4 + ... + 20 seconds of backoff between the 11 attempts.
        assert_eq!((last_opened - started).as_secs(), 110);

        status
            .wait_for(|status| matches!(status, ConnectionStatus::GaveUp { .. }))
            .await
            .expect("status channel open");
        assert_eq!(client.status(), ConnectionStatus::GaveUp { attempts: 10 });

        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        assert!(client.connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connection_resets_the_backoff() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let link = next_link(&mut links).await;
        link.events.on_error("refused");
        let link = next_link(&mut links).await;
        link.events.on_error("refused");

        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;
        link.events.on_close(None);

        let dropped_at = Instant::now();
        next_link(&mut links).await;
        assert_eq!(dropped_at.elapsed().as_secs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_only_reaches_the_wire_while_connected() {
        let (client, mut links) = client();
        client.emit("mark_read", json!({"story": "a"}));
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;

        client.emit("mark_read", json!({"story": "b"}));
        assert!(!client.connected().await);
        link.assert_quiet();

        link.establish().await;
        link.expect_frame().await;
        client.emit("mark_read", json!({"story": "c"}));
        assert_eq!(
            link.expect_frame().await,
            r#"42["mark_read",{"story":"c"}]"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_everything() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;

        client.disconnect();
        assert!(!client.connected().await);
        assert_eq!(link.expect_frame().await, "41");
        assert!(link.is_closed());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);

        link.events.on_close(None);
        assert!(timeout(Duration::from_secs(300), links.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_client_disconnects_and_stops_the_controller() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;

        drop(client);
        assert_eq!(link.expect_frame().await, "41");
        // The controller owns the transport, so the link channel only closes
        // once the task has exited.
        let stopped = timeout(Duration::from_secs(1), links.recv())
            .await
            .expect("controller still running after drop");
        assert!(stopped.is_none());
        assert!(link.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_stops_the_pending_retry() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let link = next_link(&mut links).await;
        link.events.on_error("refused");
        assert!(!client.connected().await);

        client.disconnect();
        assert!(timeout(Duration::from_secs(300), links.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handshake_times_out_the_attempt() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.events.on_open();

        let opened_at = Instant::now();
        next_link(&mut links).await;
        // 20s connect timeout + 2s backoff.
        assert_eq!(opened_at.elapsed().as_secs(), 22);
        assert!(link.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_and_server_errors_are_not_fatal() {
        let (client, mut links) = client();
        let mut stories = payload_sink(&client, "story:new");
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;

        link.events.on_frame("9garbage");
        link.events.on_frame(r#"42{"not":"an array"}"#);
        link.events.on_frame(r#"44{"message":"subscription pending"}"#);
        link.events.on_frame(r#"42["story:new",{"id":7}]"#);

        assert!(client.connected().await);
        assert!(!link.is_closed());
        let event = stories.recv().await.expect("event after garbage");
        assert_eq!(event.payload(), &json!({"id": 7}));
    }

    #[tokio::test(start_paused = true)]
    async fn server_initiated_disconnect_triggers_reconnect() {
        let (client, mut links) = client();
        client.connect("bob", ["10"]);
        let mut link = next_link(&mut links).await;
        link.establish().await;
        link.expect_frame().await;

        link.events.on_frame("41");
        assert!(!client.connected().await);
        assert!(link.is_closed());
        let mut next = next_link(&mut links).await;
        next.establish().await;
        assert!(client.connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn handlers_survive_reconnects_and_unsubscribe_stops_delivery() {
        let (client, mut links) = client();
        let (tx, mut received) = mpsc::unbounded_channel::<Value>();
        client.subscribe("story:new", move |event: &Event| {
            let _ = tx.send(event.payload().clone());
        });
        client.connect("bob", ["10"]);

        let mut first = next_link(&mut links).await;
        first.establish().await;
        first.expect_frame().await;
        first.events.on_close(None);

        let mut second = next_link(&mut links).await;
        second.establish().await;
        second.expect_frame().await;
        second.events.on_frame(r#"42["story:new",1]"#);
        assert_eq!(received.recv().await, Some(json!(1)));

        client.unsubscribe("story:new");
        second.events.on_frame(r#"42["story:new",2]"#);
        assert!(client.connected().await);
        sleep(Duration::from_millis(10)).await;
        assert!(received.try_recv().is_err());
    }
}
