#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ably_realtime::protocol::{Action, ConnectionDetails, ProtocolMessage, flags};
use ably_realtime::transport::{
    Transport, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportParams,
};
use ably_realtime::{
    AuthProvider, BackoffRetryDelayCalculator, ClientOptions, Credentials, Error, ErrorInfo,
    Format, Realtime, RealtimeBuilder, TokenDetails,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

/// Hands every transport the client opens to the test as a [`MockSocket`].
#[derive(Clone)]
pub struct MockTransports {
    sockets: mpsc::UnboundedSender<MockSocket>,
}

/// Test-side view of the transports a client opens.
pub struct MockService {
    sockets: mpsc::UnboundedReceiver<MockSocket>,
}

impl MockTransports {
    pub fn new() -> (Self, MockService) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sockets: tx }, MockService { sockets: rx })
    }
}

struct MockTransport {
    frames: mpsc::UnboundedSender<ably_realtime::protocol::Frame>,
    closed: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn send(&mut self, frame: ably_realtime::protocol::Frame) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.frames.send(frame).is_ok()
    }

    fn close(&mut self, _code: u16, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl TransportFactory for MockTransports {
    fn open(
        &self,
        params: TransportParams,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let socket = MockSocket {
            format: params.format,
            params,
            events,
            frames: rx,
            closed: Arc::clone(&closed),
        };
        let _ = self.sockets.send(socket);
        Ok(Box::new(MockTransport { frames: tx, closed }))
    }
}

/// One transport as seen by the service.
pub struct MockSocket {
    pub params: TransportParams,
    format: Format,
    events: TransportEvents,
    frames: mpsc::UnboundedReceiver<ably_realtime::protocol::Frame>,
    closed: Arc<AtomicBool>,
}

impl MockService {
    pub async fn next_socket(&mut self) -> MockSocket {
        tokio::time::timeout(Duration::from_secs(600), self.sockets.recv())
            .await
            .expect("timed out waiting for the client to open a transport")
            .expect("client dropped its transport factory")
    }

    /// Accept the next transport and complete the handshake with CONNECTED.
    pub async fn accept(&mut self, connection_id: &str) -> MockSocket {
        let socket = self.next_socket().await;
        socket.open();
        socket.send(connected(connection_id, 0));
        socket
    }

    /// No transport was opened since the last call.
    pub fn no_new_socket(&mut self) -> bool {
        self.sockets.try_recv().is_err()
    }
}

impl MockSocket {
    pub fn open(&self) {
        self.events.emit(TransportEvent::Opened);
    }

    pub fn send(&self, msg: ProtocolMessage) {
        let frame = self.format.encode(&msg).expect("encode");
        self.events.emit(TransportEvent::Frame(frame));
    }

    /// Drop the socket from the service side.
    pub fn drop_connection(&self) {
        self.events.emit(TransportEvent::Closed {
            code: 1006,
            reason: "connection reset".into(),
            was_clean: false,
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next protocol message the client wrote to this socket.
    pub async fn recv(&mut self) -> ProtocolMessage {
        let frame = tokio::time::timeout(Duration::from_secs(600), self.frames.recv())
            .await
            .expect("timed out waiting for a frame from the client")
            .expect("client closed the transport");
        self.format.decode(&frame).expect("decode")
    }

    /// Next message with `action`, skipping anything else.
    pub async fn recv_action(&mut self, action: Action) -> ProtocolMessage {
        loop {
            let msg = self.recv().await;
            if msg.action == action {
                return msg;
            }
        }
    }

    /// Nothing has been written since the last read.
    pub fn nothing_sent(&mut self) -> bool {
        self.frames.try_recv().is_err()
    }

    /// Wait for ATTACH on `channel` and confirm it.
    pub async fn attach(&mut self, channel: &str, flags: i32) -> ProtocolMessage {
        let attach = self.recv_action(Action::Attach).await;
        assert_eq!(attach.channel.as_deref(), Some(channel));
        self.send(attached(channel, flags));
        attach
    }
}

// ---------------------------------------------------------------------------
// Protocol message builders
// ---------------------------------------------------------------------------

pub fn connected(connection_id: &str, flags: i32) -> ProtocolMessage {
    let key = format!("{connection_id}!key");
    ProtocolMessage {
        connection_id: Some(connection_id.into()),
        connection_key: Some(key.clone()),
        connection_details: Some(ConnectionDetails {
            connection_key: Some(key),
            connection_state_ttl: Some(120_000),
            ..Default::default()
        }),
        flags: (flags != 0).then_some(flags),
        ..ProtocolMessage::new(Action::Connected)
    }
}

pub fn resumed(connection_id: &str) -> ProtocolMessage {
    connected(connection_id, flags::RESUMED)
}

pub fn attached(channel: &str, flags: i32) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        channel_serial: Some(format!("{channel}-serial")),
        flags: (flags != 0).then_some(flags),
        ..ProtocolMessage::new(Action::Attached)
    }
}

pub fn detached(channel: &str, error: Option<ErrorInfo>) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.into()),
        error,
        ..ProtocolMessage::new(Action::Detached)
    }
}

pub fn ack(msg_serial: i64, count: i64) -> ProtocolMessage {
    ProtocolMessage {
        msg_serial: Some(msg_serial),
        count: Some(count),
        ..ProtocolMessage::new(Action::Ack)
    }
}

pub fn nack(msg_serial: i64, count: i64, error: ErrorInfo) -> ProtocolMessage {
    ProtocolMessage {
        msg_serial: Some(msg_serial),
        count: Some(count),
        error: Some(error),
        ..ProtocolMessage::new(Action::Nack)
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Hands out `token-1`, then `token-2`, `token-3`, ... on each renewal.
#[derive(Default)]
pub struct RenewingAuth {
    pub renewals: AtomicUsize,
}

#[async_trait]
impl AuthProvider for RenewingAuth {
    async fn current_credentials(&self) -> Result<Credentials, Error> {
        let n = self.renewals.load(Ordering::SeqCst) + 1;
        Ok(Credentials::Token(TokenDetails::from_token(format!(
            "token-{n}"
        ))))
    }

    async fn renew(&self) -> Result<Credentials, Error> {
        let n = self.renewals.fetch_add(1, Ordering::SeqCst) + 2;
        Ok(Credentials::Token(TokenDetails::from_token(format!(
            "token-{n}"
        ))))
    }
}

pub fn token_of(credentials: &Credentials) -> Option<&str> {
    match credentials {
        Credentials::Token(details) => Some(details.token.as_str()),
        Credentials::Key(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Client setup
// ---------------------------------------------------------------------------

pub fn test_options() -> ClientOptions {
    ClientOptions {
        client_id: Some("tester".into()),
        ..ClientOptions::with_key("appId.keyId:secret")
    }
}

/// Builder wired to in-memory transports with jitter-free retry delays.
pub fn builder(options: ClientOptions) -> (RealtimeBuilder, MockService) {
    let (transports, service) = MockTransports::new();
    let connect = BackoffRetryDelayCalculator::new(
        options.disconnected_retry_timeout,
        options.max_retry_delay,
    )
    .with_jitter(|| 1.0);
    let channel = BackoffRetryDelayCalculator::new(
        options.channel_retry_timeout,
        options.max_retry_delay,
    )
    .with_jitter(|| 1.0);
    let builder = Realtime::builder(options)
        .transport(transports)
        .connect_retry_delays(connect)
        .channel_retry_delays(channel);
    (builder, service)
}

pub fn client(options: ClientOptions) -> (Realtime, MockService) {
    let (builder, service) = builder(options);
    (builder.build().expect("client"), service)
}

/// Let the engine drain everything already sent to it.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
