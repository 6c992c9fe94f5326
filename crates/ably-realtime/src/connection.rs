//! Connection state machine and the engine task that owns all client state.
//!
//! Every handle talks to one [`Engine`] over a command channel. The engine
//! is the only place state changes: commands, transport events, auth
//! results and timer expiries are processed one at a time in
//! [`Engine::run`], so no locking is needed anywhere in the state machines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::{AuthProvider, Credentials};
use crate::channel::{Channel, ChannelId, ChannelSinks};
use crate::error::{Error, ErrorInfo, error_code};
use crate::options::{ChannelOptions, ClientOptions};
use crate::presence::SyncWaiter;
use crate::protocol::{Action, AuthDetails, Message, PresenceMessage, ProtocolMessage, flags};
use crate::queue::{Completion, QueuedMessage, SendQueue};
use crate::recovery::RecoveryKey;
use crate::retry::{RetryDelayCalculator, RetryState};
use crate::timers::{TimerKey, Timers};
use crate::transport::{
    Transport, TransportEvent, TransportEvents, TransportFactory, TransportId, TransportParams,
};

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
const NORMAL_CLOSURE: u16 = 1000;

// ---------------------------------------------------------------------------
// Public state types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether a publish made in this state may wait in the queue.
    pub(crate) fn queues_messages(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized
                | ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected
        )
    }

    fn retry_eligible(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Disconnected
        )
    }

    /// The error handed to operations rejected because of this state.
    pub(crate) fn error(self) -> ErrorInfo {
        match self {
            ConnectionState::Disconnected => {
                ErrorInfo::new(error_code::DISCONNECTED, Some(400), "connection disconnected")
            }
            ConnectionState::Suspended => {
                ErrorInfo::new(error_code::SUSPENDED, Some(400), "connection suspended")
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                ErrorInfo::new(error_code::CLOSED, Some(400), "connection closed")
            }
            ConnectionState::Failed => {
                ErrorInfo::new(error_code::FAILED, Some(400), "connection failed")
            }
            other => ErrorInfo::new(
                error_code::CHANNEL_INVALID_STATE,
                Some(400),
                format!("operation not permitted while connection is {other}"),
            ),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a [`ConnectionStateChange`] reports: a transition into a state, or
/// `Update` for a change of connection details without a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => ConnectionEvent::Initialized,
            ConnectionState::Connecting => ConnectionEvent::Connecting,
            ConnectionState::Connected => ConnectionEvent::Connected,
            ConnectionState::Disconnected => ConnectionEvent::Disconnected,
            ConnectionState::Suspended => ConnectionEvent::Suspended,
            ConnectionState::Closing => ConnectionEvent::Closing,
            ConnectionState::Closed => ConnectionEvent::Closed,
            ConnectionState::Failed => ConnectionEvent::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next connection attempt, for DISCONNECTED and SUSPENDED.
    pub retry_in: Option<Duration>,
}

/// Latest connection attributes, readable without a round trip to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ConnectionSnapshot {
    pub(crate) state: ConnectionState,
    pub(crate) id: Option<String>,
    pub(crate) key: Option<String>,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) serial: i64,
}

// ---------------------------------------------------------------------------
// Engine inputs
// ---------------------------------------------------------------------------

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ErrorInfo>>;

pub(crate) enum Command {
    Connect,
    Close,
    Ping(Reply<Duration>),
    RecoveryKey(oneshot::Sender<Option<String>>),
    RegisterChannel {
        name: String,
        options: ChannelOptions,
        sinks: ChannelSinks,
    },
    ReleaseChannel(String),
    Attach {
        channel: String,
        reply: Option<Reply<()>>,
    },
    Detach {
        channel: String,
        reply: Reply<()>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        completion: Completion,
    },
    Presence {
        channel: String,
        message: PresenceMessage,
        completion: Completion,
    },
    PresenceSync {
        channel: String,
        waiter: SyncWaiter,
    },
    PresenceMembers {
        channel: String,
        reply: Reply<Vec<PresenceMessage>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthPurpose {
    /// Credentials for a new transport.
    Connect,
    /// Fresh token for the live connection, sent in an AUTH message.
    Reauth,
}

struct AuthOutcome {
    attempt: u64,
    purpose: AuthPurpose,
    result: Result<Credentials, Error>,
}

struct ActiveTransport {
    id: TransportId,
    handle: Box<dyn Transport>,
    opened: bool,
}

struct PendingPing {
    started: Instant,
    reply: Reply<Duration>,
}

/// Everything needed to start an engine.
pub(crate) struct EngineConfig {
    pub(crate) options: Arc<ClientOptions>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    pub(crate) transports: Arc<dyn TransportFactory>,
    pub(crate) connect_delays: Arc<dyn RetryDelayCalculator>,
    pub(crate) channel_delays: Arc<dyn RetryDelayCalculator>,
}

/// The handle side of a spawned engine.
pub(crate) struct EngineHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) state: watch::Receiver<ConnectionSnapshot>,
    pub(crate) events: broadcast::Sender<ConnectionStateChange>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct Engine {
    pub(crate) options: Arc<ClientOptions>,
    pub(crate) auth: Arc<dyn AuthProvider>,
    transports: Arc<dyn TransportFactory>,
    pub(crate) channel_delays: Arc<dyn RetryDelayCalculator>,

    pub(crate) state: ConnectionState,
    pub(crate) id: Option<String>,
    key: Option<String>,
    serial: i64,
    error_reason: Option<ErrorInfo>,
    pub(crate) client_id: Option<String>,
    connection_state_ttl: Duration,
    max_idle_interval: Duration,
    pub(crate) max_message_size: usize,
    connection_lost_at: Option<Instant>,
    retry: RetryState<ConnectionState>,
    recover: Option<RecoveryKey>,
    pub(crate) recovered_channel_serials: HashMap<String, String>,

    transport: Option<ActiveTransport>,
    next_transport_id: u64,
    transport_tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,

    auth_attempt: u64,
    pub(crate) renewing_token: bool,
    auth_tx: mpsc::UnboundedSender<AuthOutcome>,
    auth_rx: mpsc::UnboundedReceiver<AuthOutcome>,

    pub(crate) queue: SendQueue,
    pub(crate) channels: Vec<Option<Channel>>,
    pub(crate) channel_index: HashMap<String, ChannelId>,
    pub(crate) timers: Timers,
    pings: HashMap<String, PendingPing>,
    deferred_pings: Vec<Reply<Duration>>,

    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    events_tx: broadcast::Sender<ConnectionStateChange>,
}

impl Engine {
    /// Start the engine task. Must be called from within a tokio runtime.
    pub(crate) fn spawn(config: EngineConfig) -> EngineHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot {
            serial: -1,
            ..Default::default()
        });
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();

        let recover = config.options.recover.as_deref().and_then(|s| {
            RecoveryKey::decode(s)
                .inspect_err(|e| tracing::warn!("Ignoring malformed recovery key: {e}"))
                .ok()
        });
        let recovered_channel_serials = recover
            .as_ref()
            .map(|rk| rk.channel_serials.clone())
            .unwrap_or_default();

        let engine = Engine {
            client_id: config.options.client_id.clone(),
            connection_state_ttl: config.options.connection_state_ttl,
            max_idle_interval: Duration::ZERO,
            max_message_size: config.options.max_message_size,
            retry: RetryState::new(config.connect_delays, ConnectionState::retry_eligible),
            options: config.options,
            auth: config.auth,
            transports: config.transports,
            channel_delays: config.channel_delays,
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            serial: -1,
            error_reason: None,
            connection_lost_at: None,
            recover,
            recovered_channel_serials,
            transport: None,
            next_transport_id: 0,
            transport_tx,
            transport_rx,
            auth_attempt: 0,
            renewing_token: false,
            auth_tx,
            auth_rx,
            queue: SendQueue::new(0),
            channels: Vec::new(),
            channel_index: HashMap::new(),
            timers: Timers::default(),
            pings: HashMap::new(),
            deferred_pings: Vec::new(),
            commands,
            state_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(engine.run());

        EngineHandle {
            commands: commands_tx,
            state: state_rx,
            events: events_tx,
        }
    }

    async fn run(mut self) {
        if self.options.auto_connect {
            self.connect();
        }
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            tracing::debug!("All client handles dropped, shutting down");
                            self.shutdown();
                            return;
                        }
                    }
                }
                Some((id, event)) = self.transport_rx.recv() => self.handle_transport_event(id, event),
                Some(outcome) = self.auth_rx.recv() => self.handle_auth_outcome(outcome),
                key = self.timers.expired() => self.handle_timer(key),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Close => self.close(),
            Command::Ping(reply) => self.ping(reply),
            Command::RecoveryKey(reply) => {
                let _ = reply.send(self.recovery_key());
            }
            Command::RegisterChannel {
                name,
                options,
                sinks,
            } => self.register_channel(name, options, sinks),
            Command::ReleaseChannel(name) => self.release_channel(&name),
            Command::Attach { channel, reply } => self.attach_channel(&channel, reply),
            Command::Detach { channel, reply } => self.detach_channel(&channel, reply),
            Command::Publish {
                channel,
                messages,
                completion,
            } => self.publish(&channel, messages, completion),
            Command::Presence {
                channel,
                message,
                completion,
            } => self.update_presence(&channel, message, completion),
            Command::PresenceSync { channel, waiter } => self.wait_for_sync(&channel, waiter),
            Command::PresenceMembers { channel, reply } => {
                let _ = reply.send(self.presence_members(&channel));
            }
        }
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn set_state(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        self.state = state;
        if reason.is_some() {
            self.error_reason = reason.clone();
        } else if state == ConnectionState::Connected {
            self.error_reason = None;
        }
        self.retry.on_transition(state);
        tracing::info!(
            from = %previous,
            to = %state,
            code = ?reason.as_ref().map(|e| e.code),
            "Connection state changed"
        );
        self.publish_snapshot();
        let _ = self.events_tx.send(ConnectionStateChange {
            previous,
            current: state,
            event: state.into(),
            reason,
            retry_in,
        });
    }

    fn publish_snapshot(&self) {
        self.state_tx.send_replace(ConnectionSnapshot {
            state: self.state,
            id: self.id.clone(),
            key: self.key.clone(),
            error_reason: self.error_reason.clone(),
            serial: self.serial,
        });
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                tracing::debug!(state = %self.state, "Already connecting or connected");
            }
            _ => self.begin_connecting(false),
        }
    }

    /// Drop any transport, enter CONNECTING and ask for credentials.
    fn begin_connecting(&mut self, renew_credentials: bool) {
        self.timers.cancel(&TimerKey::ConnectRetry);
        self.timers.cancel(&TimerKey::SuspendedRetry);
        self.timers.cancel(&TimerKey::CloseTimeout);
        self.timers.cancel(&TimerKey::Idle);
        self.drop_transport();
        if self.state != ConnectionState::Connecting {
            self.set_state(ConnectionState::Connecting, None, None);
        }
        self.timers.schedule(
            TimerKey::ConnectTimeout,
            self.options.realtime_request_timeout,
        );
        self.request_credentials(AuthPurpose::Connect, renew_credentials);
    }

    pub(crate) fn request_credentials(&mut self, purpose: AuthPurpose, renew: bool) {
        self.auth_attempt += 1;
        let attempt = self.auth_attempt;
        let auth = Arc::clone(&self.auth);
        let tx = self.auth_tx.clone();
        tracing::debug!(attempt, ?purpose, renew, "Requesting credentials");
        tokio::spawn(async move {
            let result = if renew {
                auth.renew().await
            } else {
                auth.current_credentials().await
            };
            let _ = tx.send(AuthOutcome {
                attempt,
                purpose,
                result,
            });
        });
    }

    fn open_transport(&mut self, credentials: Credentials) {
        self.next_transport_id += 1;
        let id = TransportId(self.next_transport_id);
        let recover = match (&self.key, &self.recover) {
            (None, Some(rk)) => Some(rk.connection_key.clone()),
            _ => None,
        };
        if let Some(renew_in) = credentials.token().and_then(|t| t.renew_in()) {
            self.timers.schedule(TimerKey::TokenRenewal, renew_in);
        }
        let params = TransportParams {
            host: self.options.realtime_host.clone(),
            port: self.options.port,
            tls: self.options.tls,
            format: self.options.format,
            credentials,
            resume: self.key.clone(),
            recover,
            client_id: self.options.client_id.clone(),
            echo: self.options.echo_messages,
            extra: self.options.transport_params.clone(),
        };
        tracing::info!(
            transport = id.0,
            resume = params.resume.is_some(),
            recover = params.recover.is_some(),
            "Opening transport"
        );
        let events = TransportEvents::new(id, self.transport_tx.clone());
        match self.transports.open(params, events) {
            Ok(handle) => {
                self.transport = Some(ActiveTransport {
                    id,
                    handle,
                    opened: false,
                });
            }
            Err(e) if e.is_fatal() => self.fail(e.to_error_info()),
            Err(e) => self.disconnected_or_suspended(Some(e.to_error_info())),
        }
    }

    fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            tracing::debug!(transport = transport.id.0, "Closing transport");
            transport.handle.close(NORMAL_CLOSURE, "client closed transport");
        }
    }

    /// DISCONNECTED, or SUSPENDED once the connection has been unavailable
    /// for longer than the connection state TTL.
    fn disconnected_or_suspended(&mut self, reason: Option<ErrorInfo>) {
        let now = Instant::now();
        let lost_at = *self.connection_lost_at.get_or_insert(now);
        if now.duration_since(lost_at) >= self.connection_state_ttl {
            self.enter_suspended(reason);
        } else {
            self.enter_disconnected(reason);
        }
    }

    fn enter_disconnected(&mut self, reason: Option<ErrorInfo>) {
        let previous = self.state;
        self.drop_transport();
        self.timers.cancel(&TimerKey::ConnectTimeout);
        self.timers.cancel(&TimerKey::Idle);
        self.renewing_token = false;
        let delay = if previous == ConnectionState::Connected {
            // A connection that was up gets one immediate reconnect.
            Duration::ZERO
        } else {
            let attempt = self.retry.add_retry_attempt();
            tracing::info!(
                attempt = %attempt.id,
                delay_ms = attempt.delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            attempt.delay
        };
        let reason = reason.unwrap_or_else(|| ConnectionState::Disconnected.error());
        self.set_state(ConnectionState::Disconnected, Some(reason), Some(delay));
        self.timers.schedule(TimerKey::ConnectRetry, delay);
    }

    fn enter_suspended(&mut self, reason: Option<ErrorInfo>) {
        self.drop_transport();
        self.timers.cancel(&TimerKey::ConnectTimeout);
        self.timers.cancel(&TimerKey::ConnectRetry);
        self.timers.cancel(&TimerKey::Idle);
        self.timers.cancel(&TimerKey::TokenRenewal);
        self.renewing_token = false;
        self.id = None;
        self.key = None;
        let reason = reason.unwrap_or_else(|| ConnectionState::Suspended.error());
        let delay = self.options.suspended_retry_timeout;
        tracing::warn!(
            queued = self.queue.queued_len(),
            "Connection suspended, failing queued messages"
        );
        self.set_state(ConnectionState::Suspended, Some(reason.clone()), Some(delay));
        self.timers.schedule(TimerKey::SuspendedRetry, delay);
        self.queue.fail_queued(&reason);
        self.fail_deferred_pings(&reason);
        self.channels_on_suspended(&reason);
    }

    fn close(&mut self) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                tracing::debug!(state = %self.state, "Close ignored");
            }
            ConnectionState::Connected => self.enter_closing(),
            ConnectionState::Connecting if self.transport.as_ref().is_some_and(|t| t.opened) => {
                self.enter_closing();
            }
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => self.enter_closed(None),
        }
    }

    fn enter_closing(&mut self) {
        self.timers.cancel(&TimerKey::ConnectTimeout);
        self.timers.cancel(&TimerKey::Idle);
        self.timers.cancel(&TimerKey::TokenRenewal);
        self.write(&ProtocolMessage::new(Action::Close));
        self.set_state(ConnectionState::Closing, None, None);
        self.timers.schedule(
            TimerKey::CloseTimeout,
            self.options.realtime_request_timeout,
        );
    }

    fn enter_closed(&mut self, reason: Option<ErrorInfo>) {
        self.timers.cancel_all();
        self.drop_transport();
        // Invalidates any credential request still in flight.
        self.auth_attempt += 1;
        self.renewing_token = false;
        self.id = None;
        self.key = None;
        self.connection_lost_at = None;
        let superseded = ErrorInfo::superseded_by_close();
        self.queue.fail_all(&superseded);
        self.fail_pings(&superseded);
        self.set_state(ConnectionState::Closed, reason, None);
        self.channels_on_closed(&superseded);
    }

    fn fail(&mut self, reason: ErrorInfo) {
        tracing::error!(code = reason.code, "Connection failed: {}", reason.message);
        self.timers.cancel_all();
        self.drop_transport();
        self.auth_attempt += 1;
        self.renewing_token = false;
        self.id = None;
        self.key = None;
        self.queue.fail_all(&reason);
        self.fail_pings(&reason);
        self.set_state(ConnectionState::Failed, Some(reason.clone()), None);
        self.channels_on_failed(&reason);
    }

    fn shutdown(&mut self) {
        if self.state == ConnectionState::Connected {
            self.write(&ProtocolMessage::new(Action::Close));
        }
        if !matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Failed
        ) {
            self.enter_closed(None);
        }
    }

    /// Renew the token and reconnect. A second token error while a renewal
    /// is already under way is not retried in a loop.
    fn reconnect_with_renewed_token(&mut self, reason: ErrorInfo) {
        if self.renewing_token {
            tracing::warn!(code = reason.code, "Token rejected again after renewal");
            self.disconnected_or_suspended(Some(reason));
            return;
        }
        tracing::info!(code = reason.code, "Token rejected, renewing and reconnecting");
        self.renewing_token = true;
        self.error_reason = Some(reason);
        self.begin_connecting(true);
    }

    // -----------------------------------------------------------------------
    // Auth
    // -----------------------------------------------------------------------

    fn handle_auth_outcome(&mut self, outcome: AuthOutcome) {
        if outcome.attempt != self.auth_attempt {
            tracing::debug!(attempt = outcome.attempt, "Ignoring stale credentials");
            return;
        }
        match (outcome.purpose, outcome.result) {
            (AuthPurpose::Connect, result) if self.state != ConnectionState::Connecting => {
                tracing::debug!(state = %self.state, ok = result.is_ok(), "Credentials no longer needed");
            }
            (AuthPurpose::Connect, Ok(credentials)) => self.open_transport(credentials),
            (AuthPurpose::Connect, Err(e)) => {
                let info = auth_failure(&e);
                tracing::warn!(code = info.code, "Auth provider failed: {e}");
                if info.status_code == Some(403) {
                    self.fail(info);
                } else {
                    self.disconnected_or_suspended(Some(info));
                }
            }
            (AuthPurpose::Reauth, Ok(credentials)) => {
                self.renewing_token = false;
                if self.state != ConnectionState::Connected {
                    return;
                }
                let Some(token) = credentials.token() else {
                    return;
                };
                tracing::info!("Sending renewed token");
                if let Some(renew_in) = token.renew_in() {
                    self.timers.schedule(TimerKey::TokenRenewal, renew_in);
                }
                let auth = ProtocolMessage {
                    auth: Some(AuthDetails {
                        access_token: token.token.clone(),
                    }),
                    ..ProtocolMessage::new(Action::Auth)
                };
                self.write(&auth);
                self.resend_pending_attaches();
            }
            (AuthPurpose::Reauth, Err(e)) => {
                self.renewing_token = false;
                let info = auth_failure(&e);
                if info.status_code == Some(403) {
                    self.fail(info);
                } else {
                    tracing::warn!(code = info.code, "Token renewal failed: {e}");
                    self.timers.schedule(
                        TimerKey::TokenRenewal,
                        self.options.disconnected_retry_timeout,
                    );
                }
            }
        }
    }

    /// In-band re-authentication on the live connection.
    pub(crate) fn reauthorize(&mut self) {
        if self.renewing_token || !self.auth.can_renew() {
            return;
        }
        self.renewing_token = true;
        self.request_credentials(AuthPurpose::Reauth, true);
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    fn handle_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        match self.transport.as_mut() {
            Some(active) if active.id == id => {
                if event == TransportEvent::Opened {
                    active.opened = true;
                }
            }
            _ => {
                tracing::trace!(transport = id.0, "Ignoring event from stale transport");
                return;
            }
        }
        match event {
            TransportEvent::Opened => {
                tracing::debug!(transport = id.0, "Transport open, awaiting CONNECTED");
            }
            TransportEvent::Frame(frame) => match self.options.format.decode(&frame) {
                Ok(msg) => self.handle_protocol_message(msg),
                Err(e) => tracing::warn!("Failed to decode frame: {e}"),
            },
            TransportEvent::Closed {
                code,
                reason,
                was_clean,
            } => {
                tracing::info!(code, was_clean, "Transport closed: {reason}");
                self.transport = None;
                self.on_transport_lost(ErrorInfo::new(
                    error_code::DISCONNECTED,
                    None,
                    format!("transport closed ({code}): {reason}"),
                ));
            }
            TransportEvent::Error(err) => {
                tracing::warn!("Transport error: {err}");
                self.transport = None;
                if err.is_fatal() {
                    self.fail(err.to_error_info());
                } else {
                    self.on_transport_lost(err.to_error_info());
                }
            }
        }
    }

    fn on_transport_lost(&mut self, reason: ErrorInfo) {
        match self.state {
            ConnectionState::Closing => self.enter_closed(None),
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.disconnected_or_suspended(Some(reason));
            }
            _ => {}
        }
    }

    /// Encode and write one message. Returns `false` when there is no
    /// transport to write to.
    pub(crate) fn write(&mut self, msg: &ProtocolMessage) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            tracing::debug!(action = ?msg.action, "No transport, message not written");
            return false;
        };
        match self.options.format.encode(msg) {
            Ok(frame) => {
                tracing::trace!(
                    action = ?msg.action,
                    channel = ?msg.channel,
                    msg_serial = ?msg.msg_serial,
                    "Sending protocol message"
                );
                transport.handle.send(frame)
            }
            Err(e) => {
                tracing::warn!(action = ?msg.action, "Failed to encode message: {e}");
                false
            }
        }
    }

    /// Assign a msgSerial and write.
    pub(crate) fn send_queued(&mut self, qm: QueuedMessage) {
        let wire = self.queue.send(qm);
        self.write(&wire);
    }

    // -----------------------------------------------------------------------
    // Inbound protocol messages
    // -----------------------------------------------------------------------

    fn handle_protocol_message(&mut self, msg: ProtocolMessage) {
        self.serial += 1;
        let serial = self.serial;
        self.state_tx.send_modify(|s| s.serial = serial);
        self.reset_idle_timer();
        tracing::trace!(action = ?msg.action, channel = ?msg.channel, "Received protocol message");

        match msg.action {
            Action::Heartbeat => self.on_heartbeat(&msg),
            Action::Connected => self.on_connected(msg),
            Action::Disconnect | Action::Disconnected => self.on_disconnected(msg),
            Action::Closed => self.on_closed(),
            Action::Error if msg.channel.is_none() => self.on_connection_error(msg),
            Action::Ack => self.queue.ack(
                msg.msg_serial.unwrap_or(0),
                msg.count.unwrap_or(1),
                msg.res,
            ),
            Action::Nack => self.on_nack(msg),
            Action::Auth => {
                tracing::info!("Service requested re-authentication");
                self.reauthorize();
            }
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync
            | Action::Error => self.on_channel_message(msg),
            other => tracing::debug!(action = ?other, "Ignoring protocol message"),
        }
    }

    fn on_connected(&mut self, msg: ProtocolMessage) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Closing => {
                // CLOSE is already on the wire; keep waiting for CLOSED.
                tracing::debug!(connection_id = ?msg.connection_id, "CONNECTED while closing");
                self.id = msg.connection_id.clone();
                self.key = msg
                    .connection_details
                    .and_then(|d| d.connection_key)
                    .or(msg.connection_key);
                return;
            }
            other => {
                tracing::debug!(state = %other, "Ignoring CONNECTED");
                return;
            }
        }
        self.timers.cancel(&TimerKey::ConnectTimeout);
        let details = msg.connection_details.clone().unwrap_or_default();
        let recovering = self.key.is_none() && self.recover.is_some();
        let continuous = self.id.is_some()
            && self.id == msg.connection_id
            && msg.has_flag(flags::RESUMED);

        self.id = msg.connection_id.clone();
        self.key = details.connection_key.clone().or(msg.connection_key.clone());
        if let Some(client_id) = details.client_id.clone() {
            self.client_id = Some(client_id);
        }
        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = Duration::from_millis(ttl.max(0) as u64);
        }
        if let Some(idle) = details.max_idle_interval {
            self.max_idle_interval = Duration::from_millis(idle.max(0) as u64);
        }
        if let Some(size) = details.max_message_size {
            self.max_message_size = usize::try_from(size).unwrap_or(self.max_message_size);
        }

        if self.state == ConnectionState::Connected {
            // Details refreshed on a live connection, e.g. after AUTH.
            tracing::info!(connection_id = ?self.id, "Connection details updated");
            if msg.error.is_some() {
                self.error_reason = msg.error.clone();
            }
            self.publish_snapshot();
            let _ = self.events_tx.send(ConnectionStateChange {
                previous: ConnectionState::Connected,
                current: ConnectionState::Connected,
                event: ConnectionEvent::Update,
                reason: msg.error,
                retry_in: None,
            });
            return;
        }

        let next_serial = if recovering {
            let recovered = self.recover.take();
            match (recovered, &msg.error) {
                (Some(rk), None) => {
                    tracing::info!(msg_serial = rk.msg_serial, "Connection recovered");
                    Some(rk.msg_serial)
                }
                (_, Some(err)) => {
                    tracing::warn!(code = err.code, "Unable to recover connection: {}", err.message);
                    self.recovered_channel_serials.clear();
                    Some(0)
                }
                (None, None) => Some(0),
            }
        } else if continuous {
            None
        } else {
            Some(0)
        };

        tracing::info!(
            connection_id = ?self.id,
            continuous,
            pending = self.queue.pending_len(),
            "Connected"
        );
        self.connection_lost_at = None;
        self.renewing_token = false;
        self.set_state(ConnectionState::Connected, msg.error, None);
        self.reset_idle_timer();
        if let Some(next_serial) = next_serial {
            self.queue.requeue_pending(next_serial);
        }
        self.channels_on_connected(continuous);
        for reply in std::mem::take(&mut self.deferred_pings) {
            self.send_ping(reply);
        }
    }

    fn on_disconnected(&mut self, msg: ProtocolMessage) {
        if self.state == ConnectionState::Closing {
            self.enter_closed(None);
            return;
        }
        let reason = msg.error;
        if let Some(err) = &reason
            && err.is_token_error()
            && self.auth.can_renew()
        {
            self.reconnect_with_renewed_token(err.clone());
            return;
        }
        self.drop_transport();
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.disconnected_or_suspended(reason);
        }
    }

    fn on_closed(&mut self) {
        if self.state != ConnectionState::Closing {
            tracing::info!(state = %self.state, "Service closed the connection");
        }
        self.enter_closed(None);
    }

    fn on_connection_error(&mut self, msg: ProtocolMessage) {
        let err = ErrorInfo::or_unknown(msg.error);
        if err.is_token_error() && self.auth.can_renew() {
            self.reconnect_with_renewed_token(err);
            return;
        }
        self.fail(err);
    }

    fn on_nack(&mut self, msg: ProtocolMessage) {
        let err = ErrorInfo::or_unknown(msg.error);
        tracing::warn!(
            msg_serial = ?msg.msg_serial,
            count = ?msg.count,
            code = err.code,
            "Messages rejected: {}",
            err.message
        );
        self.queue.nack(
            msg.msg_serial.unwrap_or(0),
            msg.count.unwrap_or(1),
            err.clone(),
        );
        if err.is_connection_error() {
            self.drop_transport();
            self.disconnected_or_suspended(Some(err));
        }
    }

    fn on_heartbeat(&mut self, msg: &ProtocolMessage) {
        let Some(id) = msg.id.as_deref() else {
            return;
        };
        if let Some(ping) = self.pings.remove(id) {
            self.timers.cancel(&TimerKey::Ping(id.to_string()));
            let _ = ping.reply.send(Ok(ping.started.elapsed()));
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn handle_timer(&mut self, key: TimerKey) {
        tracing::trace!(?key, "Timer expired");
        match key {
            TimerKey::ConnectTimeout if self.state == ConnectionState::Connecting => {
                tracing::warn!("Timed out waiting for CONNECTED");
                self.drop_transport();
                self.disconnected_or_suspended(Some(ErrorInfo::new(
                    error_code::TIMEOUT,
                    Some(408),
                    "connection attempt timed out",
                )));
            }
            TimerKey::ConnectRetry if self.state == ConnectionState::Disconnected => {
                self.begin_connecting(false);
            }
            TimerKey::SuspendedRetry if self.state == ConnectionState::Suspended => {
                self.begin_connecting(false);
            }
            TimerKey::CloseTimeout if self.state == ConnectionState::Closing => {
                tracing::warn!("Timed out waiting for CLOSED");
                self.enter_closed(None);
            }
            TimerKey::Idle if self.state == ConnectionState::Connected => {
                tracing::warn!("Heartbeat timeout");
                self.drop_transport();
                self.disconnected_or_suspended(Some(ErrorInfo::new(
                    error_code::DISCONNECTED,
                    Some(408),
                    "no activity from the service within the idle interval",
                )));
            }
            TimerKey::TokenRenewal if self.state == ConnectionState::Connected => {
                tracing::info!("Renewing token before expiry");
                self.reauthorize();
            }
            TimerKey::Ping(id) => {
                if let Some(ping) = self.pings.remove(&id) {
                    let _ = ping.reply.send(Err(ErrorInfo::new(
                        error_code::TIMEOUT,
                        Some(408),
                        "no heartbeat reply within the request timeout",
                    )));
                }
            }
            TimerKey::AttachTimeout(id) => self.on_attach_timeout(id),
            TimerKey::DetachTimeout(id) => self.on_detach_timeout(id),
            TimerKey::ChannelRetry(id) => self.on_channel_retry(id),
            other => tracing::debug!(?other, state = %self.state, "Timer no longer relevant"),
        }
    }

    fn reset_idle_timer(&mut self) {
        if self.state != ConnectionState::Connected || self.max_idle_interval.is_zero() {
            return;
        }
        self.timers.schedule(
            TimerKey::Idle,
            self.max_idle_interval + self.options.realtime_request_timeout,
        );
    }

    // -----------------------------------------------------------------------
    // Ping and recovery
    // -----------------------------------------------------------------------

    fn ping(&mut self, reply: Reply<Duration>) {
        match self.state {
            ConnectionState::Connected => self.send_ping(reply),
            ConnectionState::Initialized
            | ConnectionState::Connecting
            | ConnectionState::Disconnected => self.deferred_pings.push(reply),
            other => {
                let _ = reply.send(Err(other.error()));
            }
        }
    }

    fn send_ping(&mut self, reply: Reply<Duration>) {
        let id = Uuid::new_v4().to_string();
        let heartbeat = ProtocolMessage {
            id: Some(id.clone()),
            ..ProtocolMessage::new(Action::Heartbeat)
        };
        self.write(&heartbeat);
        self.timers.schedule(
            TimerKey::Ping(id.clone()),
            self.options.realtime_request_timeout,
        );
        self.pings.insert(
            id,
            PendingPing {
                started: Instant::now(),
                reply,
            },
        );
    }

    fn fail_deferred_pings(&mut self, error: &ErrorInfo) {
        for reply in self.deferred_pings.drain(..) {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn fail_pings(&mut self, error: &ErrorInfo) {
        self.fail_deferred_pings(error);
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(error.clone()));
        }
    }

    fn recovery_key(&self) -> Option<String> {
        let connection_key = self.key.clone()?;
        let channel_serials = self
            .channels
            .iter()
            .flatten()
            .filter_map(|ch| Some((ch.name.clone(), ch.serial.clone()?)))
            .collect();
        let key = RecoveryKey {
            connection_key,
            msg_serial: self.queue.msg_serial(),
            channel_serials,
        };
        key.encode()
            .inspect_err(|e| tracing::warn!("Failed to encode recovery key: {e}"))
            .ok()
    }
}

fn auth_failure(e: &Error) -> ErrorInfo {
    let info = e.to_error_info();
    if info.status_code == Some(403) || info.code == error_code::AUTH_PROVIDER_FAILED {
        return info;
    }
    ErrorInfo::new(
        error_code::AUTH_PROVIDER_FAILED,
        info.status_code,
        format!("auth provider failed: {}", info.message),
    )
}
