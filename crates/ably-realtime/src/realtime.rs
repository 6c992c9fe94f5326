//! The public face of the client: cheap, cloneable handles that talk to the
//! engine task through commands and observe it through watch and broadcast
//! channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::{ApiKey, AuthProvider, StaticToken, TokenDetails};
use crate::channel::{ChannelEvent, ChannelSinks, ChannelSnapshot, ChannelState, ChannelStateChange};
use crate::connection::{
    Command, ConnectionEvent, ConnectionSnapshot, ConnectionState, ConnectionStateChange, Engine,
    EngineConfig, Reply,
};
use crate::error::{Error, ErrorInfo, error_code};
use crate::options::{ChannelOptions, ClientOptions};
use crate::protocol::{Message, PresenceAction, PresenceMessage, PublishResult};
use crate::queue::{AckResult, Completion};
use crate::retry::{BackoffRetryDelayCalculator, RetryDelayCalculator};
use crate::transport::{TransportFactory, WebSocketTransportFactory};

/// A realtime client.
///
/// Creating one spawns the engine task on the current tokio runtime; the
/// connection opens immediately unless `auto_connect` is off. Clones share
/// the same connection.
#[derive(Clone)]
pub struct Realtime {
    options: Arc<ClientOptions>,
    connection: Connection,
    channels: Channels,
}

impl Realtime {
    /// Client authenticating with `options.key` or `options.token`.
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        Self::builder(options).build()
    }

    pub fn builder(options: ClientOptions) -> RealtimeBuilder {
        RealtimeBuilder {
            options,
            auth: None,
            transports: None,
            connect_delays: None,
            channel_delays: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Shorthand for `connection().connect()`.
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Shorthand for `connection().close()`.
    pub fn close(&self) {
        self.connection.close();
    }
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("state", &self.connection.state())
            .finish_non_exhaustive()
    }
}

/// Overrides for the pieces the engine is built from.
pub struct RealtimeBuilder {
    options: ClientOptions,
    auth: Option<Arc<dyn AuthProvider>>,
    transports: Option<Arc<dyn TransportFactory>>,
    connect_delays: Option<Arc<dyn RetryDelayCalculator>>,
    channel_delays: Option<Arc<dyn RetryDelayCalculator>>,
}

impl RealtimeBuilder {
    /// Authenticate through `auth` instead of the key or token in the options.
    pub fn auth(mut self, auth: impl AuthProvider + 'static) -> Self {
        self.auth = Some(Arc::new(auth));
        self
    }

    pub fn transport(mut self, transports: impl TransportFactory + 'static) -> Self {
        self.transports = Some(Arc::new(transports));
        self
    }

    /// Delays between connection attempts while DISCONNECTED.
    pub fn connect_retry_delays(mut self, delays: impl RetryDelayCalculator + 'static) -> Self {
        self.connect_delays = Some(Arc::new(delays));
        self
    }

    /// Delays between reattach attempts of a SUSPENDED channel.
    pub fn channel_retry_delays(mut self, delays: impl RetryDelayCalculator + 'static) -> Self {
        self.channel_delays = Some(Arc::new(delays));
        self
    }

    pub fn build(self) -> Result<Realtime, Error> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ErrorInfo::new(
                error_code::BAD_REQUEST,
                Some(400),
                "a realtime client must be created inside a tokio runtime",
            )
            .into());
        }
        let auth = match self.auth {
            Some(auth) => auth,
            None => default_auth(&self.options)?,
        };
        let options = Arc::new(self.options);
        let connect_delays = self.connect_delays.unwrap_or_else(|| {
            Arc::new(BackoffRetryDelayCalculator::new(
                options.disconnected_retry_timeout,
                options.max_retry_delay,
            ))
        });
        let channel_delays = self.channel_delays.unwrap_or_else(|| {
            Arc::new(BackoffRetryDelayCalculator::new(
                options.channel_retry_timeout,
                options.max_retry_delay,
            ))
        });
        let transports = self
            .transports
            .unwrap_or_else(|| Arc::new(WebSocketTransportFactory::default()));

        let engine = Engine::spawn(EngineConfig {
            options: Arc::clone(&options),
            auth,
            transports,
            connect_delays,
            channel_delays,
        });

        Ok(Realtime {
            options,
            connection: Connection {
                commands: engine.commands.clone(),
                state: engine.state,
                events: engine.events,
            },
            channels: Channels {
                commands: engine.commands,
                registry: Arc::default(),
            },
        })
    }
}

fn default_auth(options: &ClientOptions) -> Result<Arc<dyn AuthProvider>, Error> {
    if let Some(key) = &options.key {
        return Ok(Arc::new(ApiKey(key.clone())));
    }
    if let Some(token) = &options.token {
        return Ok(Arc::new(StaticToken(TokenDetails::from_token(token.clone()))));
    }
    Err(ErrorInfo::new(
        error_code::BAD_REQUEST,
        Some(400),
        "no means of authentication: set a key, a token or an auth provider",
    )
    .into())
}

/// Send a command carrying a reply slot and wait for the engine's answer.
async fn request<T>(
    commands: &mpsc::UnboundedSender<Command>,
    command: impl FnOnce(Reply<T>) -> Command,
) -> Result<T, Error> {
    let (tx, rx) = oneshot::channel();
    commands.send(command(tx)).map_err(|_| Error::Closed)?;
    Ok(rx.await.map_err(|_| Error::Closed)??)
}

/// Run `listener` on a background task for every event `filter` accepts.
///
/// The task ends when the event source goes away; abort the returned handle
/// to stop listening earlier.
fn spawn_listener<E, P, F>(mut rx: broadcast::Receiver<E>, filter: P, mut listener: F) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    P: Fn(&E) -> bool + Send + 'static,
    F: FnMut(E) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if filter(&event) => listener(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Listener fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionSnapshot>,
    events: broadcast::Sender<ConnectionStateChange>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().state
    }

    /// The error behind the most recent state change, if any.
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.state.borrow().error_reason.clone()
    }

    /// Public connection id assigned by the service.
    pub fn id(&self) -> Option<String> {
        self.state.borrow().id.clone()
    }

    /// Private connection key, used to resume.
    pub fn key(&self) -> Option<String> {
        self.state.borrow().key.clone()
    }

    /// Serial of the last message received on this connection, `-1` before
    /// the first one.
    pub fn serial(&self) -> i64 {
        self.state.borrow().serial
    }

    /// Open the connection. A no-op while already connecting or connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the connection gracefully. Pending and queued messages fail.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Round trip time of a HEARTBEAT exchange.
    pub async fn ping(&self) -> Result<Duration, Error> {
        request(&self.commands, Command::Ping).await
    }

    /// Serialized [`RecoveryKey`](crate::RecoveryKey) for this connection, to
    /// be passed as `recover` to a new client. `None` when there is nothing
    /// to recover.
    pub async fn recovery_key(&self) -> Result<Option<String>, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RecoveryKey(tx))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.events.subscribe()
    }

    /// Call `listener` for every state change, or only those matching `event`.
    pub fn on<F>(&self, event: Option<ConnectionEvent>, listener: F) -> JoinHandle<()>
    where
        F: FnMut(ConnectionStateChange) + Send + 'static,
    {
        spawn_listener(
            self.events.subscribe(),
            move |change: &ConnectionStateChange| event.is_none_or(|e| e == change.event),
            listener,
        )
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<(), Error> {
        let mut rx = self.state.clone();
        rx.wait_for(|snapshot| snapshot.state == state)
            .await
            .map(|_| ())
            .map_err(|_| Error::Closed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.state.borrow();
        f.debug_struct("Connection")
            .field("state", &snapshot.state)
            .field("id", &snapshot.id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// The channel registry: one handle per name for the client's lifetime.
#[derive(Clone)]
pub struct Channels {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<Mutex<HashMap<String, RealtimeChannel>>>,
}

impl Channels {
    pub fn get(&self, name: &str) -> RealtimeChannel {
        self.get_with_options(name, ChannelOptions::default())
    }

    /// Get or create a channel. Options only apply when the channel is
    /// created; an existing handle is returned unchanged.
    pub fn get_with_options(&self, name: &str, options: ChannelOptions) -> RealtimeChannel {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = registry.get(name) {
            return channel.clone();
        }
        let (sinks, state) = ChannelSinks::new();
        let channel = RealtimeChannel {
            inner: Arc::new(ChannelHandle {
                name: name.to_string(),
                commands: self.commands.clone(),
                state,
                events: sinks.events.clone(),
                messages: sinks.messages.clone(),
                presence: sinks.presence.clone(),
            }),
        };
        let _ = self.commands.send(Command::RegisterChannel {
            name: name.to_string(),
            options,
            sinks,
        });
        registry.insert(name.to_string(), channel.clone());
        channel
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Names of every channel currently in the registry.
    pub fn names(&self) -> Vec<String> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Remove a channel. It is detached if attached and every pending
    /// operation on it fails; existing handles stop receiving anything.
    pub fn release(&self, name: &str) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if registry.remove(name).is_some() {
            let _ = self.commands.send(Command::ReleaseChannel(name.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// RealtimeChannel
// ---------------------------------------------------------------------------

struct ChannelHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelSnapshot>,
    events: broadcast::Sender<ChannelStateChange>,
    messages: broadcast::Sender<Message>,
    presence: broadcast::Sender<PresenceMessage>,
}

#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelHandle>,
}

impl RealtimeChannel {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().state
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.state.borrow().error_reason.clone()
    }

    /// Whether the last attachment continued the previous one without loss.
    pub fn resumed(&self) -> bool {
        self.inner.state.borrow().resumed
    }

    /// Channel serial reported in the last ATTACHED.
    pub fn attach_serial(&self) -> Option<String> {
        self.inner.state.borrow().attach_serial.clone()
    }

    /// Attach and wait for the service to confirm.
    pub async fn attach(&self) -> Result<(), Error> {
        let channel = self.inner.name.clone();
        request(&self.inner.commands, |reply| Command::Attach {
            channel,
            reply: Some(reply),
        })
        .await
    }

    pub async fn detach(&self) -> Result<(), Error> {
        let channel = self.inner.name.clone();
        request(&self.inner.commands, |reply| Command::Detach { channel, reply }).await
    }

    /// Publish a single message and wait for the acknowledgement.
    pub async fn publish(
        &self,
        name: impl Into<String>,
        data: impl Into<serde_json::Value>,
    ) -> Result<PublishResult, Error> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    /// Publish messages in one ProtocolMessage and wait for the
    /// acknowledgement.
    pub async fn publish_messages(&self, messages: Vec<Message>) -> Result<PublishResult, Error> {
        self.publish_tracked(messages)?.acked().await
    }

    /// Publish without waiting; the returned [`PendingPublish`] reports when
    /// the messages were written and when they were acknowledged.
    pub fn publish_tracked(&self, messages: Vec<Message>) -> Result<PendingPublish, Error> {
        let (sent_tx, sent_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Publish {
                channel: self.inner.name.clone(),
                messages,
                completion: Completion {
                    sent: Some(sent_tx),
                    ack: Some(ack_tx),
                },
            })
            .map_err(|_| Error::Closed)?;
        Ok(PendingPublish {
            sent: Some(sent_rx),
            ack: ack_rx,
        })
    }

    /// Receive every message on this channel. Attaches the channel if it is
    /// not already attaching or attached.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        let rx = self.inner.messages.subscribe();
        self.attach_in_background();
        rx
    }

    /// Call `listener` for each message, or only those named `name`.
    /// Attaches like [`subscribe`](Self::subscribe).
    pub fn on_message<F>(&self, name: Option<&str>, listener: F) -> JoinHandle<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let name = name.map(str::to_string);
        let handle = spawn_listener(
            self.inner.messages.subscribe(),
            move |msg: &Message| name.is_none() || msg.name == name,
            listener,
        );
        self.attach_in_background();
        handle
    }

    pub fn state_changes(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.inner.events.subscribe()
    }

    /// Call `listener` for every state change, or only those matching `event`.
    pub fn on<F>(&self, event: Option<ChannelEvent>, listener: F) -> JoinHandle<()>
    where
        F: FnMut(ChannelStateChange) + Send + 'static,
    {
        spawn_listener(
            self.inner.events.subscribe(),
            move |change: &ChannelStateChange| event.is_none_or(|e| e == change.event),
            listener,
        )
    }

    pub async fn wait_for(&self, state: ChannelState) -> Result<(), Error> {
        let mut rx = self.inner.state.clone();
        rx.wait_for(|snapshot| snapshot.state == state)
            .await
            .map(|_| ())
            .map_err(|_| Error::Closed)
    }

    pub fn presence(&self) -> RealtimePresence {
        RealtimePresence {
            channel: self.clone(),
        }
    }

    fn attach_in_background(&self) {
        let state = self.state();
        if !matches!(state, ChannelState::Attaching | ChannelState::Attached) {
            let _ = self.inner.commands.send(Command::Attach {
                channel: self.inner.name.clone(),
                reply: None,
            });
        }
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A publish in flight.
#[derive(Debug)]
pub struct PendingPublish {
    sent: Option<oneshot::Receiver<()>>,
    ack: oneshot::Receiver<AckResult>,
}

impl PendingPublish {
    /// Resolves once the messages have been written to a transport. Returns
    /// `false` if they failed before ever being written.
    pub async fn sent(&mut self) -> bool {
        match self.sent.take() {
            Some(rx) => rx.await.is_ok(),
            None => true,
        }
    }

    /// Resolves with the service's ACK or NACK.
    pub async fn acked(self) -> Result<PublishResult, Error> {
        Ok(self.ack.await.map_err(|_| Error::Closed)??)
    }
}

// ---------------------------------------------------------------------------
// RealtimePresence
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RealtimePresence {
    channel: RealtimeChannel,
}

impl RealtimePresence {
    /// Enter the presence set as the connection's client id.
    pub async fn enter(&self, data: Option<serde_json::Value>) -> Result<(), Error> {
        self.send(PresenceAction::Enter, None, data).await
    }

    pub async fn update(&self, data: Option<serde_json::Value>) -> Result<(), Error> {
        self.send(PresenceAction::Update, None, data).await
    }

    pub async fn leave(&self, data: Option<serde_json::Value>) -> Result<(), Error> {
        self.send(PresenceAction::Leave, None, data).await
    }

    /// Enter on behalf of another client id (requires a wildcard client id).
    pub async fn enter_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.send(PresenceAction::Enter, Some(client_id.into()), data)
            .await
    }

    pub async fn update_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.send(PresenceAction::Update, Some(client_id.into()), data)
            .await
    }

    pub async fn leave_client(
        &self,
        client_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        self.send(PresenceAction::Leave, Some(client_id.into()), data)
            .await
    }

    /// Current members, once the presence set is in sync. Attaches the
    /// channel if needed.
    pub async fn get(&self) -> Result<Vec<PresenceMessage>, Error> {
        let commands = &self.channel.inner.commands;
        let name = &self.channel.inner.name;
        request(commands, |waiter| Command::PresenceSync {
            channel: name.clone(),
            waiter,
        })
        .await?;
        request(commands, |reply| Command::PresenceMembers {
            channel: name.clone(),
            reply,
        })
        .await
    }

    /// Receive every presence event. Attaches like
    /// [`RealtimeChannel::subscribe`].
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceMessage> {
        let rx = self.channel.inner.presence.subscribe();
        self.channel.attach_in_background();
        rx
    }

    /// Call `listener` for each presence event, or only those with `action`.
    pub fn on<F>(&self, action: Option<PresenceAction>, listener: F) -> JoinHandle<()>
    where
        F: FnMut(PresenceMessage) + Send + 'static,
    {
        let handle = spawn_listener(
            self.channel.inner.presence.subscribe(),
            move |msg: &PresenceMessage| action.is_none_or(|a| a == msg.action),
            listener,
        );
        self.channel.attach_in_background();
        handle
    }

    async fn send(
        &self,
        action: PresenceAction,
        client_id: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        let message = PresenceMessage {
            action,
            client_id,
            data,
            ..Default::default()
        };
        self.channel
            .inner
            .commands
            .send(Command::Presence {
                channel: self.channel.inner.name.clone(),
                message,
                completion: Completion::ack_only(tx),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)??;
        Ok(())
    }
}

impl std::fmt::Debug for RealtimePresence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimePresence")
            .field("channel", &self.channel.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_auth_prefers_key_over_token() {
        let options = ClientOptions {
            key: Some("app.key:secret".into()),
            token: Some("tok".into()),
            ..Default::default()
        };
        assert!(default_auth(&options).is_ok());
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let err = default_auth(&ClientOptions::default()).err().unwrap();
        assert!(matches!(err, Error::Ably(info) if info.code == error_code::BAD_REQUEST));
    }

    #[test]
    fn build_outside_runtime_fails() {
        let options = ClientOptions::with_key("app.key:secret");
        assert!(Realtime::new(options).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn channels_registry_reuses_handles() {
        let options = ClientOptions {
            auto_connect: false,
            ..ClientOptions::with_key("app.key:secret")
        };
        let client = Realtime::new(options).unwrap();
        let a = client.channels().get("room");
        let b = client.channels().get("room");
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(client.channels().exists("room"));
        assert_eq!(client.channels().names(), vec!["room".to_string()]);

        client.channels().release("room");
        assert!(!client.channels().exists("room"));
        let c = client.channels().get("room");
        assert!(!Arc::ptr_eq(&a.inner, &c.inner));
    }

    #[tokio::test(start_paused = true)]
    async fn new_client_without_auto_connect_stays_initialized() {
        let options = ClientOptions {
            auto_connect: false,
            ..ClientOptions::with_key("app.key:secret")
        };
        let client = Realtime::new(options).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.connection().state(), ConnectionState::Initialized);
        assert_eq!(client.connection().serial(), -1);
        assert!(client.connection().id().is_none());
    }
}
