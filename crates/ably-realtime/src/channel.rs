//! Channel state machine.
//!
//! Channel state lives inside the engine next to the connection state, so
//! connection transitions can fan out to every channel synchronously. The
//! per-channel operations below are `impl Engine` blocks for that reason.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::connection::{ConnectionState, EVENT_CHANNEL_CAPACITY, Engine, Reply};
use crate::error::{ErrorInfo, error_code};
use crate::options::ChannelOptions;
use crate::presence::{PresenceMap, SyncWaiter};
use crate::protocol::{
    Action, Message, PresenceMessage, ProtocolMessage, decode_data, encode_data, flags,
};
use crate::queue::{Completion, QueuedMessage};
use crate::retry::{RetryDelayCalculator, RetryState};
use crate::timers::TimerKey;

const MESSAGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChannelId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelState {
    #[default]
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        }
    }

    fn retry_eligible(self) -> bool {
        matches!(self, ChannelState::Attaching | ChannelState::Suspended)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition into a state, or `Update` when the channel stays ATTACHED
/// but lost continuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
    Update,
}

impl From<ChannelState> for ChannelEvent {
    fn from(state: ChannelState) -> Self {
        match state {
            ChannelState::Initialized => ChannelEvent::Initialized,
            ChannelState::Attaching => ChannelEvent::Attaching,
            ChannelState::Attached => ChannelEvent::Attached,
            ChannelState::Detaching => ChannelEvent::Detaching,
            ChannelState::Detached => ChannelEvent::Detached,
            ChannelState::Suspended => ChannelEvent::Suspended,
            ChannelState::Failed => ChannelEvent::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub event: ChannelEvent,
    pub reason: Option<ErrorInfo>,
    /// Whether message continuity survived the last attachment.
    pub resumed: bool,
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ChannelSnapshot {
    pub(crate) state: ChannelState,
    pub(crate) error_reason: Option<ErrorInfo>,
    pub(crate) resumed: bool,
    pub(crate) attach_serial: Option<String>,
}

/// Where the engine delivers everything a channel handle can observe.
pub(crate) struct ChannelSinks {
    pub(crate) state: watch::Sender<ChannelSnapshot>,
    pub(crate) events: broadcast::Sender<ChannelStateChange>,
    pub(crate) messages: broadcast::Sender<Message>,
    pub(crate) presence: broadcast::Sender<PresenceMessage>,
}

impl ChannelSinks {
    pub(crate) fn new() -> (Self, watch::Receiver<ChannelSnapshot>) {
        let (state, state_rx) = watch::channel(ChannelSnapshot::default());
        let sinks = Self {
            state,
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            messages: broadcast::channel(MESSAGE_CHANNEL_CAPACITY).0,
            presence: broadcast::channel(MESSAGE_CHANNEL_CAPACITY).0,
        };
        (sinks, state_rx)
    }
}

pub(crate) struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) name: String,
    options: ChannelOptions,
    pub(crate) state: ChannelState,
    error_reason: Option<ErrorInfo>,
    attach_serial: Option<String>,
    /// Last channelSerial seen; sent on reattach and kept in recovery keys.
    pub(crate) serial: Option<String>,
    resumed: bool,
    attach_resume: bool,
    presence: PresenceMap,
    /// Presence operations waiting for ATTACHED.
    pending_presence: Vec<QueuedMessage>,
    attach_waiters: Vec<Reply<()>>,
    detach_waiters: Vec<Reply<()>>,
    retry: RetryState<ChannelState>,
    sinks: ChannelSinks,
}

impl Channel {
    fn new(
        id: ChannelId,
        name: String,
        options: ChannelOptions,
        serial: Option<String>,
        delays: Arc<dyn RetryDelayCalculator>,
        sinks: ChannelSinks,
    ) -> Self {
        Self {
            id,
            name,
            options,
            state: ChannelState::Initialized,
            error_reason: None,
            attach_serial: None,
            serial,
            resumed: false,
            attach_resume: false,
            presence: PresenceMap::default(),
            pending_presence: Vec::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            retry: RetryState::new(delays, ChannelState::retry_eligible),
            sinks,
        }
    }

    fn set_state(
        &mut self,
        state: ChannelState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        if previous == state && reason.is_none() {
            return;
        }
        self.state = state;
        if reason.is_some() {
            self.error_reason = reason.clone();
        } else if state == ChannelState::Attached {
            self.error_reason = None;
        }
        self.retry.on_transition(state);
        tracing::info!(
            channel = %self.name,
            from = %previous,
            to = %state,
            code = ?reason.as_ref().map(|e| e.code),
            "Channel state changed"
        );
        self.publish_snapshot();
        let _ = self.sinks.events.send(ChannelStateChange {
            previous,
            current: state,
            event: state.into(),
            reason,
            resumed: self.resumed,
            retry_in,
        });
    }

    fn emit_update(&mut self, reason: Option<ErrorInfo>) {
        tracing::info!(channel = %self.name, "Channel continuity lost");
        if reason.is_some() {
            self.error_reason = reason.clone();
        }
        self.publish_snapshot();
        let _ = self.sinks.events.send(ChannelStateChange {
            previous: self.state,
            current: self.state,
            event: ChannelEvent::Update,
            reason,
            resumed: self.resumed,
            retry_in: None,
        });
    }

    fn publish_snapshot(&self) {
        self.sinks.state.send_replace(ChannelSnapshot {
            state: self.state,
            error_reason: self.error_reason.clone(),
            resumed: self.resumed,
            attach_serial: self.attach_serial.clone(),
        });
    }

    fn resolve_attach(&mut self, result: Result<(), ErrorInfo>) {
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn resolve_detach(&mut self, result: Result<(), ErrorInfo>) {
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn fail_pending_presence(&mut self, error: &ErrorInfo) {
        for qm in self.pending_presence.drain(..) {
            qm.complete(Err(error.clone()));
        }
    }

    /// Restart presence tracking after ATTACHED. Without HAS_PRESENCE the
    /// service has no members to sync, so the pass ends immediately.
    fn begin_presence_sync(&mut self, has_presence: bool, timestamp: Option<i64>) {
        self.presence.start_sync(None);
        if !has_presence {
            for leave in self.presence.end_sync(timestamp) {
                let _ = self.sinks.presence.send(leave);
            }
        }
    }

    fn invalid_state(&self) -> ErrorInfo {
        ErrorInfo::new(
            error_code::CHANNEL_INVALID_STATE,
            Some(400),
            format!("channel {} is {}", self.name, self.state),
        )
    }
}

fn released(channel: &str) -> ErrorInfo {
    ErrorInfo::new(
        error_code::CHANNEL_OPERATION_FAILED,
        Some(400),
        format!("channel {channel} has been released"),
    )
}

fn presence_message(channel: &str, message: PresenceMessage) -> ProtocolMessage {
    ProtocolMessage {
        channel: Some(channel.to_string()),
        presence: Some(vec![message]),
        ..ProtocolMessage::new(Action::Presence)
    }
}

// ---------------------------------------------------------------------------
// Engine: channel operations
// ---------------------------------------------------------------------------

impl Engine {
    fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0).and_then(Option::as_ref)
    }

    fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id.0).and_then(Option::as_mut)
    }

    fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.channel(id).map(|ch| ch.state)
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels.iter().flatten().map(|ch| ch.id).collect()
    }

    pub(crate) fn register_channel(
        &mut self,
        name: String,
        options: ChannelOptions,
        sinks: ChannelSinks,
    ) {
        if self.channel_index.contains_key(&name) {
            tracing::debug!(channel = %name, "Channel already registered");
            return;
        }
        let id = ChannelId(self.channels.len());
        let serial = self.recovered_channel_serials.remove(&name);
        let channel = Channel::new(
            id,
            name.clone(),
            options,
            serial,
            Arc::clone(&self.channel_delays),
            sinks,
        );
        tracing::debug!(channel = %name, "Channel registered");
        self.channels.push(Some(channel));
        self.channel_index.insert(name, id);
    }

    pub(crate) fn release_channel(&mut self, name: &str) {
        let Some(id) = self.channel_index.remove(name) else {
            return;
        };
        self.timers.cancel_channel(id);
        let Some(mut ch) = self.channels.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if matches!(ch.state, ChannelState::Attaching | ChannelState::Attached)
            && self.state == ConnectionState::Connected
        {
            self.write(&ProtocolMessage::detach(name));
        }
        let err = released(name);
        ch.resolve_attach(Err(err.clone()));
        ch.resolve_detach(Ok(()));
        ch.fail_pending_presence(&err);
        ch.presence.reset(err.clone());
        self.queue.fail_channel(name, &err);
        tracing::debug!(channel = name, "Channel released");
    }

    // -----------------------------------------------------------------------
    // Attach / detach
    // -----------------------------------------------------------------------

    pub(crate) fn attach_channel(&mut self, name: &str, reply: Option<Reply<()>>) {
        match self.channel_index.get(name).copied() {
            Some(id) => self.attach_by_id(id, reply),
            None => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(released(name)));
                }
            }
        }
    }

    fn attach_by_id(&mut self, id: ChannelId, reply: Option<Reply<()>>) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnected
        ) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(self.state.error()));
            }
            return;
        }
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        let state = ch.state;
        if state == ChannelState::Attached {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        if let Some(reply) = reply {
            ch.attach_waiters.push(reply);
        }
        if state != ChannelState::Attaching {
            self.start_attach(id, None);
        }
    }

    /// Enter ATTACHING and, when connected, send ATTACH. Otherwise ATTACH
    /// goes out as soon as the connection is established.
    fn start_attach(&mut self, id: ChannelId, reason: Option<ErrorInfo>) {
        self.timers.cancel(&TimerKey::ChannelRetry(id));
        self.timers.cancel(&TimerKey::DetachTimeout(id));
        let connected = self.state == ConnectionState::Connected;
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        if ch.state == ChannelState::Detaching {
            ch.resolve_detach(Err(ErrorInfo::new(
                error_code::CHANNEL_OPERATION_FAILED,
                Some(400),
                "detach superseded by attach",
            )));
        }
        ch.set_state(ChannelState::Attaching, reason, None);
        if connected {
            self.send_attach(id);
        }
    }

    fn send_attach(&mut self, id: ChannelId) {
        let Some(ch) = self.channel(id) else {
            return;
        };
        let attach = ProtocolMessage::attach(
            &ch.name,
            ch.serial.as_deref(),
            ch.attach_resume,
            &ch.options.params,
        );
        self.write(&attach);
        self.timers.schedule(
            TimerKey::AttachTimeout(id),
            self.options.realtime_request_timeout,
        );
    }

    fn send_detach(&mut self, id: ChannelId) {
        let Some(ch) = self.channel(id) else {
            return;
        };
        let detach = ProtocolMessage::detach(&ch.name);
        self.write(&detach);
        self.timers.schedule(
            TimerKey::DetachTimeout(id),
            self.options.realtime_request_timeout,
        );
    }

    /// ATTACH again for every channel still waiting, e.g. after the token
    /// that was rejected on attach has been replaced.
    pub(crate) fn resend_pending_attaches(&mut self) {
        for id in self.channel_ids() {
            if self.channel_state(id) == Some(ChannelState::Attaching) {
                self.send_attach(id);
            }
        }
    }

    pub(crate) fn detach_channel(&mut self, name: &str, reply: Reply<()>) {
        let Some(id) = self.channel_index.get(name).copied() else {
            let _ = reply.send(Err(released(name)));
            return;
        };
        let connected = self.state == ConnectionState::Connected;
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        let state = ch.state;
        match state {
            ChannelState::Initialized | ChannelState::Detached => {
                let _ = reply.send(Ok(()));
            }
            ChannelState::Failed => {
                let err = ch.error_reason.clone().unwrap_or_else(|| ch.invalid_state());
                let _ = reply.send(Err(err));
            }
            ChannelState::Detaching => ch.detach_waiters.push(reply),
            ChannelState::Attaching | ChannelState::Attached if connected => {
                ch.detach_waiters.push(reply);
                ch.set_state(ChannelState::Detaching, None, None);
                self.timers.cancel(&TimerKey::AttachTimeout(id));
                self.timers.cancel(&TimerKey::ChannelRetry(id));
                self.send_detach(id);
            }
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended => {
                ch.detach_waiters.push(reply);
                let err = ErrorInfo::channel_detached(name);
                self.detach_now(id, None, err);
            }
        }
    }

    /// Move straight to DETACHED. Attach callers and pending operations fail
    /// with `op_error`; detach callers succeed.
    fn detach_now(&mut self, id: ChannelId, reason: Option<ErrorInfo>, op_error: ErrorInfo) {
        self.timers.cancel_channel(id);
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        ch.attach_resume = false;
        ch.set_state(ChannelState::Detached, reason, None);
        ch.resolve_attach(Err(op_error.clone()));
        ch.resolve_detach(Ok(()));
        ch.fail_pending_presence(&op_error);
        ch.presence.reset(op_error.clone());
        let name = ch.name.clone();
        self.queue.fail_channel(&name, &op_error);
    }

    /// SUSPENDED: the channel will reattach by itself, after `retry` or
    /// once the connection is back.
    fn suspend_channel(&mut self, id: ChannelId, err: ErrorInfo, retry: bool) {
        self.timers.cancel_channel(id);
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        let delay = retry.then(|| {
            let attempt = ch.retry.add_retry_attempt();
            tracing::info!(
                channel = %ch.name,
                attempt = %attempt.id,
                delay_ms = attempt.delay.as_millis() as u64,
                "Scheduling channel reattach"
            );
            attempt.delay
        });
        ch.set_state(ChannelState::Suspended, Some(err.clone()), delay);
        ch.resolve_attach(Err(err.clone()));
        if ch.presence.sync_in_progress() {
            ch.presence.fail_sync(ErrorInfo::new(
                error_code::PRESENCE_SYNC_FAILED,
                err.status_code,
                format!("presence sync interrupted: {}", err.message),
            ));
        }
        ch.fail_pending_presence(&err);
        let name = ch.name.clone();
        self.queue.fail_channel(&name, &err);
        if let Some(delay) = delay {
            self.timers.schedule(TimerKey::ChannelRetry(id), delay);
        }
    }

    fn fail_channel(&mut self, id: ChannelId, err: ErrorInfo) {
        self.timers.cancel_channel(id);
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        tracing::error!(channel = %ch.name, code = err.code, "Channel failed: {}", err.message);
        ch.attach_resume = false;
        ch.set_state(ChannelState::Failed, Some(err.clone()), None);
        ch.resolve_attach(Err(err.clone()));
        ch.resolve_detach(Err(err.clone()));
        ch.fail_pending_presence(&err);
        ch.presence.reset(err.clone());
        let name = ch.name.clone();
        self.queue.fail_channel(&name, &err);
    }

    pub(crate) fn on_attach_timeout(&mut self, id: ChannelId) {
        if self.channel_state(id) != Some(ChannelState::Attaching) {
            return;
        }
        let err = ErrorInfo::new(
            error_code::CHANNEL_TIMEOUT,
            Some(408),
            "timed out waiting for ATTACHED",
        );
        self.suspend_channel(id, err, true);
    }

    pub(crate) fn on_detach_timeout(&mut self, id: ChannelId) {
        let Some(ch) = self.channel(id) else {
            return;
        };
        if ch.state != ChannelState::Detaching {
            return;
        }
        let err = ErrorInfo::channel_detached(&ch.name);
        let reason = ErrorInfo::new(
            error_code::CHANNEL_TIMEOUT,
            Some(408),
            "timed out waiting for DETACHED",
        );
        self.detach_now(id, Some(reason), err);
    }

    pub(crate) fn on_channel_retry(&mut self, id: ChannelId) {
        if self.channel_state(id) != Some(ChannelState::Suspended) {
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnected
        ) {
            self.start_attach(id, None);
        }
    }

    // -----------------------------------------------------------------------
    // Connection fan-out
    // -----------------------------------------------------------------------

    pub(crate) fn channels_on_connected(&mut self, continuous: bool) {
        for id in self.channel_ids() {
            match self.channel_state(id) {
                Some(ChannelState::Attached) if continuous => self.flush_channel(id),
                Some(ChannelState::Attached | ChannelState::Suspended) => {
                    self.start_attach(id, None)
                }
                Some(ChannelState::Attaching) => self.send_attach(id),
                Some(ChannelState::Detaching) => self.send_detach(id),
                _ => {}
            }
        }
    }

    pub(crate) fn channels_on_suspended(&mut self, err: &ErrorInfo) {
        for id in self.channel_ids() {
            match self.channel_state(id) {
                Some(ChannelState::Attached | ChannelState::Attaching) => {
                    self.suspend_channel(id, err.clone(), false);
                }
                Some(ChannelState::Detaching) => {
                    let op_error = err.clone();
                    self.detach_now(id, None, op_error);
                }
                _ => {}
            }
        }
    }

    pub(crate) fn channels_on_closed(&mut self, err: &ErrorInfo) {
        for id in self.channel_ids() {
            if matches!(
                self.channel_state(id),
                Some(
                    ChannelState::Attached
                        | ChannelState::Attaching
                        | ChannelState::Detaching
                        | ChannelState::Suspended
                )
            ) {
                self.detach_now(id, None, err.clone());
            }
        }
    }

    pub(crate) fn channels_on_failed(&mut self, err: &ErrorInfo) {
        for id in self.channel_ids() {
            if matches!(
                self.channel_state(id),
                Some(
                    ChannelState::Attached
                        | ChannelState::Attaching
                        | ChannelState::Detaching
                        | ChannelState::Suspended
                )
            ) {
                self.fail_channel(id, err.clone());
            }
        }
    }

    fn flush_channel(&mut self, id: ChannelId) {
        let Some(name) = self.channel(id).map(|ch| ch.name.clone()) else {
            return;
        };
        let queued = self.queue.take_queued(&name);
        if !queued.is_empty() {
            tracing::debug!(channel = %name, count = queued.len(), "Sending queued messages");
        }
        for qm in queued {
            self.send_queued(qm);
        }
    }

    // -----------------------------------------------------------------------
    // Publish and presence operations
    // -----------------------------------------------------------------------

    pub(crate) fn publish(&mut self, name: &str, messages: Vec<Message>, completion: Completion) {
        let Some(id) = self.channel_index.get(name).copied() else {
            QueuedMessage::new(ProtocolMessage::new(Action::Message), completion)
                .complete(Err(released(name)));
            return;
        };
        let messages = messages
            .into_iter()
            .map(|mut m| {
                let (data, encoding) = encode_data(m.data.take(), m.encoding.take());
                m.data = data;
                m.encoding = encoding;
                m
            })
            .collect();
        let msg = ProtocolMessage {
            channel: Some(name.to_string()),
            messages: Some(messages),
            ..ProtocolMessage::new(Action::Message)
        };
        self.submit(id, QueuedMessage::new(msg, completion));
    }

    /// Write now, queue for later, or reject, by channel and connection state.
    fn submit(&mut self, id: ChannelId, qm: QueuedMessage) {
        let Some(ch) = self.channel(id) else {
            return;
        };
        let channel_state = ch.state;
        match channel_state {
            ChannelState::Attached if self.state == ConnectionState::Connected => {
                self.send_queued(qm);
            }
            ChannelState::Initialized | ChannelState::Attaching | ChannelState::Attached => {
                if !(self.options.queue_messages && self.state.queues_messages()) {
                    qm.complete(Err(self.state.error()));
                    return;
                }
                if channel_state == ChannelState::Initialized {
                    self.attach_by_id(id, None);
                }
                self.queue.enqueue(qm, self.max_message_size);
            }
            _ => qm.complete(Err(ch.invalid_state())),
        }
    }

    pub(crate) fn update_presence(
        &mut self,
        name: &str,
        mut message: PresenceMessage,
        completion: Completion,
    ) {
        let Some(id) = self.channel_index.get(name).copied() else {
            QueuedMessage::new(ProtocolMessage::new(Action::Presence), completion)
                .complete(Err(released(name)));
            return;
        };
        if message.client_id.is_none() {
            message.client_id = self.client_id.clone();
        }
        if message.client_id.is_none() {
            QueuedMessage::new(ProtocolMessage::new(Action::Presence), completion).complete(Err(
                ErrorInfo::new(
                    error_code::PRESENCE_NO_CLIENT_ID,
                    Some(400),
                    "presence operations require a clientId",
                ),
            ));
            return;
        }
        let (data, encoding) = encode_data(message.data.take(), message.encoding.take());
        message.data = data;
        message.encoding = encoding;
        let qm = QueuedMessage::new(presence_message(name, message), completion);

        match self.channel_state(id) {
            Some(ChannelState::Attached) => self.submit(id, qm),
            Some(ChannelState::Initialized) => {
                self.attach_by_id(id, None);
                self.hold_presence(id, qm);
            }
            Some(ChannelState::Attaching) => self.hold_presence(id, qm),
            Some(_) => {
                if let Some(ch) = self.channel(id) {
                    qm.complete(Err(ch.invalid_state()));
                }
            }
            None => {}
        }
    }

    fn hold_presence(&mut self, id: ChannelId, qm: QueuedMessage) {
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        if ch.state == ChannelState::Attaching {
            ch.pending_presence.push(qm);
        } else {
            // The implicit attach was refused by the connection state.
            qm.complete(Err(ch.invalid_state()));
        }
    }

    pub(crate) fn wait_for_sync(&mut self, name: &str, waiter: SyncWaiter) {
        let Some(id) = self.channel_index.get(name).copied() else {
            let _ = waiter.send(Err(released(name)));
            return;
        };
        if self.channel_state(id) == Some(ChannelState::Initialized) {
            self.attach_by_id(id, None);
        }
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        match ch.state {
            ChannelState::Attaching | ChannelState::Attached => {
                ch.presence.once_sync_complete(waiter);
            }
            ChannelState::Suspended => {
                let _ = waiter.send(Err(ErrorInfo::new(
                    error_code::PRESENCE_SYNC_FAILED,
                    Some(400),
                    format!("presence of channel {name} is out of date while suspended"),
                )));
            }
            _ => {
                let _ = waiter.send(Err(ch.invalid_state()));
            }
        }
    }

    pub(crate) fn presence_members(&self, name: &str) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        let id = self
            .channel_index
            .get(name)
            .copied()
            .ok_or_else(|| released(name))?;
        self.channel(id)
            .map(|ch| ch.presence.members())
            .ok_or_else(|| released(name))
    }

    // -----------------------------------------------------------------------
    // Inbound channel messages
    // -----------------------------------------------------------------------

    pub(crate) fn on_channel_message(&mut self, msg: ProtocolMessage) {
        let Some(id) = msg
            .channel
            .as_deref()
            .and_then(|name| self.channel_index.get(name).copied())
        else {
            tracing::debug!(channel = ?msg.channel, action = ?msg.action, "Message for unknown channel");
            return;
        };
        match msg.action {
            Action::Attached => self.on_attached(id, msg),
            Action::Detached => self.on_detached(id, msg),
            Action::Error => self.on_channel_error(id, msg),
            Action::Message => self.on_message(id, msg),
            Action::Presence => self.on_presence(id, msg, false),
            Action::Sync => self.on_presence(id, msg, true),
            other => tracing::debug!(action = ?other, "Unexpected channel action"),
        }
    }

    fn on_attached(&mut self, id: ChannelId, msg: ProtocolMessage) {
        let resumed = msg.has_flag(flags::RESUMED);
        let has_presence = msg.has_flag(flags::HAS_PRESENCE);
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        match ch.state {
            ChannelState::Attached => {
                ch.attach_serial = msg.channel_serial.clone();
                if msg.channel_serial.is_some() {
                    ch.serial = msg.channel_serial.clone();
                }
                ch.resumed = resumed;
                if !resumed {
                    ch.emit_update(msg.error);
                    ch.begin_presence_sync(has_presence, msg.timestamp);
                    self.reenter_presence(id);
                }
                return;
            }
            ChannelState::Attaching => {}
            other => {
                tracing::debug!(channel = %ch.name, state = %other, "Ignoring ATTACHED");
                return;
            }
        }

        ch.attach_serial = msg.channel_serial.clone();
        if msg.channel_serial.is_some() {
            ch.serial = msg.channel_serial.clone();
        }
        ch.resumed = resumed;
        ch.attach_resume = true;
        ch.set_state(ChannelState::Attached, msg.error, None);
        ch.resolve_attach(Ok(()));
        ch.begin_presence_sync(has_presence, msg.timestamp);

        let pending = std::mem::take(&mut ch.pending_presence);
        self.timers.cancel(&TimerKey::AttachTimeout(id));

        for qm in pending {
            self.send_queued(qm);
        }
        if !resumed {
            self.reenter_presence(id);
        }
        self.flush_channel(id);
    }

    /// Re-enters every member this connection entered, after the service
    /// attached the channel without continuity.
    fn reenter_presence(&mut self, id: ChannelId) {
        let Some(ch) = self.channel(id) else {
            return;
        };
        let name = ch.name.clone();
        for member in ch.presence.reenter_local_members() {
            tracing::info!(channel = %name, client_id = ?member.client_id, "Re-entering presence");
            let qm = QueuedMessage::new(presence_message(&name, member), Completion::default());
            self.send_queued(qm);
        }
    }

    fn on_detached(&mut self, id: ChannelId, msg: ProtocolMessage) {
        let Some(ch) = self.channel(id) else {
            return;
        };
        match ch.state {
            ChannelState::Detaching => {
                let err = ErrorInfo::channel_detached(&ch.name);
                self.detach_now(id, msg.error, err);
            }
            ChannelState::Attached | ChannelState::Attaching => {
                let err = msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(
                        error_code::CHANNEL_OPERATION_FAILED,
                        None,
                        "channel detached by the service",
                    )
                });
                tracing::warn!(channel = %ch.name, code = err.code, "Unexpected DETACHED: {}", err.message);
                if err.is_retriable() {
                    self.suspend_channel(id, err, true);
                } else {
                    self.fail_channel(id, err);
                }
            }
            other => tracing::debug!(channel = %ch.name, state = %other, "Ignoring DETACHED"),
        }
    }

    fn on_channel_error(&mut self, id: ChannelId, msg: ProtocolMessage) {
        let err = ErrorInfo::or_unknown(msg.error);
        let Some(state) = self.channel_state(id) else {
            return;
        };
        if err.is_token_error() && state == ChannelState::Attaching && self.auth.can_renew() {
            tracing::info!(code = err.code, "Token rejected on attach, re-authenticating");
            self.reauthorize();
            return;
        }
        match state {
            ChannelState::Attached | ChannelState::Attaching if err.is_retriable() => {
                self.suspend_channel(id, err, true);
            }
            ChannelState::Attached | ChannelState::Attaching => self.fail_channel(id, err),
            ChannelState::Detaching => {
                let op_error = err.clone();
                self.detach_now(id, Some(err), op_error);
            }
            _ => tracing::debug!(state = %state, code = err.code, "Ignoring channel ERROR"),
        }
    }

    fn on_message(&mut self, id: ChannelId, msg: ProtocolMessage) {
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        if ch.state != ChannelState::Attached {
            tracing::debug!(channel = %ch.name, state = %ch.state, "Dropping MESSAGE");
            return;
        }
        if msg.channel_serial.is_some() {
            ch.serial = msg.channel_serial.clone();
        }
        for (i, mut m) in msg.messages.unwrap_or_default().into_iter().enumerate() {
            if m.id.is_none() {
                m.id = msg.id.as_ref().map(|pid| format!("{pid}:{i}"));
            }
            if m.connection_id.is_none() {
                m.connection_id = msg.connection_id.clone();
            }
            if m.timestamp.is_none() {
                m.timestamp = msg.timestamp;
            }
            if let Some(data) = m.data.take() {
                m.data = Some(decode_data(data, m.encoding.as_deref()));
                m.encoding = None;
            }
            let _ = ch.sinks.messages.send(m);
        }
    }

    /// PRESENCE and SYNC share the member handling; SYNC additionally drives
    /// the sync pass via its `seq:cursor` channelSerial.
    fn on_presence(&mut self, id: ChannelId, msg: ProtocolMessage, is_sync: bool) {
        let own_connection_id = self.id.clone();
        let Some(ch) = self.channel_mut(id) else {
            return;
        };
        if ch.state != ChannelState::Attached {
            tracing::debug!(channel = %ch.name, state = %ch.state, "Dropping presence");
            return;
        }
        if is_sync {
            ch.presence.start_sync(msg.channel_serial.as_deref());
            tracing::debug!(channel = %ch.name, sync = ?ch.presence.sync_state(), "SYNC frame");
        } else if msg.channel_serial.is_some() {
            ch.serial = msg.channel_serial.clone();
        }

        for (i, mut p) in msg.presence.unwrap_or_default().into_iter().enumerate() {
            if p.id.is_none() {
                p.id = msg.id.as_ref().map(|pid| format!("{pid}:{i}"));
            }
            if p.connection_id.is_none() {
                p.connection_id = msg.connection_id.clone();
            }
            if p.timestamp.is_none() {
                p.timestamp = msg.timestamp;
            }
            if let Some(data) = p.data.take() {
                p.data = Some(decode_data(data, p.encoding.as_deref()));
                p.encoding = None;
            }
            if let Some(event) = ch.presence.put(p, own_connection_id.as_deref()) {
                let _ = ch.sinks.presence.send(event);
            }
        }

        if is_sync && sync_complete(msg.channel_serial.as_deref()) {
            for leave in ch.presence.end_sync(msg.timestamp) {
                let _ = ch.sinks.presence.send(leave);
            }
        }
    }
}

/// A SYNC is the last of its pass when it has no channelSerial or the cursor
/// after the colon is empty.
fn sync_complete(channel_serial: Option<&str>) -> bool {
    match channel_serial {
        None => true,
        Some(serial) => serial
            .split_once(':')
            .is_none_or(|(_, cursor)| cursor.is_empty()),
    }
}
