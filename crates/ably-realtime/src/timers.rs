//! Revocable timers for the engine loop.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::time::{DelayQueue, delay_queue};

use crate::channel::ChannelId;

/// Every timer the engine can arm. Arming a key that is already armed
/// replaces the earlier deadline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    ConnectTimeout,
    ConnectRetry,
    SuspendedRetry,
    CloseTimeout,
    Idle,
    TokenRenewal,
    Ping(String),
    AttachTimeout(ChannelId),
    DetachTimeout(ChannelId),
    ChannelRetry(ChannelId),
}

impl TimerKey {
    fn channel(&self) -> Option<ChannelId> {
        match self {
            TimerKey::AttachTimeout(id) | TimerKey::DetachTimeout(id) | TimerKey::ChannelRetry(id) => {
                Some(*id)
            }
            _ => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Timers {
    queue: DelayQueue<TimerKey>,
    keys: HashMap<TimerKey, delay_queue::Key>,
}

impl Timers {
    pub(crate) fn schedule(&mut self, key: TimerKey, delay: Duration) {
        if let Some(existing) = self.keys.get(&key) {
            self.queue.reset(existing, delay);
            return;
        }
        let handle = self.queue.insert(key.clone(), delay);
        self.keys.insert(key, handle);
    }

    pub(crate) fn cancel(&mut self, key: &TimerKey) {
        if let Some(handle) = self.keys.remove(key) {
            self.queue.remove(&handle);
        }
    }

    pub(crate) fn cancel_channel(&mut self, channel: ChannelId) {
        let keys: Vec<TimerKey> = self
            .keys
            .keys()
            .filter(|k| k.channel() == Some(channel))
            .cloned()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.keys.contains_key(key)
    }

    /// Resolves with the next expired key. Pending forever while nothing is
    /// armed; cancel-safe, so it can sit in a `select!` arm.
    pub(crate) async fn expired(&mut self) -> TimerKey {
        if self.queue.is_empty() {
            return std::future::pending().await;
        }
        match std::future::poll_fn(|cx| self.queue.poll_expired(cx)).await {
            Some(expired) => {
                let key = expired.into_inner();
                self.keys.remove(&key);
                key
            }
            None => std::future::pending().await,
        }
    }
}
