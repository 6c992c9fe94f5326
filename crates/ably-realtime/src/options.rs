//! Client and channel options.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Format;

pub(crate) const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";

/// Options for a [`Realtime`](crate::Realtime) client.
///
/// Deserializes from camelCase keys with every field optional, so a config
/// file only needs the values it overrides. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Full API key (`keyName:keySecret`). Used when no auth provider is given.
    pub key: Option<String>,
    /// Fixed token string. Used when neither a provider nor a key is given.
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub realtime_host: String,
    /// REST host for token exchange; derived from `realtime_host` when unset.
    pub rest_host: Option<String>,
    pub port: Option<u16>,
    pub tls: bool,
    pub format: Format,
    pub auto_connect: bool,
    /// Hold publishes made while not connected and send them on connect.
    pub queue_messages: bool,
    /// Whether the service echoes this connection's own publishes back.
    pub echo_messages: bool,
    /// Recovery key from a previous client instance.
    pub recover: Option<String>,
    #[serde(with = "duration_ms")]
    pub disconnected_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub suspended_retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub channel_retry_timeout: Duration,
    /// Deadline for CONNECTED, ATTACHED, DETACHED, CLOSED and ping replies.
    #[serde(with = "duration_ms")]
    pub realtime_request_timeout: Duration,
    /// Used until the service advertises its own value in CONNECTED.
    #[serde(with = "duration_ms")]
    pub connection_state_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub max_retry_delay: Duration,
    pub max_message_size: usize,
    /// Extra query parameters for the realtime endpoint.
    pub transport_params: HashMap<String, String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            token: None,
            client_id: None,
            realtime_host: DEFAULT_REALTIME_HOST.to_string(),
            rest_host: None,
            port: None,
            tls: true,
            format: Format::MsgPack,
            auto_connect: true,
            queue_messages: true,
            echo_messages: true,
            recover: None,
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            realtime_request_timeout: Duration::from_secs(10),
            connection_state_ttl: Duration::from_secs(120),
            max_retry_delay: Duration::from_secs(60),
            max_message_size: 65536,
            transport_params: HashMap::new(),
        }
    }
}

impl ClientOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// REST host for token exchange.
    pub fn rest_host(&self) -> String {
        match &self.rest_host {
            Some(host) => host.clone(),
            None if self.realtime_host == DEFAULT_REALTIME_HOST => "rest.ably.io".to_string(),
            None => self.realtime_host.clone(),
        }
    }
}

/// Per-channel options, sent as ATTACH params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// e.g. `{"rewind": "2m"}`
    pub params: HashMap<String, String>,
}

impl ChannelOptions {
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
