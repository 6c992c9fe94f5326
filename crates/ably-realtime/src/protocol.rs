//! Ably wire protocol types, constants, and JSON / MessagePack encode/decode.

use std::cmp::Ordering;
use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorInfo};

// ---------------------------------------------------------------------------
// Actions and flags
// ---------------------------------------------------------------------------

/// The action carried by every protocol message.
///
/// Actions this client does not understand decode to [`Action::Unknown`]
/// instead of failing the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Action {
    #[default]
    Heartbeat,
    Ack,
    Nack,
    Connect,
    Connected,
    Disconnect,
    Disconnected,
    Close,
    Closed,
    Error,
    Attach,
    Attached,
    Detach,
    Detached,
    Presence,
    Message,
    Sync,
    Auth,
    Unknown(i32),
}

impl From<i32> for Action {
    fn from(value: i32) -> Self {
        match value {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            17 => Action::Auth,
            other => Action::Unknown(other),
        }
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        match action {
            Action::Heartbeat => 0,
            Action::Ack => 1,
            Action::Nack => 2,
            Action::Connect => 3,
            Action::Connected => 4,
            Action::Disconnect => 5,
            Action::Disconnected => 6,
            Action::Close => 7,
            Action::Closed => 8,
            Action::Error => 9,
            Action::Attach => 10,
            Action::Attached => 11,
            Action::Detach => 12,
            Action::Detached => 13,
            Action::Presence => 14,
            Action::Message => 15,
            Action::Sync => 16,
            Action::Auth => 17,
            Action::Unknown(other) => other,
        }
    }
}

pub mod flags {
    pub const HAS_PRESENCE: i32 = 1;
    pub const HAS_BACKLOG: i32 = 1 << 1;
    pub const RESUMED: i32 = 1 << 2;
    pub const HAS_LOCAL_PRESENCE: i32 = 1 << 3;
    pub const TRANSIENT: i32 = 1 << 4;
    pub const ATTACH_RESUME: i32 = 1 << 5;
    pub const PRESENCE: i32 = 1 << 16;
    pub const PUBLISH: i32 = 1 << 17;
    pub const SUBSCRIBE: i32 = 1 << 18;
    pub const PRESENCE_SUBSCRIBE: i32 = 1 << 19;
}

// ---------------------------------------------------------------------------
// Wire protocol types
// ---------------------------------------------------------------------------

// NOTE: We intentionally omit `skip_serializing_if = "Option::is_none"` on
// these structs. rmp_serde has a long-standing bug where skipped Option fields
// cause deserialization failures: https://github.com/3Hren/msgpack-rust/issues/86
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    pub id: Option<String>,
    pub channel: Option<String>,
    pub channel_serial: Option<String>,
    pub connection_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_details: Option<ConnectionDetails>,
    pub msg_serial: Option<i64>,
    pub count: Option<i64>,
    pub flags: Option<i32>,
    pub error: Option<ErrorInfo>,
    pub auth: Option<AuthDetails>,
    pub messages: Option<Vec<Message>>,
    pub presence: Option<Vec<PresenceMessage>>,
    pub timestamp: Option<i64>,
    pub params: Option<HashMap<String, String>>,
    pub res: Option<Vec<PublishResult>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    pub client_id: Option<String>,
    pub connection_key: Option<String>,
    pub connection_state_ttl: Option<i64>,
    pub max_idle_interval: Option<i64>,
    pub max_message_size: Option<i64>,
    pub max_frame_size: Option<i64>,
    pub max_inbound_rate: Option<i64>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// Per-message outcome carried on an ACK, one entry per acknowledged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PublishResult {
    pub serials: Vec<Option<String>>,
}

/// An application message published to or received from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    pub id: Option<String>,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub timestamp: Option<i64>,
    pub encoding: Option<String>,
    pub extras: Option<serde_json::Value>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum PresenceAction {
    #[default]
    Absent,
    Present,
    Enter,
    Leave,
    Update,
}

impl TryFrom<i32> for PresenceAction {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(format!("unknown presence action {other}")),
        }
    }
}

impl From<PresenceAction> for i32 {
    fn from(action: PresenceAction) -> Self {
        match action {
            PresenceAction::Absent => 0,
            PresenceAction::Present => 1,
            PresenceAction::Enter => 2,
            PresenceAction::Leave => 3,
            PresenceAction::Update => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceMessage {
    pub id: Option<String>,
    pub action: PresenceAction,
    pub client_id: Option<String>,
    pub connection_id: Option<String>,
    pub data: Option<serde_json::Value>,
    pub encoding: Option<String>,
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    /// Identifies one entry of the presence set: `clientId:connectionId`.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.client_id.as_deref().unwrap_or_default(),
            self.connection_id.as_deref().unwrap_or_default()
        )
    }

    /// A message is synthesized when the service generated it on behalf of a
    /// connection (e.g. a leave after a timeout), so its id does not carry
    /// that connection's serial.
    pub fn is_synthesized(&self) -> bool {
        match (&self.id, &self.connection_id) {
            (Some(id), Some(connection_id)) => !id.starts_with(connection_id.as_str()),
            _ => false,
        }
    }

    /// Returns `(msgSerial, index)` from an id of the form `connId:msgSerial:index`.
    fn serial_parts(&self) -> Option<(&str, &str)> {
        let mut parts = self.id.as_deref()?.rsplitn(3, ':');
        let index = parts.next()?;
        let serial = parts.next()?;
        parts.next()?;
        Some((serial, index))
    }

    /// Whether `self` should replace `other` for the same member.
    pub fn is_newer_than(&self, other: &PresenceMessage) -> bool {
        if self.is_synthesized() || other.is_synthesized() {
            return match (self.timestamp, other.timestamp) {
                (Some(mine), Some(theirs)) => mine >= theirs,
                (mine, _) => mine.is_some(),
            };
        }
        let (Some((serial, index)), Some((other_serial, other_index))) =
            (self.serial_parts(), other.serial_parts())
        else {
            tracing::debug!(id = ?self.id, other = ?other.id, "presence id without serial, treating as newer");
            return true;
        };
        match cmp_numeric(serial, other_serial) {
            Ordering::Equal => cmp_numeric(index, other_index) == Ordering::Greater,
            ord => ord == Ordering::Greater,
        }
    }
}

/// Compare two digit strings by value without parsing: after dropping leading
/// zeros, the shorter string is smaller and equal lengths compare lexically.
fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

// ---------------------------------------------------------------------------
// Protocol message helpers
// ---------------------------------------------------------------------------

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: i32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }

    /// Only MESSAGE and PRESENCE consume a msgSerial and expect an ACK.
    pub fn ack_required(&self) -> bool {
        matches!(self.action, Action::Message | Action::Presence)
    }

    /// Merge `other`'s payload into `self`. Returns `false` (leaving `self`
    /// untouched) when the two messages cannot share one frame.
    pub(crate) fn merge_from(&mut self, other: &ProtocolMessage, max_size: usize) -> bool {
        if self.channel != other.channel || self.action != other.action {
            return false;
        }
        match self.action {
            Action::Message => match (&mut self.messages, &other.messages) {
                (Some(mine), Some(theirs)) => merge_payload(mine, theirs, max_size),
                _ => false,
            },
            Action::Presence => match (&mut self.presence, &other.presence) {
                (Some(mine), Some(theirs)) => merge_payload(mine, theirs, max_size),
                _ => false,
            },
            _ => false,
        }
    }

    pub(crate) fn attach(
        channel: &str,
        channel_serial: Option<&str>,
        attach_resume: bool,
        params: &HashMap<String, String>,
    ) -> Self {
        let flags = if attach_resume {
            Some(flags::ATTACH_RESUME)
        } else {
            None
        };
        Self {
            action: Action::Attach,
            channel: Some(channel.to_string()),
            channel_serial: channel_serial.map(str::to_string),
            flags,
            params: (!params.is_empty()).then(|| params.clone()),
            ..Default::default()
        }
    }

    pub(crate) fn detach(channel: &str) -> Self {
        Self {
            action: Action::Detach,
            channel: Some(channel.to_string()),
            ..Default::default()
        }
    }
}

/// Common view over message payload types for merge decisions.
trait Payload: Clone {
    fn id(&self) -> Option<&str>;
    fn client_id(&self) -> Option<&str>;
    fn data(&self) -> Option<&serde_json::Value>;
    fn name(&self) -> Option<&str> {
        None
    }
    fn extras(&self) -> Option<&serde_json::Value> {
        None
    }

    /// Size as the service counts it: name + data + clientId + extras bytes.
    fn size(&self) -> usize {
        let value_size = |v: &serde_json::Value| match v {
            serde_json::Value::String(s) => s.len(),
            serde_json::Value::Null => 0,
            other => other.to_string().len(),
        };
        self.name().map_or(0, str::len)
            + self.client_id().map_or(0, str::len)
            + self.data().map_or(0, value_size)
            + self.extras().map_or(0, value_size)
    }
}

impl Payload for Message {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
    fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    fn extras(&self) -> Option<&serde_json::Value> {
        self.extras.as_ref()
    }
}

impl Payload for PresenceMessage {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
    fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
    fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
}

fn merge_payload<T: Payload>(mine: &mut Vec<T>, theirs: &[T], max_size: usize) -> bool {
    let combined = || mine.iter().chain(theirs.iter());
    if combined().any(|m| m.id().is_some()) {
        return false;
    }
    let mut client_ids = combined().map(Payload::client_id);
    if let Some(first) = client_ids.next()
        && client_ids.any(|c| c != first)
    {
        return false;
    }
    if combined().map(Payload::size).sum::<usize>() > max_size {
        return false;
    }
    mine.extend(theirs.iter().cloned());
    true
}

// ---------------------------------------------------------------------------
// Payload data encoding
// ---------------------------------------------------------------------------

/// Prepare outbound data: objects and arrays travel as JSON strings tagged
/// with the `json` encoding.
pub(crate) fn encode_data(
    data: Option<serde_json::Value>,
    encoding: Option<String>,
) -> (Option<serde_json::Value>, Option<String>) {
    match data {
        Some(value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            let encoding = match encoding {
                Some(existing) if !existing.is_empty() => format!("{existing}/json"),
                _ => "json".to_string(),
            };
            (
                Some(serde_json::Value::String(value.to_string())),
                Some(encoding),
            )
        }
        other => (other, encoding),
    }
}

/// Unwind the `encoding` layers of inbound data, innermost last.
pub(crate) fn decode_data(data: serde_json::Value, encoding: Option<&str>) -> serde_json::Value {
    let Some(encoding) = encoding else {
        return data;
    };
    if encoding.is_empty() {
        return data;
    }
    let mut result = data;
    for layer in encoding.rsplit('/') {
        match layer {
            "json" => {
                if let serde_json::Value::String(ref s) = result {
                    match serde_json::from_str(s) {
                        Ok(parsed) => result = parsed,
                        Err(e) => {
                            // Intentional fallback: return raw data rather than failing the message.
                            tracing::warn!("Failed to decode JSON encoding layer: {e}");
                            return result;
                        }
                    }
                }
            }
            "base64" => {
                // serde_json::Value has no binary type, so decoded bytes are
                // represented as a JSON array of numbers.
                if let serde_json::Value::String(ref s) = result {
                    match base64::engine::general_purpose::STANDARD.decode(s) {
                        Ok(bytes) => {
                            result = serde_json::Value::Array(
                                bytes.into_iter().map(|b| b.into()).collect(),
                            );
                        }
                        Err(e) => {
                            // Intentional fallback: return raw data rather than failing the message.
                            tracing::warn!("Failed to decode base64 encoding layer: {e}");
                            return result;
                        }
                    }
                }
            }
            "utf-8" => {
                // No-op: strings are already UTF-8
            }
            other => {
                tracing::warn!(
                    encoding = other,
                    "Unsupported encoding layer, returning raw data"
                );
                return result;
            }
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Frames and formats
// ---------------------------------------------------------------------------

/// One transport frame. JSON connections use text frames, MessagePack
/// connections use binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// Wire encoding, chosen once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Format {
    #[default]
    #[serde(rename = "msgpack")]
    MsgPack,
    #[serde(rename = "json")]
    Json,
}

impl Format {
    /// Value of the `format` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::MsgPack => "msgpack",
            Format::Json => "json",
        }
    }

    pub fn encode(&self, msg: &ProtocolMessage) -> Result<Frame, Error> {
        match self {
            Format::MsgPack => Ok(Frame::Binary(encode_msg(msg)?)),
            Format::Json => Ok(Frame::Text(serde_json::to_string(msg)?)),
        }
    }

    pub fn decode(&self, frame: &Frame) -> Result<ProtocolMessage, Error> {
        match (self, frame) {
            (Format::MsgPack, Frame::Binary(data)) => decode_msg(data),
            (Format::Json, Frame::Text(text)) => Ok(serde_json::from_str(text)?),
            (Format::MsgPack, Frame::Text(_)) => Err(Error::Decode(
                "unexpected text frame on a msgpack connection".to_string(),
            )),
            (Format::Json, Frame::Binary(_)) => Err(Error::Decode(
                "unexpected binary frame on a json connection".to_string(),
            )),
        }
    }
}

pub fn encode_msg(msg: &ProtocolMessage) -> Result<Vec<u8>, Error> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

pub fn decode_msg(data: &[u8]) -> Result<ProtocolMessage, Error> {
    // Three-step decode: msgpack → rmpv::Value → serde_json::Value → ProtocolMessage.
    //
    // 1. rmpv::Value handles msgpack binary data (which serde_json::Value cannot).
    // 2. serde_json::Value deduplicates map keys (Ably may send "messages" twice,
    //    which rmp_serde's struct deserializer rejects).
    let mut cursor = std::io::Cursor::new(data);
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| Error::Decode(format!("msgpack decode error: {e}")))?;
    let json = rmpv_to_json(value);
    serde_json::from_value(json).map_err(|e| Error::Decode(format!("message decode error: {e}")))
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> serde_json::Value {
    match value {
        rmpv::Value::Nil => serde_json::Value::Null,
        rmpv::Value::Boolean(b) => serde_json::Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                serde_json::Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                serde_json::Value::Number(n.into())
            } else {
                serde_json::Value::Null
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(f))
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => serde_json::Value::String(s),
            None => {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                serde_json::Value::String(String::new())
            }
        },
        rmpv::Value::Binary(bytes) | rmpv::Value::Ext(_, bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes))
        }
        rmpv::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(rmpv_to_json).collect())
        }
        rmpv::Value::Map(map) => {
            let obj = map
                .into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => s.into_str().unwrap_or_else(|| {
                            tracing::warn!(
                                "msgpack map key contains invalid UTF-8, substituting empty string"
                            );
                            String::new()
                        }),
                        other => format!("{other}"),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect();
            serde_json::Value::Object(obj)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(id: &str, connection_id: &str, timestamp: i64) -> PresenceMessage {
        PresenceMessage {
            id: Some(id.to_string()),
            action: PresenceAction::Enter,
            client_id: Some("alice".to_string()),
            connection_id: Some(connection_id.to_string()),
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    #[test]
    fn encode_decode_attach() {
        let mut params = HashMap::new();
        params.insert("rewind".to_string(), "2m".to_string());
        let msg = ProtocolMessage::attach("test-channel", Some("serial-1"), true, &params);
        let data = encode_msg(&msg).unwrap();
        let decoded = decode_msg(&data).unwrap();
        assert_eq!(decoded.action, Action::Attach);
        assert_eq!(decoded.channel.as_deref(), Some("test-channel"));
        assert_eq!(decoded.channel_serial.as_deref(), Some("serial-1"));
        assert!(decoded.has_flag(flags::ATTACH_RESUME));
        assert_eq!(
            decoded
                .params
                .as_ref()
                .and_then(|p| p.get("rewind"))
                .map(String::as_str),
            Some("2m")
        );
    }

    #[test]
    fn attach_without_resume_has_no_flags() {
        let msg = ProtocolMessage::attach("c", None, false, &HashMap::new());
        assert_eq!(msg.flags, None);
        assert_eq!(msg.params, None);
        assert!(!msg.has_flag(flags::ATTACH_RESUME));
    }

    #[test]
    fn encode_decode_connected() {
        let msg = ProtocolMessage {
            action: Action::Connected,
            connection_id: Some("abc123".to_string()),
            connection_key: Some("abc123!key".to_string()),
            flags: Some(flags::RESUMED),
            connection_details: Some(ConnectionDetails {
                connection_state_ttl: Some(120000),
                max_idle_interval: Some(15000),
                max_message_size: Some(16384),
                server_id: Some("frontend.0".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let data = encode_msg(&msg).unwrap();
        let decoded = decode_msg(&data).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.has_flag(flags::RESUMED));
    }

    #[test]
    fn encode_decode_ack_with_results() {
        let msg = ProtocolMessage {
            action: Action::Ack,
            msg_serial: Some(3),
            count: Some(2),
            res: Some(vec![
                PublishResult {
                    serials: vec![Some("s1".to_string())],
                },
                PublishResult {
                    serials: vec![None],
                },
            ]),
            ..Default::default()
        };
        let decoded = decode_msg(&encode_msg(&msg).unwrap()).unwrap();
        assert_eq!(decoded.msg_serial, Some(3));
        assert_eq!(decoded.count, Some(2));
        assert_eq!(decoded.res.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn encode_decode_error() {
        let msg = ProtocolMessage {
            action: Action::Error,
            error: Some(ErrorInfo::new(40142, Some(401), "Token expired")),
            ..Default::default()
        };
        let data = encode_msg(&msg).unwrap();
        let decoded = decode_msg(&data).unwrap();
        assert_eq!(decoded.action, Action::Error);
        let err = decoded.error.as_ref().unwrap();
        assert_eq!(err.code, 40142);
        assert_eq!(err.status_code, Some(401));
        assert_eq!(err.message, "Token expired");
    }

    #[test]
    fn json_format_uses_text_frames() {
        let msg = ProtocolMessage {
            action: Action::Presence,
            channel: Some("room".to_string()),
            presence: Some(vec![presence("c1:0:0", "c1", 10)]),
            ..Default::default()
        };
        let frame = Format::Json.encode(&msg).unwrap();
        let Frame::Text(ref text) = frame else {
            panic!("expected text frame");
        };
        assert!(text.contains(r#""action":14"#));
        assert!(text.contains(r#""connectionId":"c1""#));
        assert_eq!(Format::Json.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn format_rejects_mismatched_frame_kind() {
        let frame = Format::MsgPack
            .encode(&ProtocolMessage::new(Action::Heartbeat))
            .unwrap();
        assert!(matches!(Format::Json.decode(&frame), Err(Error::Decode(_))));
        assert!(matches!(
            Format::MsgPack.decode(&Frame::Text("{}".to_string())),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn unknown_action_decodes() {
        let decoded: ProtocolMessage = serde_json::from_str(r#"{"action":21}"#).unwrap();
        assert_eq!(decoded.action, Action::Unknown(21));
        assert_eq!(i32::from(decoded.action), 21);
    }

    #[test]
    fn unknown_presence_action_is_rejected() {
        let result: Result<PresenceMessage, _> = serde_json::from_str(r#"{"action":9}"#);
        assert!(result.is_err());
    }

    #[test]
    fn binary_data_decodes_as_base64_string() {
        let value = rmpv::Value::Map(vec![
            (rmpv::Value::from("action"), rmpv::Value::from(15)),
            (
                rmpv::Value::from("messages"),
                rmpv::Value::Array(vec![rmpv::Value::Map(vec![(
                    rmpv::Value::from("data"),
                    rmpv::Value::Binary(b"hello".to_vec()),
                )])]),
            ),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        let decoded = decode_msg(&buf).unwrap();
        let data = decoded.messages.unwrap()[0].data.clone();
        assert_eq!(data, Some(serde_json::json!("aGVsbG8=")));
    }

    #[test]
    fn ack_required_only_for_message_and_presence() {
        assert!(ProtocolMessage::new(Action::Message).ack_required());
        assert!(ProtocolMessage::new(Action::Presence).ack_required());
        assert!(!ProtocolMessage::new(Action::Attach).ack_required());
        assert!(!ProtocolMessage::new(Action::Heartbeat).ack_required());
    }

    // -- merging ------------------------------------------------------------

    fn publish(channel: &str, messages: Vec<Message>) -> ProtocolMessage {
        ProtocolMessage {
            action: Action::Message,
            channel: Some(channel.to_string()),
            messages: Some(messages),
            ..Default::default()
        }
    }

    #[test]
    fn merge_same_channel() {
        let mut a = publish("c", vec![Message::new("a", "1")]);
        let b = publish("c", vec![Message::new("b", "2")]);
        assert!(a.merge_from(&b, 1024));
        assert_eq!(a.messages.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn merge_refuses_different_channel_or_action() {
        let mut a = publish("c", vec![Message::new("a", "1")]);
        assert!(!a.merge_from(&publish("other", vec![Message::new("b", "2")]), 1024));
        let mut attach = ProtocolMessage::new(Action::Attach);
        assert!(!attach.merge_from(&ProtocolMessage::new(Action::Attach), 1024));
    }

    #[test]
    fn merge_refuses_over_size_limit() {
        let mut a = publish("c", vec![Message::new("a", "x".repeat(10))]);
        let b = publish("c", vec![Message::new("b", "y".repeat(10))]);
        assert!(!a.merge_from(&b, 20));
        assert_eq!(a.messages.as_ref().map(Vec::len), Some(1));
        assert!(a.merge_from(&b, 22));
    }

    #[test]
    fn merge_refuses_explicit_ids_and_mixed_client_ids() {
        let mut with_id = Message::new("a", "1");
        with_id.id = Some("custom".to_string());
        let mut a = publish("c", vec![with_id]);
        assert!(!a.merge_from(&publish("c", vec![Message::new("b", "2")]), 1024));

        let mut alice = Message::new("a", "1");
        alice.client_id = Some("alice".to_string());
        let mut a = publish("c", vec![alice]);
        assert!(!a.merge_from(&publish("c", vec![Message::new("b", "2")]), 1024));
    }

    // -- presence newness ---------------------------------------------------

    #[test]
    fn member_key_is_client_then_connection() {
        assert_eq!(presence("c1:0:0", "c1", 0).member_key(), "alice:c1");
    }

    #[test]
    fn newer_by_msg_serial_then_index() {
        let older = presence("c1:5:0", "c1", 100);
        let newer = presence("c1:6:0", "c1", 50);
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));

        let first = presence("c1:6:1", "c1", 0);
        let second = presence("c1:6:2", "c1", 0);
        assert!(second.is_newer_than(&first));
        assert!(!first.is_newer_than(&first));
    }

    #[test]
    fn serial_comparison_is_numeric_aware() {
        let nine = presence("c1:9:0", "c1", 0);
        let ten = presence("c1:10:0", "c1", 0);
        assert!(ten.is_newer_than(&nine));
        assert!(!nine.is_newer_than(&ten));
        let padded = presence("c1:010:0", "c1", 0);
        assert!(!padded.is_newer_than(&ten));
    }

    #[test]
    fn synthesized_messages_compare_timestamps() {
        let real = presence("c1:9:0", "c1", 100);
        let synthesized = presence("synthetic:0:0", "c1", 100);
        assert!(synthesized.is_synthesized());
        assert!(synthesized.is_newer_than(&real));
        let stale = presence("synthetic:0:0", "c1", 99);
        assert!(!stale.is_newer_than(&real));
    }

    // -- data encoding ------------------------------------------------------

    #[test]
    fn encode_data_stringifies_objects() {
        let (data, encoding) = encode_data(Some(serde_json::json!({"a": 1})), None);
        assert_eq!(data, Some(serde_json::json!(r#"{"a":1}"#)));
        assert_eq!(encoding.as_deref(), Some("json"));

        let (data, encoding) = encode_data(Some(serde_json::json!("plain")), None);
        assert_eq!(data, Some(serde_json::json!("plain")));
        assert_eq!(encoding, None);
    }

    #[test]
    fn decode_data_no_encoding() {
        let data = serde_json::json!({"key": "value"});
        assert_eq!(decode_data(data.clone(), None), data);
        assert_eq!(decode_data(data.clone(), Some("")), data);
    }

    #[test]
    fn decode_data_utf8_json_encoding() {
        let data = serde_json::json!(r#"[1,2,3]"#);
        let result = decode_data(data, Some("utf-8/json"));
        assert_eq!(result, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn decode_data_base64_encoding() {
        // "hello" in base64
        let data = serde_json::json!("aGVsbG8=");
        let result = decode_data(data, Some("base64"));
        assert_eq!(result, serde_json::json!([104, 101, 108, 108, 111]));
    }

    #[test]
    fn decode_data_unsupported_encoding() {
        let data = serde_json::json!("encoded-data");
        let result = decode_data(data.clone(), Some("cipher+aes-256-cbc"));
        assert_eq!(result, data);
    }
}
