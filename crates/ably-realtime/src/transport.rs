//! Transport abstraction and the WebSocket implementation.
//!
//! A transport is a dumb frame pipe. It reports everything through the
//! [`TransportEvents`] handle it was opened with; each event carries the
//! transport's id so the engine can drop events from transports it has
//! already abandoned.

use std::collections::BTreeMap;
use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::auth::Credentials;
use crate::error::{Error, ErrorInfo, error_code};
use crate::protocol::{Format, Frame};

const PROTOCOL_VERSION: &str = "5";
const AGENT_STRING: &str = concat!("ably-realtime-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open; the service's CONNECTED follows as a frame.
    Opened,
    Frame(Frame),
    Closed {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    HostUnreachable,
    Timeout,
    /// HTTP status of a failed upgrade.
    BadResponse(u16),
    Refused,
    /// Retrying cannot help, e.g. a malformed endpoint.
    Fatal,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == TransportErrorKind::Fatal
    }

    pub(crate) fn to_error_info(&self) -> ErrorInfo {
        match self.kind {
            TransportErrorKind::Fatal => {
                ErrorInfo::new(error_code::FAILED, Some(400), self.message.clone())
            }
            TransportErrorKind::BadResponse(status) => ErrorInfo::new(
                error_code::DISCONNECTED,
                Some(i32::from(status)),
                self.message.clone(),
            ),
            _ => ErrorInfo::new(error_code::DISCONNECTED, None, self.message.clone()),
        }
    }
}

/// Sink for one transport's events, tagged with its id.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    id: TransportId,
    tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(id: TransportId, tx: mpsc::UnboundedSender<(TransportId, TransportEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Returns `false` once the client has shut down.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }
}

/// Everything a transport needs to reach the service.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub host: String,
    pub port: Option<u16>,
    pub tls: bool,
    pub format: Format,
    pub credentials: Credentials,
    /// Connection key of the connection to resume.
    pub resume: Option<String>,
    /// Connection key from a recovery key; ignored when `resume` is set.
    pub recover: Option<String>,
    pub client_id: Option<String>,
    pub echo: bool,
    pub extra: HashMap<String, String>,
}

impl TransportParams {
    /// The realtime endpoint with every connection parameter in the query.
    pub fn url(&self) -> Result<url::Url, Error> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let authority = match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        };
        let mut u = url::Url::parse(&format!("{scheme}://{authority}/"))?;
        {
            let mut q = u.query_pairs_mut();
            match &self.credentials {
                Credentials::Token(details) => q.append_pair("access_token", &details.token),
                Credentials::Key(key) => q.append_pair("key", key),
            };
            q.append_pair("format", self.format.as_str());
            q.append_pair("v", PROTOCOL_VERSION);
            q.append_pair("agent", AGENT_STRING);
            q.append_pair("heartbeats", "true");
            q.append_pair("echo", if self.echo { "true" } else { "false" });
            if let Some(client_id) = &self.client_id {
                q.append_pair("clientId", client_id);
            }
            if let Some(key) = &self.resume {
                q.append_pair("resume", key);
            } else if let Some(key) = &self.recover {
                q.append_pair("recover", key);
            }
            let extra: BTreeMap<_, _> = self.extra.iter().collect();
            for (k, v) in extra {
                q.append_pair(k, v);
            }
        }
        Ok(u)
    }
}

pub trait Transport: Send {
    /// Queue a frame for writing. Returns `false` if the transport is gone.
    fn send(&mut self, frame: Frame) -> bool;

    /// Close the socket. No further events are expected afterwards.
    fn close(&mut self, code: u16, reason: &str);
}

pub trait TransportFactory: Send + Sync {
    /// Start opening a transport. Completion and failure are reported
    /// through `events`, not through the return value.
    fn open(
        &self,
        params: TransportParams,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransportFactory;

enum Outbound {
    Frame(Frame),
    Close(u16, String),
}

struct WebSocketTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, frame: Frame) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    fn close(&mut self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close(code, reason.to_string()));
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn open(
        &self,
        params: TransportParams,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let url = params
            .url()
            .map_err(|e| TransportError::new(TransportErrorKind::Fatal, e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_websocket(url, rx, events));
        Ok(Box::new(WebSocketTransport { tx }))
    }
}

async fn run_websocket(
    url: url::Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
) {
    tracing::debug!(transport = events.id().0, host = ?url.host_str(), "Opening WebSocket");
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _resp)) => ws,
        Err(e) => {
            tracing::warn!(transport = events.id().0, "WebSocket connect failed: {e}");
            events.emit(TransportEvent::Error(classify(&e)));
            return;
        }
    };
    events.emit(TransportEvent::Opened);
    let (mut ws_write, mut ws_read) = ws.split();

    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        events.emit(TransportEvent::Frame(Frame::Binary(data.to_vec())));
                    }
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        events.emit(TransportEvent::Frame(Frame::Text(text.as_str().to_string())));
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                            .unwrap_or((1005, String::new()));
                        events.emit(TransportEvent::Closed { code, reason, was_clean: true });
                        return;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong frames are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        tracing::warn!(transport = events.id().0, "WebSocket error: {e}");
                        events.emit(TransportEvent::Error(classify(&e)));
                        return;
                    }
                    None => {
                        events.emit(TransportEvent::Closed {
                            code: 1006,
                            reason: "stream ended".to_string(),
                            was_clean: false,
                        });
                        return;
                    }
                }
            }

            out = outbound.recv() => {
                match out {
                    Some(Outbound::Frame(frame)) => {
                        let msg = match frame {
                            Frame::Binary(data) => tungstenite::Message::Binary(data.into()),
                            Frame::Text(text) => tungstenite::Message::Text(text.into()),
                        };
                        if let Err(e) = ws_write.send(msg).await {
                            tracing::warn!(transport = events.id().0, "WebSocket write failed: {e}");
                            events.emit(TransportEvent::Error(classify(&e)));
                            return;
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_write.send(tungstenite::Message::Close(Some(frame))).await;
                        return;
                    }
                    None => {
                        // Handle dropped by the engine
                        let _ = ws_write.close().await;
                        return;
                    }
                }
            }
        }
    }
}

fn classify(e: &tungstenite::Error) -> TransportError {
    let kind = match e {
        tungstenite::Error::Io(io) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportErrorKind::Refused,
            std::io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            _ => TransportErrorKind::HostUnreachable,
        },
        tungstenite::Error::Http(resp) => TransportErrorKind::BadResponse(resp.status().as_u16()),
        tungstenite::Error::Url(_) => TransportErrorKind::Fatal,
        _ => TransportErrorKind::Other,
    };
    TransportError::new(kind, e.to_string())
}
