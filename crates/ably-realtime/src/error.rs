//! Error types shared by the connection, channel, queue and presence engines.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

/// A boxed error type for user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub mod error_code {
    pub const BAD_REQUEST: i32 = 40000;
    pub const TOKEN_ERROR_MIN: i32 = 40140;
    pub const TOKEN_ERROR_MAX: i32 = 40149;
    pub const TOKEN_EXPIRED: i32 = 40142;
    pub const TOKEN_NOT_RENEWABLE: i32 = 40171;
    pub const FORBIDDEN: i32 = 40300;
    pub const INTERNAL: i32 = 50000;
    pub const UNKNOWN_CHANNEL_ERR: i32 = 50001;
    pub const UNKNOWN_CONNECTION_ERR: i32 = 50002;
    pub const FAILED: i32 = 80000;
    pub const SUSPENDED: i32 = 80002;
    pub const DISCONNECTED: i32 = 80003;
    pub const UNABLE_TO_RECOVER: i32 = 80008;
    pub const TIMEOUT: i32 = 80014;
    pub const CLOSED: i32 = 80017;
    pub const AUTH_PROVIDER_FAILED: i32 = 80019;
    pub const CHANNEL_OPERATION_FAILED: i32 = 90000;
    pub const CHANNEL_INVALID_STATE: i32 = 90001;
    pub const CHANNEL_TIMEOUT: i32 = 90007;
    pub const PRESENCE_NO_CLIENT_ID: i32 = 91000;
    pub const PRESENCE_SYNC_FAILED: i32 = 91004;
}

/// Error details as carried on the wire and delivered to operation callers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, thiserror::Error)]
#[serde(default, rename_all = "camelCase")]
#[error("{message} (code={code})")]
pub struct ErrorInfo {
    pub code: i32,
    pub status_code: Option<i32>,
    pub message: String,
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            href: None,
        }
    }

    /// Mirrors ably-js `isRetriable()` from `connectionerrors.ts`.
    ///
    /// An error is retriable when it has no status code, is a server error (5xx),
    /// or carries a well-known connection error code even at 4xx.
    pub fn is_retriable(&self) -> bool {
        const CONNECTION_ERROR_CODES: &[i32] = &[
            error_code::DISCONNECTED,
            error_code::SUSPENDED,
            error_code::FAILED,
            error_code::CLOSED,
            error_code::UNKNOWN_CONNECTION_ERR,
            error_code::UNKNOWN_CHANNEL_ERR,
        ];
        match self.status_code {
            None => true,
            Some(sc) if sc >= 500 => true,
            Some(_) => CONNECTION_ERROR_CODES.contains(&self.code),
        }
    }

    /// Token errors can be cured by fetching fresh credentials.
    pub fn is_token_error(&self) -> bool {
        (error_code::TOKEN_ERROR_MIN..=error_code::TOKEN_ERROR_MAX).contains(&self.code)
    }

    /// Errors in the 800xx range describe the connection itself, not one message.
    pub fn is_connection_error(&self) -> bool {
        (80_000..80_100).contains(&self.code)
    }

    pub(crate) fn or_unknown(error: Option<ErrorInfo>) -> ErrorInfo {
        error.unwrap_or_else(|| {
            ErrorInfo::new(error_code::FAILED, None, "no error details from server")
        })
    }

    pub(crate) fn superseded_by_close() -> ErrorInfo {
        ErrorInfo::new(
            error_code::CLOSED,
            Some(400),
            "operation superseded by connection close",
        )
    }

    pub(crate) fn channel_detached(channel: &str) -> ErrorInfo {
        ErrorInfo::new(
            error_code::CHANNEL_INVALID_STATE,
            Some(400),
            format!("channel {channel} detached"),
        )
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Ably error: {0}")]
    Ably(#[from] ErrorInfo),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("Token exchange HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Token fetch failed: {0}")]
    TokenFetch(BoxError),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("realtime client has shut down")]
    Closed,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl Error {
    /// Convert into the `ErrorInfo` recorded as a connection's `error_reason`.
    pub(crate) fn to_error_info(&self) -> ErrorInfo {
        match self {
            Error::Ably(info) => info.clone(),
            Error::Http(e) => {
                let status = e.status().map(|s| i32::from(s.as_u16()));
                ErrorInfo::new(error_code::AUTH_PROVIDER_FAILED, status, e.to_string())
            }
            Error::TokenFetch(e) => {
                ErrorInfo::new(error_code::AUTH_PROVIDER_FAILED, None, e.to_string())
            }
            other => ErrorInfo::new(error_code::INTERNAL, Some(500), other.to_string()),
        }
    }
}
