//! Credentials for the realtime connection.
//!
//! The engine only asks an [`AuthProvider`] for credentials; how they are
//! produced is up to the provider. [`TokenRequestAuth`] covers the common
//! case of a server that signs TokenRequests which the client exchanges
//! with the Ably REST API.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{BoxError, Error, ErrorInfo, error_code};

const PROTOCOL_VERSION: &str = "5";
/// Renew this long before a token's advertised expiry.
pub(crate) const TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(300);

/// A future that returns a `Result<TokenRequest>`.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<TokenRequest, BoxError>> + Send>>;

/// A signed Ably TokenRequest, obtained from your server.
///
/// Your server creates this using `client.auth.createTokenRequest()` and
/// returns it to the client. The client then exchanges it with Ably's REST API
/// for an actual token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    pub timestamp: i64,
    pub nonce: String,
    pub mac: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// The token Ably's REST API returns for a TokenRequest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    /// Expiry in ms since the epoch; `0` when unknown.
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub issued: i64,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl TokenDetails {
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// How long until the token should be proactively renewed, or `None`
    /// when the expiry is unknown.
    pub(crate) fn renew_in(&self) -> Option<Duration> {
        if self.expires <= 0 {
            return None;
        }
        let remaining_ms = (self.expires - now_ms()).max(0) as u64;
        let margin_ms = TOKEN_RENEWAL_MARGIN.as_millis() as u64;
        Some(Duration::from_millis(remaining_ms.saturating_sub(margin_ms)))
    }
}

/// What the transport presents to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(TokenDetails),
    /// Full API key, sent as the `key` query parameter.
    Key(String),
}

impl Credentials {
    pub(crate) fn token(&self) -> Option<&TokenDetails> {
        match self {
            Credentials::Token(details) => Some(details),
            Credentials::Key(_) => None,
        }
    }
}

/// Supplies credentials to the engine.
///
/// `current_credentials` is called before every connection attempt and may
/// return a cached token. `renew` must fetch a fresh one; it is called after
/// the service rejects a token or asks for re-authentication.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_credentials(&self) -> Result<Credentials, Error>;

    async fn renew(&self) -> Result<Credentials, Error>;

    /// Whether [`renew`](Self::renew) can produce anything new. When it
    /// cannot, token errors are treated as fatal.
    fn can_renew(&self) -> bool {
        true
    }
}

/// A fixed token with no means of renewal.
#[derive(Debug, Clone)]
pub struct StaticToken(pub TokenDetails);

#[async_trait]
impl AuthProvider for StaticToken {
    async fn current_credentials(&self) -> Result<Credentials, Error> {
        Ok(Credentials::Token(self.0.clone()))
    }

    async fn renew(&self) -> Result<Credentials, Error> {
        Err(ErrorInfo::new(
            error_code::TOKEN_NOT_RENEWABLE,
            Some(401),
            "token expired and no means of renewal was provided",
        )
        .into())
    }

    fn can_renew(&self) -> bool {
        false
    }
}

/// Basic auth with a full API key.
#[derive(Clone)]
pub struct ApiKey(pub String);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.0.split(':').next().unwrap_or_default();
        f.debug_tuple("ApiKey").field(&name).finish()
    }
}

#[async_trait]
impl AuthProvider for ApiKey {
    async fn current_credentials(&self) -> Result<Credentials, Error> {
        Ok(Credentials::Key(self.0.clone()))
    }

    async fn renew(&self) -> Result<Credentials, Error> {
        self.current_credentials().await
    }

    fn can_renew(&self) -> bool {
        false
    }
}

/// Obtains TokenRequests from a callback (typically your own server) and
/// exchanges them for tokens via `POST /keys/{keyName}/requestToken`.
pub struct TokenRequestAuth {
    get_token: Box<dyn Fn() -> TokenFuture + Send + Sync>,
    rest_host: String,
    tls: bool,
    http: reqwest::Client,
    cached: Mutex<Option<TokenDetails>>,
}

impl TokenRequestAuth {
    pub fn new(get_token: Box<dyn Fn() -> TokenFuture + Send + Sync>) -> Self {
        Self {
            get_token,
            rest_host: "rest.ably.io".to_string(),
            tls: true,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    pub fn rest_host(mut self, host: impl Into<String>) -> Self {
        self.rest_host = host.into();
        self
    }

    /// Use plain HTTP for the token exchange (local test servers).
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    async fn fetch(&self) -> Result<TokenDetails, Error> {
        tracing::info!("Requesting token");
        let token_request = (self.get_token)().await.map_err(Error::TokenFetch)?;
        let details =
            exchange_token(&self.http, &token_request, &self.rest_host, self.tls).await?;
        tracing::info!(expires = details.expires, "Token obtained");
        Ok(details)
    }
}

impl std::fmt::Debug for TokenRequestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequestAuth")
            .field("rest_host", &self.rest_host)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthProvider for TokenRequestAuth {
    async fn current_credentials(&self) -> Result<Credentials, Error> {
        let mut cached = self.cached.lock().await;
        if let Some(details) = cached.as_ref()
            && details.renew_in().is_none_or(|d| !d.is_zero())
        {
            return Ok(Credentials::Token(details.clone()));
        }
        let details = self.fetch().await?;
        *cached = Some(details.clone());
        Ok(Credentials::Token(details))
    }

    async fn renew(&self) -> Result<Credentials, Error> {
        let mut cached = self.cached.lock().await;
        let details = self.fetch().await?;
        *cached = Some(details.clone());
        Ok(Credentials::Token(details))
    }
}

/// Exchange a TokenRequest for a TokenDetails via Ably's REST API.
pub(crate) async fn exchange_token(
    client: &reqwest::Client,
    token_request: &TokenRequest,
    host: &str,
    tls: bool,
) -> Result<TokenDetails, Error> {
    let scheme = if tls { "https" } else { "http" };
    let url = format!(
        "{scheme}://{host}/keys/{}/requestToken",
        token_request.key_name
    );
    let resp = client
        .post(&url)
        .header("X-Ably-Version", PROTOCOL_VERSION)
        .json(token_request)
        .send()
        .await?
        .error_for_status()?
        .json::<TokenDetails>()
        .await?;
    Ok(resp)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_request_json_round_trip() {
        let tr = TokenRequest {
            key_name: "xVLyHw.mDYnFA".to_string(),
            timestamp: 1700000000000,
            nonce: "abc123".to_string(),
            mac: "base64mac==".to_string(),
            capability: r#"{"channel":["subscribe"]}"#.to_string(),
            ttl: Some(3600000),
            client_id: None,
        };
        let json = serde_json::to_string(&tr).unwrap();
        assert!(json.contains("keyName"));
        assert!(!json.contains("clientId"));

        let parsed: TokenRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key_name, "xVLyHw.mDYnFA");
        assert_eq!(parsed.ttl, Some(3600000));
    }

    #[test]
    fn token_details_tolerates_missing_fields() {
        let details: TokenDetails = serde_json::from_str(r#"{"token": "abc"}"#).unwrap();
        assert_eq!(details.token, "abc");
        assert_eq!(details.expires, 0);
        assert!(details.renew_in().is_none());
    }

    #[test]
    fn renewal_leaves_margin_before_expiry() {
        let details = TokenDetails {
            token: "t".into(),
            expires: now_ms() + 3_600_000,
            ..Default::default()
        };
        let renew_in = details.renew_in().unwrap();
        assert!(renew_in <= Duration::from_secs(3300));
        assert!(renew_in > Duration::from_secs(3290));
    }

    #[test]
    fn nearly_expired_token_renews_immediately() {
        let details = TokenDetails {
            token: "t".into(),
            expires: now_ms() + 1000,
            ..Default::default()
        };
        assert_eq!(details.renew_in(), Some(Duration::ZERO));
    }

    #[test]
    fn api_key_debug_hides_secret() {
        let key = ApiKey("app.key:secret".into());
        let debug = format!("{key:?}");
        assert!(debug.contains("app.key"));
        assert!(!debug.contains("secret"));
    }

    #[tokio::test]
    async fn static_token_cannot_renew() {
        let auth = StaticToken(TokenDetails::from_token("tok"));
        assert!(!auth.can_renew());
        let creds = auth.current_credentials().await.unwrap();
        assert_eq!(creds.token().map(|t| t.token.as_str()), Some("tok"));
        let err = auth.renew().await.unwrap_err();
        assert!(matches!(err, Error::Ably(info) if info.code == error_code::TOKEN_NOT_RENEWABLE));
    }
}
