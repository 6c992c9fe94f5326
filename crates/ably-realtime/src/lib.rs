//! Ably Pub/Sub Realtime client.
//!
//! Implements the realtime protocol over a single WebSocket: connection and
//! channel state machines, publishing with acknowledgements, presence, and
//! connection resume and recovery.
//!
//! # Features
//! - API key, static token or TokenRequest authentication, with token renewal
//! - MessagePack (default) or JSON wire format
//! - Connection resume after transient disconnects, recovery across client
//!   instances via recovery keys
//! - Message queueing while connecting, resend of unacknowledged messages
//! - Channel attach/detach with automatic reattach, presence sync
//! - Heartbeat-based connection liveness detection
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), ably_realtime::Error> {
//! use ably_realtime::{ClientOptions, ConnectionState, Realtime};
//!
//! let client = Realtime::new(ClientOptions::with_key("appId.keyId:secret"))?;
//! client.connection().wait_for(ConnectionState::Connected).await?;
//!
//! let channel = client.channels().get("my-channel");
//! let mut messages = channel.subscribe();
//! channel.publish("greeting", "hello").await?;
//!
//! while let Ok(msg) = messages.recv().await {
//!     println!("got: {:?}", msg.name);
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod connection;
mod error;
mod options;
mod presence;
pub mod protocol;
mod queue;
mod realtime;
mod recovery;
mod retry;
mod timers;
pub mod transport;

pub use auth::{
    ApiKey, AuthProvider, Credentials, StaticToken, TokenDetails, TokenFuture, TokenRequest,
    TokenRequestAuth,
};
pub use channel::{ChannelEvent, ChannelState, ChannelStateChange};
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use error::{BoxError, Error, ErrorInfo, error_code};
pub use options::{ChannelOptions, ClientOptions};
pub use protocol::{Format, Message, PresenceAction, PresenceMessage, PublishResult};
pub use realtime::{
    Channels, Connection, PendingPublish, Realtime, RealtimeBuilder, RealtimeChannel,
    RealtimePresence,
};
pub use recovery::RecoveryKey;
pub use retry::{BackoffRetryDelayCalculator, JitterSource, RetryAttempt, RetryDelayCalculator};
