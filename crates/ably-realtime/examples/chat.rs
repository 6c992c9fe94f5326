//! Join an Ably channel, print what arrives and publish each line of stdin.
//!
//! ```sh
//! cargo run -p ably-realtime --example chat -- <API_KEY> <CHANNEL> [CLIENT_ID]
//! ```
//!
//! Or pass the API key via environment variable:
//! ```sh
//! ABLY_API_KEY=keyName:keySecret cargo run -p ably-realtime --example chat \
//!     -- <CHANNEL> [CLIENT_ID]
//! ```
//!
//! Message data is printed to stdout (pipe to `jq` for formatting); state
//! changes and presence go to stderr.

use ably_realtime::{ChannelState, ClientOptions, ConnectionState, Realtime};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_key = std::env::var("ABLY_API_KEY").ok();

    let (api_key, channel, client_id) = if let Some(ref key) = env_key {
        let channel = args.first().ok_or("usage: chat <CHANNEL> [CLIENT_ID]")?;
        (key.clone(), channel.clone(), args.get(1).cloned())
    } else {
        let api_key = args
            .first()
            .ok_or("usage: chat <API_KEY> <CHANNEL> [CLIENT_ID]")?;
        let channel = args
            .get(1)
            .ok_or("usage: chat <API_KEY> <CHANNEL> [CLIENT_ID]")?;
        (api_key.clone(), channel.clone(), args.get(2).cloned())
    };

    let options = ClientOptions {
        client_id: client_id.clone(),
        ..ClientOptions::with_key(api_key)
    };
    let client = Realtime::new(options)?;
    let _states = client.connection().on(None, |change| {
        let reason = change.reason.map(|e| e.to_string());
        eprintln!("[{}] {}", change.current, reason.as_deref().unwrap_or("-"));
    });
    client.connection().wait_for(ConnectionState::Connected).await?;

    let channel = client.channels().get(&channel);
    let mut messages = channel.subscribe();
    channel.wait_for(ChannelState::Attached).await?;
    eprintln!("attached to '{}'", channel.name());

    let presence = channel.presence();
    let _members = presence.on(None, |msg| {
        eprintln!(
            "[presence] {:?} {}",
            msg.action,
            msg.client_id.as_deref().unwrap_or("-")
        );
    });
    if client_id.is_some() {
        presence.enter(None).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            msg = messages.recv() => {
                let Ok(msg) = msg else { break };
                eprintln!(
                    "[message] name={} id={} ts={}",
                    msg.name.as_deref().unwrap_or("-"),
                    msg.id.as_deref().unwrap_or("-"),
                    msg.timestamp.map_or_else(|| "-".to_string(), |t| t.to_string()),
                );
                println!("{}", msg.data.unwrap_or_default());
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                channel.publish("chat", line).await?;
            }
        }
    }

    client.close();
    Ok(())
}
