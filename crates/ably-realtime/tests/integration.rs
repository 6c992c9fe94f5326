use std::time::Duration;

use ably_realtime::protocol::{Action, ConnectionDetails, Frame, ProtocolMessage, flags};
use ably_realtime::{
    ChannelState, ClientOptions, ConnectionState, Format, Message, PublishResult, Realtime,
    TokenRequest, TokenRequestAuth, error_code,
};
use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct MockAblyServer {
    listener: TcpListener,
    port: u16,
}

/// One accepted WebSocket plus the query string the client connected with.
struct MockConnection {
    ws: WsStream,
    query: String,
    format: Format,
}

impl MockAblyServer {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    /// Accept one TCP connection and upgrade it, recording the request query.
    async fn accept_raw(&self, format: Format) -> Result<MockConnection, Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let mut query = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(
            tcp,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                query = req.uri().query().unwrap_or_default().to_string();
                Ok(resp)
            },
        )
        .await?;
        Ok(MockConnection { ws, query, format })
    }

    /// Accept one connection and reply with CONNECTED.
    async fn accept_and_connect(
        &self,
        conn_id: &str,
        format: Format,
    ) -> Result<MockConnection, Box<dyn std::error::Error>> {
        let mut conn = self.accept_raw(format).await?;
        conn.send(&connected(conn_id, 0)).await?;
        Ok(conn)
    }

    /// Accept one connection, reply with CONNECTED, then answer the ATTACH
    /// for `channel`.
    async fn accept_and_handshake(
        &self,
        channel: &str,
        conn_id: &str,
    ) -> Result<MockConnection, Box<dyn std::error::Error>> {
        let mut conn = self.accept_and_connect(conn_id, Format::MsgPack).await?;
        let attach = conn.read_action(Action::Attach).await?;
        assert_eq!(attach.channel.as_deref(), Some(channel));
        conn.send(&ProtocolMessage {
            channel: Some(channel.into()),
            channel_serial: Some("serial-0".into()),
            ..ProtocolMessage::new(Action::Attached)
        })
        .await?;
        Ok(conn)
    }
}

impl MockConnection {
    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), Box<dyn std::error::Error>> {
        let frame = match self.format.encode(msg)? {
            Frame::Binary(data) => tungstenite::Message::Binary(data.into()),
            Frame::Text(text) => tungstenite::Message::Text(text.into()),
        };
        self.ws.send(frame).await?;
        Ok(())
    }

    /// Next data frame from the client, skipping control frames.
    async fn read_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            let frame = self.ws.next().await.ok_or("WebSocket closed unexpectedly")??;
            match frame {
                tungstenite::Message::Binary(data) => return Ok(Frame::Binary(data.to_vec())),
                tungstenite::Message::Text(text) => {
                    return Ok(Frame::Text(text.as_str().to_string()));
                }
                tungstenite::Message::Close(_) => return Err("client closed the socket".into()),
                _ => {}
            }
        }
    }

    async fn read_protocol_msg(&mut self) -> Result<ProtocolMessage, Box<dyn std::error::Error>> {
        let frame = self.read_frame().await?;
        Ok(self.format.decode(&frame)?)
    }

    async fn read_action(
        &mut self,
        action: Action,
    ) -> Result<ProtocolMessage, Box<dyn std::error::Error>> {
        loop {
            let msg = self.read_protocol_msg().await?;
            if msg.action == action {
                return Ok(msg);
            }
        }
    }

    async fn send_message(
        &mut self,
        channel: &str,
        name: &str,
        data: serde_json::Value,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send(&ProtocolMessage {
            id: Some("srv-1".into()),
            channel: Some(channel.into()),
            channel_serial: Some("serial-1".into()),
            timestamp: Some(now_ms()),
            messages: Some(vec![Message {
                name: Some(name.into()),
                data: Some(data),
                ..Default::default()
            }]),
            ..ProtocolMessage::new(Action::Message)
        })
        .await
    }
}

fn connected(conn_id: &str, flags: i32) -> ProtocolMessage {
    let conn_key = format!("{conn_id}!key");
    ProtocolMessage {
        connection_id: Some(conn_id.into()),
        connection_key: Some(conn_key.clone()),
        connection_details: Some(ConnectionDetails {
            connection_key: Some(conn_key),
            connection_state_ttl: Some(120_000),
            max_idle_interval: Some(15_000),
            ..Default::default()
        }),
        flags: (flags != 0).then_some(flags),
        ..ProtocolMessage::new(Action::Connected)
    }
}

fn mock_token_endpoint(server: &MockServer, key_name: &str) {
    let path = format!("/keys/{key_name}/requestToken");
    let now = now_ms();
    let body = serde_json::json!({
        "token": "mock-token-abc",
        "expires": now + 3_600_000,
        "issued": now,
        "capability": "{\"*\":[\"*\"]}",
    });
    server.mock(|when, then| {
        when.method(POST).path(path);
        then.status(201)
            .header("content-type", "application/json")
            .json_body(body);
    });
}

fn token_auth(http_port: u16) -> TokenRequestAuth {
    TokenRequestAuth::new(Box::new(|| {
        Box::pin(async {
            Ok(TokenRequest {
                key_name: "testKey.testId".into(),
                timestamp: now_ms(),
                nonce: "nonce-1".into(),
                mac: "fake-mac".into(),
                capability: r#"{"*":["*"]}"#.into(),
                ttl: None,
                client_id: None,
            })
        })
    }))
    .rest_host(format!("127.0.0.1:{http_port}"))
    .tls(false)
}

fn test_client(ws_port: u16, http_port: u16, format: Format) -> Realtime {
    let options = ClientOptions {
        realtime_host: "127.0.0.1".into(),
        port: Some(ws_port),
        tls: false,
        format,
        ..Default::default()
    };
    Realtime::builder(options)
        .auth(token_auth(http_port))
        .build()
        .unwrap()
}

async fn wait_for_state(client: &Realtime, state: ConnectionState) {
    tokio::time::timeout(WAIT, client.connection().wait_for(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Test 1: connect with an exchanged token and receive a message
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_and_receive_message() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    let server = tokio::spawn(async move {
        let mut conn = ws.accept_and_handshake("test-ch", "conn-1").await.unwrap();
        conn.send_message("test-ch", "greeting", serde_json::json!({"hello": "world"}))
            .await
            .unwrap();
        // Keep the socket open until the client has read the message.
        tokio::time::sleep(Duration::from_secs(1)).await;
        conn.query
    });

    let client = test_client(ws_port, http.port(), Format::MsgPack);
    wait_for_state(&client, ConnectionState::Connected).await;
    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));

    let channel = client.channels().get("test-ch");
    let mut messages = channel.subscribe();
    let msg = tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap();
    assert_eq!(msg.name.as_deref(), Some("greeting"));
    assert_eq!(msg.data, Some(serde_json::json!({"hello": "world"})));
    assert_eq!(msg.id.as_deref(), Some("srv-1:0"));
    assert_eq!(channel.state(), ChannelState::Attached);

    let query = server.await.unwrap();
    assert!(query.contains("access_token=mock-token-abc"), "{query}");
    assert!(query.contains("format=msgpack"), "{query}");
    assert!(query.contains("heartbeats=true"), "{query}");
}

// ---------------------------------------------------------------------------
// Test 2: publish is acknowledged with serials
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_and_ack() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    tokio::spawn(async move {
        let mut conn = ws.accept_and_handshake("ch", "conn-1").await.unwrap();
        let msg = conn.read_action(Action::Message).await.unwrap();
        assert_eq!(msg.msg_serial, Some(0));
        let messages = msg.messages.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name.as_deref(), Some("event"));

        conn.send(&ProtocolMessage {
            msg_serial: Some(0),
            count: Some(1),
            res: Some(vec![PublishResult {
                serials: vec![Some("01abc@0".into())],
            }]),
            ..ProtocolMessage::new(Action::Ack)
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let client = test_client(ws_port, http.port(), Format::MsgPack);
    let channel = client.channels().get("ch");
    tokio::time::timeout(WAIT, channel.attach())
        .await
        .expect("timed out attaching")
        .unwrap();

    let result = tokio::time::timeout(WAIT, channel.publish("event", "payload"))
        .await
        .expect("timed out waiting for ACK")
        .unwrap();
    assert_eq!(result.serials, vec![Some("01abc@0".to_string())]);
}

// ---------------------------------------------------------------------------
// Test 3: JSON format uses text frames both ways
// ---------------------------------------------------------------------------

#[tokio::test]
async fn json_format_uses_text_frames() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    let server = tokio::spawn(async move {
        let mut conn = ws.accept_and_connect("conn-1", Format::Json).await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        let Frame::Text(text) = &frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let heartbeat: ProtocolMessage = serde_json::from_str(text).unwrap();
        assert_eq!(heartbeat.action, Action::Heartbeat);
        conn.send(&ProtocolMessage {
            id: heartbeat.id.clone(),
            ..ProtocolMessage::new(Action::Heartbeat)
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        conn.query
    });

    let client = test_client(ws_port, http.port(), Format::Json);
    wait_for_state(&client, ConnectionState::Connected).await;
    tokio::time::timeout(WAIT, client.connection().ping())
        .await
        .expect("timed out waiting for ping reply")
        .unwrap();

    let query = server.await.unwrap();
    assert!(query.contains("format=json"), "{query}");
}

// ---------------------------------------------------------------------------
// Test 4: reconnect after the server drops the socket resumes the connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_resumes_after_server_drop() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    let server = tokio::spawn(async move {
        let conn = ws.accept_and_handshake("ch", "conn-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(conn);

        let mut conn = ws.accept_raw(Format::MsgPack).await.unwrap();
        conn.send(&connected("conn-1", flags::RESUMED)).await.unwrap();
        conn.send_message("ch", "after-resume", serde_json::json!("ok"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        conn.query
    });

    let client = test_client(ws_port, http.port(), Format::MsgPack);
    let channel = client.channels().get("ch");
    let mut messages = channel.subscribe();
    tokio::time::timeout(WAIT, channel.wait_for(ChannelState::Attached))
        .await
        .expect("timed out attaching")
        .unwrap();

    let msg = tokio::time::timeout(WAIT, messages.recv())
        .await
        .expect("timed out waiting for message after resume")
        .unwrap();
    assert_eq!(msg.name.as_deref(), Some("after-resume"));
    assert_eq!(channel.state(), ChannelState::Attached);
    assert_eq!(client.connection().id().as_deref(), Some("conn-1"));

    let query = server.await.unwrap();
    assert!(query.contains("resume=conn-1%21key"), "{query}");
}

// ---------------------------------------------------------------------------
// Test 5: HTTP token exchange error (500) leaves the connection DISCONNECTED
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_token_exchange_error() {
    let http = MockServer::start();
    // No WS server needed, we fail before connecting
    http.mock(|when, then| {
        when.method(POST).path("/keys/testKey.testId/requestToken");
        then.status(500).body("Internal Server Error");
    });

    let client = test_client(19999, http.port(), Format::MsgPack);
    wait_for_state(&client, ConnectionState::Disconnected).await;
    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.code, error_code::AUTH_PROVIDER_FAILED);
    assert_eq!(reason.status_code, Some(500));
}

// ---------------------------------------------------------------------------
// Test 6: a forbidden token exchange fails the connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forbidden_token_exchange_fails() {
    let http = MockServer::start();
    http.mock(|when, then| {
        when.method(POST).path("/keys/testKey.testId/requestToken");
        then.status(403).body("Forbidden");
    });

    let client = test_client(19999, http.port(), Format::MsgPack);
    wait_for_state(&client, ConnectionState::Failed).await;
    let reason = client.connection().error_reason().unwrap();
    assert_eq!(reason.status_code, Some(403));
}

// ---------------------------------------------------------------------------
// Test 7: server-initiated AUTH → client renews the token in band
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_initiated_auth() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    let server = tokio::spawn(async move {
        let mut conn = ws.accept_and_connect("conn-1", Format::MsgPack).await.unwrap();
        conn.send(&ProtocolMessage::new(Action::Auth)).await.unwrap();

        let msg = tokio::time::timeout(WAIT, conn.read_action(Action::Auth))
            .await
            .expect("timed out waiting for client AUTH response")
            .unwrap();
        msg.auth.map(|auth| auth.access_token)
    });

    let client = test_client(ws_port, http.port(), Format::MsgPack);
    wait_for_state(&client, ConnectionState::Connected).await;

    let token = server.await.unwrap();
    assert_eq!(token.as_deref(), Some("mock-token-abc"));
    assert_eq!(client.connection().state(), ConnectionState::Connected);
}

// ---------------------------------------------------------------------------
// Test 8: close sends CLOSE and waits for CLOSED
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_connection() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    let server = tokio::spawn(async move {
        let mut conn = ws.accept_and_connect("conn-1", Format::MsgPack).await.unwrap();
        let close = conn.read_action(Action::Close).await.unwrap();
        conn.send(&ProtocolMessage::new(Action::Closed)).await.unwrap();
        close.action
    });

    let client = test_client(ws_port, http.port(), Format::MsgPack);
    wait_for_state(&client, ConnectionState::Connected).await;
    client.close();
    wait_for_state(&client, ConnectionState::Closed).await;

    assert_eq!(server.await.unwrap(), Action::Close);
    assert!(client.connection().id().is_none());
}

// ---------------------------------------------------------------------------
// Test 9: fatal ERROR from the server fails the connection and its channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_error_fails_channels() {
    let http = MockServer::start();
    let ws = MockAblyServer::start().await.unwrap();
    mock_token_endpoint(&http, "testKey.testId");

    let ws_port = ws.port;
    tokio::spawn(async move {
        let mut conn = ws.accept_and_handshake("ch", "conn-1").await.unwrap();
        conn.send(&ProtocolMessage {
            error: Some(ably_realtime::ErrorInfo::new(40400, Some(404), "account disabled")),
            ..ProtocolMessage::new(Action::Error)
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let client = test_client(ws_port, http.port(), Format::MsgPack);
    let channel = client.channels().get("ch");
    tokio::time::timeout(WAIT, channel.attach())
        .await
        .expect("timed out attaching")
        .unwrap();

    wait_for_state(&client, ConnectionState::Failed).await;
    assert_eq!(client.connection().error_reason().map(|e| e.code), Some(40400));
    tokio::time::timeout(WAIT, channel.wait_for(ChannelState::Failed))
        .await
        .expect("timed out waiting for channel to fail")
        .unwrap();
}
