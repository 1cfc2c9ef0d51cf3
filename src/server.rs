//! # Subscriber Endpoint
//!
//! Line-delimited JSON over TCP for operator consoles.
//!
//! Every message in either direction is one JSON object
//! `{"event": <name>, "data": <payload>}` on its own line.
//!
//! | Client event | Data                                   | Reply                  |
//! |--------------|----------------------------------------|------------------------|
//! | `cmd`        | `{"auth": token, "cmd": {path: value}}` or `{"auth": token, "reboot": null}` | `bad-auth` / `error` on failure |
//! | `get-data`   | `{"ids": [path, ..], "last_n": n}`     | `deliver-data`         |
//! | `try-auth`   | passphrase                             | `auth` / `bad-auth`    |
//! | `de-auth`    | token                                  | `error` on failure     |
//! | `new-log`    | log name                               | `error` on failure     |
//!
//! Each applied telemetry update is pushed to every client as `new`. Every
//! client has its own task, so a slow console only delays itself.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::gateway::GatewayContext;
use crate::schema::Command;
use crate::uplink::protocol::read_line_limited;

/// Longest console line accepted, newline included
pub const MAX_CONSOLE_LINE_BYTES: usize = 64 * 1024;

/// Message received from a console
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    Cmd(Map<String, Value>),
    GetData { ids: Vec<String>, last_n: usize },
    TryAuth(String),
    DeAuth(String),
    NewLog(String),
}

/// Message sent to a console
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    New(Arc<Value>),
    DeliverData(IndexMap<String, Vec<Value>>),
    Auth(String),
    BadAuth,
    Error(String),
}

/// Accept consoles until `cancel` fires, then wait for their tasks.
pub async fn serve(listener: TcpListener, context: GatewayContext, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("Subscriber endpoint listening on tcp://{}", addr),
        Err(e) => warn!("Subscriber endpoint has no local address: {}", e),
    }

    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Console connected from {}", peer);
                    let context = context.clone();
                    let cancel = cancel.clone();
                    clients.spawn(async move {
                        match handle_client(stream, context, cancel).await {
                            Ok(()) => info!("Console {} disconnected", peer),
                            Err(e) => info!("Console {} dropped: {}", peer, e),
                        }
                    });
                }
                Err(e) => warn!("Failed to accept console: {}", e),
            },
        }
    }

    while clients.join_next().await.is_some() {}
    info!("Subscriber endpoint stopped");
}

async fn handle_client(stream: TcpStream, context: GatewayContext, cancel: CancellationToken) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut updates = context.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            update = updates.recv() => match update {
                Some(event) => send(&mut writer, &ServerMessage::New(event.update)).await?,
                None => return Ok(()),
            },
            read = read_line_limited(&mut reader, &mut line, MAX_CONSOLE_LINE_BYTES) => {
                if read? == 0 {
                    return Ok(());
                }
                if !line.ends_with(b"\n") {
                    continue;
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                if !text.trim().is_empty() {
                    if let Some(reply) = handle_line(&context, &text).await {
                        send(&mut writer, &reply).await?;
                    }
                }
            }
        }
    }
}

async fn send<W>(writer: &mut W, message: &ServerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

/// Handle one console line, returning the reply if there is one.
pub async fn handle_line(context: &GatewayContext, line: &str) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(line) {
        Ok(message) => message,
        Err(e) => {
            debug!("Undecodable console message: {}", e);
            return Some(ServerMessage::Error(format!("undecodable message: {}", e)));
        }
    };

    match message {
        ClientMessage::Cmd(fields) => {
            let result = match parse_command(&fields) {
                Ok((token, command)) => context.submit_command(token, command).await,
                Err(e) => Err(e),
            };
            result.err().map(error_reply)
        }
        ClientMessage::GetData { ids, last_n } => match context.query(&ids, last_n).await {
            Ok(series) => Some(ServerMessage::DeliverData(series)),
            Err(e) => Some(error_reply(e)),
        },
        ClientMessage::TryAuth(passphrase) => match context.authorize(&passphrase).await {
            Ok(token) => Some(ServerMessage::Auth(token)),
            Err(e) => Some(error_reply(e)),
        },
        ClientMessage::DeAuth(token) => context.deauthorize(&token).await.err().map(error_reply),
        ClientMessage::NewLog(name) => context.new_log(&name).await.err().map(error_reply),
    }
}

fn error_reply(error: GatewayError) -> ServerMessage {
    match error {
        GatewayError::Unauthorized => ServerMessage::BadAuth,
        other => ServerMessage::Error(other.to_string()),
    }
}

/// Split a `cmd` payload into its token and command.
fn parse_command(fields: &Map<String, Value>) -> Result<(&str, Command)> {
    let token = fields.get("auth").and_then(Value::as_str).unwrap_or_default();

    let command = match (fields.get("cmd"), fields.contains_key("reboot")) {
        (Some(Value::Object(flat)), _) => Command::Set(flat.clone()),
        (Some(_), _) => {
            return Err(GatewayError::InvalidCommand("cmd must map paths to values".to_string()));
        }
        (None, true) => Command::Reboot,
        (None, false) => return Err(GatewayError::InvalidCommand("unknown command".to_string())),
    };
    Ok((token, command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn test_client_messages_decode() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"event": "get-data", "data": {"ids": ["slate.alpha"], "last_n": 2}}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::GetData {
                ids: vec!["slate.alpha".to_string()],
                last_n: 2
            }
        );

        let message: ClientMessage = serde_json::from_str(r#"{"event": "try-auth", "data": "MAGIC"}"#).unwrap();
        assert_eq!(message, ClientMessage::TryAuth("MAGIC".to_string()));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"event": "launch", "data": 1}"#).is_err());
    }

    #[test]
    fn test_server_messages_encode() {
        let encoded = serde_json::to_value(ServerMessage::New(Arc::new(json!({"alpha": 7})))).unwrap();
        assert_eq!(encoded, json!({"event": "new", "data": {"alpha": 7}}));

        let encoded = serde_json::to_value(ServerMessage::BadAuth).unwrap();
        assert_eq!(encoded, json!({"event": "bad-auth"}));

        let mut series = IndexMap::new();
        series.insert("slate.alpha".to_string(), vec![Value::Null, json!(7)]);
        let encoded = serde_json::to_value(ServerMessage::DeliverData(series)).unwrap();
        assert_eq!(encoded, json!({"event": "deliver-data", "data": {"slate.alpha": [null, 7]}}));
    }

    #[test]
    fn test_parse_command_variants() {
        let fields = json!({"auth": "t", "cmd": {"slate.valve": 1}});
        let (token, command) = parse_command(fields.as_object().unwrap()).unwrap();
        assert_eq!(token, "t");
        assert!(matches!(command, Command::Set(ref flat) if flat["slate.valve"] == json!(1)));

        let fields = json!({"auth": "t", "reboot": null});
        let (_, command) = parse_command(fields.as_object().unwrap()).unwrap();
        assert_eq!(command, Command::Reboot);

        let fields = json!({"auth": "t", "launch": true});
        assert!(parse_command(fields.as_object().unwrap()).is_err());

        let fields = json!({"cmd": 5});
        assert!(parse_command(fields.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_missing_token_parses_as_empty() {
        let fields = json!({"reboot": null});
        let (token, _) = parse_command(fields.as_object().unwrap()).unwrap();
        assert_eq!(token, "");
    }

    #[tokio::test]
    async fn test_console_session_over_tcp() {
        use crate::auth::{AuthGate, FileAuthStore};
        use crate::gateway::{Gateway, GatewaySettings};
        use crate::telemetry::AuditLog;
        use crate::uplink::transport::mocks::ScriptedConnector;
        use crate::uplink::ConnectionState;
        use tokio::net::UdpSocket;

        let dir = tempfile::TempDir::new().unwrap();
        let store = FileAuthStore::open(dir.path().join("tokens.json")).await.unwrap();
        let connector = ScriptedConnector::default();
        let mut remote = connector.accept_next();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ingest_addr = socket.local_addr().unwrap();
        let settings = GatewaySettings {
            heartbeat: None,
            ..GatewaySettings::default()
        };
        let mut gateway = Gateway::start(
            settings,
            connector,
            socket,
            AuthGate::new(Arc::new(store), "MAGIC"),
            AuditLog::disabled(),
        );

        assert_eq!(remote.read_request().await, Some(json!({"meta": "gimme"})));
        remote.reply(r#"{"alpha": {"desc": "alpha"}}"#).await;
        let mut state = gateway.context().watch_state();
        state.wait_for(|state| *state == ConnectionState::Ready).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let console_addr = listener.local_addr().unwrap();
        gateway.spawn("subscribers", serve(listener, gateway.context(), gateway.cancellation()));

        let console = TcpStream::connect(console_addr).await.unwrap();
        let (reader, mut writer) = console.into_split();
        let mut replies = BufReader::new(reader).lines();

        writer
            .write_all(b"{\"event\": \"try-auth\", \"data\": \"wrong\"}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply, json!({"event": "bad-auth"}));

        writer
            .write_all(b"{\"event\": \"try-auth\", \"data\": \"MAGIC\"}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["event"], "auth");
        let token = reply["data"].as_str().unwrap().to_string();

        let command = json!({"event": "cmd", "data": {"auth": token, "cmd": {"slate.alpha": 3}}});
        writer.write_all(format!("{}\n", command).as_bytes()).await.unwrap();
        assert_eq!(remote.read_request().await, Some(json!({"cmd": {"alpha": 3}})));
        remote.reply("{}").await;

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(br#"{"alpha": 9}"#, ingest_addr).await.unwrap();
        let pushed: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(pushed, json!({"event": "new", "data": {"alpha": 9}}));

        writer
            .write_all(b"{\"event\": \"get-data\", \"data\": {\"ids\": [\"slate.alpha\"], \"last_n\": 2}}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&replies.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply, json!({"event": "deliver-data", "data": {"slate.alpha": [null, 9]}}));

        gateway.shutdown().await;
        assert_eq!(replies.next_line().await.unwrap(), None);
    }

    async fn idle_gateway() -> crate::gateway::Gateway {
        use crate::auth::{AuthGate, MockAuthStore};
        use crate::gateway::{Gateway, GatewaySettings};
        use crate::telemetry::AuditLog;
        use crate::uplink::transport::mocks::ScriptedConnector;
        use tokio::net::UdpSocket;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = GatewaySettings {
            heartbeat: None,
            history_capacity: 10,
            ..GatewaySettings::default()
        };
        Gateway::start(
            settings,
            ScriptedConnector::default(),
            socket,
            AuthGate::new(Arc::new(MockAuthStore::new()), "MAGIC"),
            AuditLog::disabled(),
        )
    }

    #[tokio::test]
    async fn test_get_data_beyond_history_capacity_is_an_error() {
        let gateway = idle_gateway().await;
        let context = gateway.context();

        let reply = handle_line(
            &context,
            r#"{"event": "get-data", "data": {"ids": ["slate.alpha"], "last_n": 18446744073709551615}}"#,
        )
        .await;
        assert!(matches!(reply, Some(ServerMessage::Error(ref message)) if message.contains("last_n")));

        let reply = handle_line(&context, r#"{"event": "get-data", "data": {"ids": ["slate.alpha"], "last_n": 11}}"#).await;
        assert!(matches!(reply, Some(ServerMessage::Error(_))));

        let reply = handle_line(&context, r#"{"event": "get-data", "data": {"ids": ["slate.alpha"], "last_n": 10}}"#).await;
        match reply {
            Some(ServerMessage::DeliverData(series)) => assert_eq!(series["slate.alpha"], vec![Value::Null; 10]),
            other => panic!("Expected DeliverData, got: {:?}", other),
        }

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_console_line_drops_the_client() {
        use tokio::io::AsyncReadExt;

        let mut gateway = idle_gateway().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let console_addr = listener.local_addr().unwrap();
        gateway.spawn("subscribers", serve(listener, gateway.context(), gateway.cancellation()));

        let mut console = TcpStream::connect(console_addr).await.unwrap();
        let _ = console.write_all(&vec![b' '; MAX_CONSOLE_LINE_BYTES + 1024]).await;

        let mut buf = [0u8; 64];
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), console.read(&mut buf))
            .await
            .expect("client was not dropped");
        assert!(matches!(closed, Ok(0) | Err(_)));

        gateway.shutdown().await;
    }

    #[test]
    fn test_unauthorized_maps_to_bad_auth() {
        assert_eq!(error_reply(GatewayError::Unauthorized), ServerMessage::BadAuth);
        assert!(matches!(
            error_reply(GatewayError::InvalidCommand("x".into())),
            ServerMessage::Error(_)
        ));
    }
}
