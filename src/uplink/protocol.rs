//! # Uplink Protocol
//!
//! Request frames sent to the remote unit and the line framing of its
//! responses.
//!
//! Requests are single JSON objects written without a trailing newline.
//! Every response is one newline-terminated JSON line:
//!
//! | Request              | Frame                         |
//! |----------------------|-------------------------------|
//! | Schema fetch         | `{"meta":"gimme"}`            |
//! | Command              | `{"cmd": <nested values>}`    |
//! | Heartbeat            | `{"cmd":"heart"}`             |
//! | Reboot               | `{"reboot":null}`             |

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::schema::SchemaTree;

/// Value of the schema request's `meta` key
pub const SCHEMA_REQUEST: &str = "gimme";

/// Value of the heartbeat's `cmd` key
pub const HEARTBEAT_COMMAND: &str = "heart";

/// Longest response line accepted from the remote unit, newline included
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// A request to the remote unit
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Ask for the full schema
    FetchSchema,
    /// Write the nested values under `cmd`
    Command(Value),
    /// Restart the remote unit
    Reboot,
}

impl Request {
    pub fn heartbeat() -> Self {
        Request::Command(Value::String(HEARTBEAT_COMMAND.to_string()))
    }

    pub fn to_json(&self) -> Value {
        match self {
            Request::FetchSchema => json!({ "meta": SCHEMA_REQUEST }),
            Request::Command(payload) => json!({ "cmd": payload }),
            Request::Reboot => json!({ "reboot": null }),
        }
    }

    /// Wire frame: compact JSON, no newline.
    pub fn encode(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::FetchSchema => write!(f, "schema request"),
            Request::Command(Value::String(name)) => write!(f, "{} command", name),
            Request::Command(_) => write!(f, "command"),
            Request::Reboot => write!(f, "reboot"),
        }
    }
}

/// A queued request and when it was submitted
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub request: Request,
    pub submitted_at: Instant,
}

impl PendingCommand {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            submitted_at: Instant::now(),
        }
    }
}

/// Run `future`, turning an elapsed `limit` into a transport timeout.
pub async fn with_timeout<T, F>(operation: &'static str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(limit, future)
        .await
        .unwrap_or_else(|_| Err(GatewayError::TransportTimeout { operation, after: limit }))
}

/// Write one request frame and flush it.
pub async fn send_request<S>(stream: &mut S, request: &Request) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let frame = request.encode();
    stream
        .write_all(&frame)
        .await
        .map_err(|e| GatewayError::reset("write", e))?;
    stream.flush().await.map_err(|e| GatewayError::reset("flush", e))?;
    debug!("Sent {} ({} bytes)", request, frame.len());
    Ok(())
}

/// Read one response line.
///
/// Bytes that are not UTF-8 are replaced rather than failing the read, so a
/// garbled response is a decode problem for the caller and not a reset.
///
/// # Errors
///
/// End of stream, or a line longer than [`MAX_RESPONSE_BYTES`], is reported
/// as [`GatewayError::TransportReset`].
pub async fn receive_line<S>(stream: &mut S) -> Result<String>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = read_line_limited(stream, &mut line, MAX_RESPONSE_BYTES)
        .await
        .map_err(|e| GatewayError::reset("read", e))?;
    if read == 0 {
        return Err(GatewayError::reset(
            "read",
            io::Error::new(io::ErrorKind::UnexpectedEof, "remote unit closed the connection"),
        ));
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Append the rest of the current line to `line`, newline included, without
/// letting `line` grow past `limit` bytes.
///
/// Cancel safe: bytes read before the future is dropped stay in `line` and
/// the next call carries on with the same line. Returns the number of bytes
/// this call read; 0 means end of stream.
///
/// # Errors
///
/// `InvalidData` once `line` holds `limit` bytes without a newline.
pub async fn read_line_limited<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let remaining = limit.saturating_sub(line.len()) as u64;
    let read = AsyncReadExt::take(&mut *reader, remaining)
        .read_until(b'\n', line)
        .await?;
    if line.len() >= limit && !line.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {} bytes", limit),
        ));
    }
    Ok(read)
}

/// Request the schema until a response decodes as a tree.
///
/// Undecodable responses are logged and the request is repeated on the same
/// connection. Has no deadline of its own; wrap it in [`with_timeout`].
pub async fn fetch_schema<S>(stream: &mut S) -> Result<SchemaTree>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    loop {
        send_request(stream, &Request::FetchSchema).await?;
        let line = receive_line(stream).await?;
        match SchemaTree::from_line(&line) {
            Ok(tree) => return Ok(tree),
            Err(e) => warn!("Discarding schema response: {}", e),
        }
    }
}
