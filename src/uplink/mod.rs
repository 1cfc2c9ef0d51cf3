//! # Command Uplink Module
//!
//! Owns the reliable channel to the remote unit.
//!
//! This module handles:
//! - Connecting with a timeout and fetching the schema before anything else
//! - Installing each fetched schema into the shared telemetry state
//! - Draining the command queue in FIFO order, one round trip at a time
//! - Treating every timeout or reset as a lost connection: the in-flight
//!   command is dropped, never replayed, and the uplink reconnects after a
//!   fixed delay
//! - Watching the idle connection so a hang-up is noticed before the next
//!   command
//!
//! Progress is published on a `watch` channel as a [`ConnectionState`].

pub mod protocol;
pub mod transport;

use std::fmt;
use std::io;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UplinkConfig;
use crate::error::{GatewayError, Result};
use crate::schema::SchemaTree;
use crate::telemetry::{AuditKind, AuditLog, SharedTelemetry};

pub use protocol::{PendingCommand, Request};
pub use transport::{Connector, TcpConnector};

/// Where the uplink is in its connection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingSchema,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingSchema => "awaiting schema",
            ConnectionState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Producer side of the command queue
#[derive(Debug, Clone)]
pub struct CommandQueue {
    sender: mpsc::UnboundedSender<PendingCommand>,
}

impl CommandQueue {
    /// Create a queue and the receiver the uplink drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PendingCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Append a request. Never blocks, also while disconnected.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Io`] once the uplink has shut down.
    pub fn enqueue(&self, request: Request) -> Result<()> {
        self.sender.send(PendingCommand::new(request)).map_err(|_| {
            GatewayError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "command uplink has stopped"))
        })
    }
}

/// The uplink task: connection state machine plus command drain
pub struct CommandUplink<C: Connector> {
    connector: C,
    config: UplinkConfig,
    queue: mpsc::UnboundedReceiver<PendingCommand>,
    state: watch::Sender<ConnectionState>,
    telemetry: SharedTelemetry,
    audit: AuditLog,
}

impl<C: Connector> CommandUplink<C> {
    pub fn new(
        connector: C,
        config: UplinkConfig,
        queue: mpsc::UnboundedReceiver<PendingCommand>,
        telemetry: SharedTelemetry,
        audit: AuditLog,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let uplink = Self {
            connector,
            config,
            queue,
            state,
            telemetry,
            audit,
        };
        (uplink, state_rx)
    }

    /// Connect, serve and reconnect until `cancel` fires or every queue
    /// producer is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Command uplink starting, remote unit at {}", self.connector.describe());

        while let Some(stream) = self.establish(&cancel).await {
            match self.serve(stream, &cancel).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("Command link lost: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                    if !self.backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Command uplink stopped");
    }

    /// Retry [`Self::connect_once`] until it succeeds. `None` on cancel.
    async fn establish(&self, cancel: &CancellationToken) -> Option<BufReader<C::Stream>> {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return None,
                attempt = self.connect_once() => attempt,
            };

            match attempt {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    warn!("Connection attempt to {} failed: {}", self.connector.describe(), e);
                    self.set_state(ConnectionState::Disconnected);
                    if !self.backoff(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Open the transport and complete the schema handshake.
    async fn connect_once(&self) -> Result<BufReader<C::Stream>> {
        self.set_state(ConnectionState::Connecting);
        let stream = protocol::with_timeout("connect", self.config.connect_timeout(), async {
            self.connector
                .connect()
                .await
                .map_err(|e| GatewayError::reset("connect", e))
        })
        .await?;

        self.set_state(ConnectionState::AwaitingSchema);
        let mut stream = BufReader::new(stream);
        let schema = protocol::with_timeout(
            "schema fetch",
            self.config.schema_timeout(),
            protocol::fetch_schema(&mut stream),
        )
        .await?;

        self.install_schema(schema).await;
        self.set_state(ConnectionState::Ready);
        Ok(stream)
    }

    async fn install_schema(&self, schema: SchemaTree) {
        let mut telemetry = self.telemetry.write().await;
        telemetry.install_schema(schema);
        info!("Installed schema with {} telemetry points", telemetry.tree().leaf_paths().count());
        self.audit.log(AuditKind::Meta, &telemetry.tree().to_json());
    }

    /// Drain the queue over an established connection.
    ///
    /// `Ok` means the uplink should stop; `Err` means the connection is lost.
    async fn serve(&mut self, mut stream: BufReader<C::Stream>, cancel: &CancellationToken) -> Result<()> {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = self.queue.recv() => match next {
                    Some(command) => command,
                    None => {
                        info!("Command queue closed");
                        return Ok(());
                    }
                },
                idle = stream.fill_buf() => match idle {
                    Ok([]) => {
                        return Err(GatewayError::reset(
                            "idle read",
                            io::Error::new(io::ErrorKind::UnexpectedEof, "remote unit closed the connection"),
                        ));
                    }
                    Ok(unsolicited) => {
                        let len = unsolicited.len();
                        warn!(
                            "Discarding {} unsolicited bytes from the remote unit: {}",
                            len,
                            String::from_utf8_lossy(unsolicited).trim_end()
                        );
                        stream.consume(len);
                        continue;
                    }
                    Err(e) => return Err(GatewayError::reset("idle read", e)),
                },
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Dropping the stream closes the connection mid-frame
                    warn!("Shutdown interrupted {}, closing the connection", command.request);
                    return Ok(());
                }
                result = self.round_trip(&mut stream, &command) => result,
            };

            if let Err(e) = result {
                warn!("Dropping {}: {}", command.request, e);
                return Err(e);
            }
        }
    }

    /// Send one command and wait for its response line.
    async fn round_trip(&self, stream: &mut BufReader<C::Stream>, command: &PendingCommand) -> Result<()> {
        let limit = self.config.command_timeout();
        protocol::with_timeout("command write", limit, protocol::send_request(stream, &command.request)).await?;
        let line = protocol::with_timeout("command read", limit, protocol::receive_line(stream)).await?;

        match serde_json::from_str::<Value>(line.trim()) {
            Ok(response) => debug!(
                "Remote unit answered {} after {:?}: {}",
                command.request,
                command.submitted_at.elapsed(),
                response
            ),
            Err(e) => warn!("Undecodable response to {}: {}", command.request, e),
        }
        Ok(())
    }

    /// Sleep for the reconnect delay. `false` if cancelled first.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        let delay = self.config.reconnect_delay();
        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("Command uplink {} -> {}", previous, next);
        }
    }
}
