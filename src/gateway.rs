//! # Gateway Module
//!
//! Starts and stops the gateway's long-running tasks and hands subscribers
//! a [`GatewayContext`] to talk to them.
//!
//! Tasks: command uplink, telemetry ingestion, heartbeat, plus anything
//! registered with [`Gateway::spawn`] (the subscriber endpoint). All of them
//! watch one `CancellationToken`; [`Gateway::shutdown`] cancels it and waits
//! for every task to return.

use std::future::Future;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthGate;
use crate::config::{Config, UplinkConfig};
use crate::error::{GatewayError, Result};
use crate::fanout::{Fanout, Subscription, DEFAULT_EVENT_BUFFER};
use crate::heartbeat;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::schema::{build_command, Command};
use crate::telemetry::ingest::MAX_DATAGRAM_BYTES;
use crate::telemetry::{AuditKind, AuditLog, Ingestor, SharedTelemetry, Telemetry};
use crate::uplink::{CommandQueue, CommandUplink, ConnectionState, Connector, Request};

/// Runtime knobs for [`Gateway::start`]
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub uplink: UplinkConfig,
    pub history_capacity: usize,
    /// `None` disables the heartbeat
    pub heartbeat: Option<Duration>,
    pub event_buffer: usize,
    pub max_datagram_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            uplink: UplinkConfig::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            heartbeat: Some(Duration::from_secs(60)),
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_datagram_bytes: MAX_DATAGRAM_BYTES,
        }
    }
}

impl From<&Config> for GatewaySettings {
    fn from(config: &Config) -> Self {
        Self {
            uplink: config.uplink.clone(),
            history_capacity: config.history.capacity,
            heartbeat: config.heartbeat.enabled.then(|| config.heartbeat.interval()),
            event_buffer: config.subscribers.event_buffer,
            max_datagram_bytes: config.ingest.max_datagram_bytes,
        }
    }
}

/// Subscriber-facing handle to a running gateway, cheap to clone
#[derive(Debug, Clone)]
pub struct GatewayContext {
    telemetry: SharedTelemetry,
    queue: CommandQueue,
    fanout: Fanout,
    auth: AuthGate,
    audit: AuditLog,
    state: watch::Receiver<ConnectionState>,
}

impl GatewayContext {
    /// Live updates published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.fanout.subscribe()
    }

    /// The last `last_n` recorded values of each path in `ids`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidCommand`] if `last_n` exceeds the history
    /// capacity.
    pub async fn query<I, S>(&self, ids: I, last_n: usize) -> Result<IndexMap<String, Vec<Value>>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let telemetry = self.telemetry.read().await;
        let capacity = telemetry.history().capacity();
        if last_n > capacity {
            return Err(GatewayError::InvalidCommand(format!(
                "last_n {} exceeds the history capacity of {}",
                last_n, capacity
            )));
        }
        Ok(telemetry.query(ids, last_n))
    }

    /// Audit and queue an operator command.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Unauthorized`] for an unknown token; nothing is
    ///   audited or queued
    /// - [`GatewayError::InvalidCommand`] for malformed command paths
    pub async fn submit_command(&self, token: &str, command: Command) -> Result<()> {
        if !self.auth.is_authorized(token).await {
            warn!("Rejected command with unknown token");
            return Err(GatewayError::Unauthorized);
        }

        let request = match &command {
            Command::Set(flat) => Request::Command(build_command(flat)?),
            Command::Reboot => Request::Reboot,
        };

        self.audit.log(AuditKind::Cmd, &command.audit_payload());
        info!("Queueing {}", request);
        self.queue.enqueue(request)
    }

    pub async fn authorize(&self, passphrase: &str) -> Result<String> {
        self.auth.authorize(passphrase).await
    }

    pub async fn deauthorize(&self, token: &str) -> Result<()> {
        self.auth.revoke(token).await
    }

    /// Continue the audit log in `<name>.jsonl`, starting with the current
    /// schema.
    pub async fn new_log(&self, name: &str) -> Result<()> {
        let schema = self.telemetry.read().await.tree().to_json();

        let audit = self.audit.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || audit.rotate_with(&name, AuditKind::Meta, &schema))
            .await
            .map_err(|e| GatewayError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver following every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// JSON form of the schema node at `path`.
    pub async fn schema_node(&self, path: &str) -> Result<Value> {
        let telemetry = self.telemetry.read().await;
        telemetry.tree().get(path).map(|node| node.to_json())
    }
}

/// A running gateway
pub struct Gateway {
    context: GatewayContext,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Gateway {
    /// Spawn the uplink, ingestion and heartbeat tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: Connector>(
        settings: GatewaySettings,
        connector: C,
        socket: UdpSocket,
        auth: AuthGate,
        audit: AuditLog,
    ) -> Self {
        let telemetry = Telemetry::shared(settings.history_capacity);
        let fanout = Fanout::new(settings.event_buffer);
        let (queue, receiver) = CommandQueue::channel();
        let (uplink, state) =
            CommandUplink::new(connector, settings.uplink, receiver, telemetry.clone(), audit.clone());
        let ingestor = Ingestor::new(telemetry.clone(), audit.clone(), fanout.clone());
        let cancel = CancellationToken::new();

        let mut gateway = Self {
            context: GatewayContext {
                telemetry,
                queue: queue.clone(),
                fanout,
                auth,
                audit,
                state,
            },
            cancel: cancel.clone(),
            tasks: Vec::new(),
        };

        gateway.spawn("uplink", uplink.run(cancel.clone()));
        gateway.spawn("ingest", ingestor.run(socket, settings.max_datagram_bytes, cancel.clone()));
        match settings.heartbeat {
            Some(period) => gateway.spawn("heartbeat", heartbeat::run(queue, period, cancel)),
            None => info!("Heartbeat disabled"),
        }

        gateway
    }

    pub fn context(&self) -> GatewayContext {
        self.context.clone()
    }

    /// Token every gateway task watches.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` alongside the gateway's own tasks; [`Gateway::shutdown`]
    /// waits for it too.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Starting {} task", name);
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Cancel every task and wait for all of them to return.
    pub async fn shutdown(self) {
        info!("Shutting down gateway");
        self.cancel.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => debug!("{} task finished", name),
                Err(e) => error!("{} task failed: {}", name, e),
            }
        }
        info!("Gateway stopped");
    }
}
