//! # Telemetry Ingestion
//!
//! Receives update datagrams from the remote unit and applies them.
//!
//! Each datagram is one JSON object mirroring part of the schema tree. Under
//! the telemetry write lock the update is merged, audited and recorded into
//! history; the fan-out event is published after the lock is released.
//! Datagrams that arrive before the first schema is installed are dropped.

use bytes::BytesMut;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit::{AuditKind, AuditLog};
use super::SharedTelemetry;
use crate::error::Result;
use crate::fanout::Fanout;
use crate::schema::UpdateReport;

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// What happened to one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Merged into the tree and published
    Applied(UpdateReport),
    /// Dropped because no schema is installed yet
    NoSchema,
}

/// Applies update datagrams to the shared telemetry state
#[derive(Debug, Clone)]
pub struct Ingestor {
    telemetry: SharedTelemetry,
    audit: AuditLog,
    fanout: Fanout,
}

impl Ingestor {
    pub fn new(telemetry: SharedTelemetry, audit: AuditLog, fanout: Fanout) -> Self {
        Self {
            telemetry,
            audit,
            fanout,
        }
    }

    /// Decode and apply one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::GatewayError::Decode`] for a payload that is not
    /// JSON. The tree is untouched in that case.
    pub async fn handle_datagram(&self, datagram: &[u8]) -> Result<IngestOutcome> {
        let update: Value = serde_json::from_slice(datagram)?;

        let report = {
            let mut telemetry = self.telemetry.write().await;
            if !telemetry.has_schema() {
                return Ok(IngestOutcome::NoSchema);
            }
            let report = telemetry.apply_update(&update);
            self.audit.log(AuditKind::Update, &update);
            report
        };

        self.fanout.publish(update);
        Ok(IngestOutcome::Applied(report))
    }

    /// Receive datagrams on `socket` until `cancel` fires.
    pub async fn run(self, socket: UdpSocket, max_datagram_bytes: usize, cancel: CancellationToken) {
        match socket.local_addr() {
            Ok(addr) => info!("Telemetry ingestion listening on udp://{}", addr),
            Err(e) => warn!("Telemetry ingestion socket has no local address: {}", e),
        }

        let mut buffer = BytesMut::with_capacity(max_datagram_bytes);
        loop {
            buffer.clear();
            buffer.reserve(max_datagram_bytes);

            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_buf_from(&mut buffer) => match received {
                    Ok((len, peer)) => match self.handle_datagram(&buffer[..len]).await {
                        Ok(IngestOutcome::Applied(report)) => {
                            debug!("Applied {} byte update from {} ({} leaves changed)", len, peer, report.changed);
                        }
                        Ok(IngestOutcome::NoSchema) => {
                            debug!("Dropping update from {}: no schema installed yet", peer);
                        }
                        Err(e) => debug!("Dropping datagram from {}: {}", peer, e),
                    },
                    Err(e) => warn!("Telemetry receive failed: {}", e),
                },
            }
        }

        info!("Telemetry ingestion stopped");
    }
}
