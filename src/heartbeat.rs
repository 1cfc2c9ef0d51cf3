//! # Heartbeat Module
//!
//! Periodically queues `{"cmd":"heart"}` so the remote unit keeps hearing
//! from the ground. The heartbeat is an ordinary queued command: it is not
//! sent while disconnected and it is dropped like any other command when a
//! round trip fails.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::uplink::{CommandQueue, Request};

/// Queue a heartbeat every `period` until `cancel` fires.
///
/// The first heartbeat goes out one full period after start.
pub async fn run(queue: CommandQueue, period: Duration, cancel: CancellationToken) {
    info!("Heartbeat every {:?}", period);

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!("Queueing heartbeat");
                if queue.enqueue(Request::heartbeat()).is_err() {
                    debug!("Command uplink gone, stopping heartbeat");
                    break;
                }
            }
        }
    }

    info!("Heartbeat stopped");
}
