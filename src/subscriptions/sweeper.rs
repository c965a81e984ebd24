//! Background idle-expiry task.

use super::SubscriptionRegistry;
use crate::config::ServerParameters;
use crossbeam_channel::{bounded, select, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(5);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often to sweep for a given idle threshold.
pub(crate) fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

/// Periodically expires idle subscriptions. Stops when dropped.
pub struct IdleSweeper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleSweeper {
    pub fn spawn(registry: Arc<SubscriptionRegistry>, parameters: Arc<ServerParameters>) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("channelcast-sweeper".to_string())
            .spawn(move || loop {
                let idle_timeout = parameters.idle_timeout();
                select! {
                    recv(shutdown_rx) -> _ => break,
                    default(sweep_interval(idle_timeout)) => {
                        let expired = registry.sweep(parameters.idle_timeout());
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "idle sweep");
                        }
                    }
                }
            })
            .expect("failed to spawn channelcast idle sweeper");

        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        // Closing the channel wakes the worker's select.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
