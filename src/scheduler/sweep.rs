//! Sweep manager for timing out checks past their deadline.

use crate::hub::Hub;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager that expires unanswered check requests.
pub struct SweepManager {
    hub: Arc<Hub>,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl SweepManager {
    pub fn new(hub: Arc<Hub>, interval: Duration) -> Self {
        Self {
            hub,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the sweep background task.
    pub fn start(&self) {
        let hub = self.hub.clone();
        let stop = self.stop.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        sweep(&hub);
                    }
                }
            }
        });
    }

    /// Stop the sweep manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn sweep(hub: &Hub) -> usize {
    let expired = hub.pending().expire(Utc::now());
    if expired > 0 {
        tracing::debug!("SweepManager: {} checks timed out", expired);
    }
    expired
}
