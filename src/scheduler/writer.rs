//! Batch writer persisting validated ticks.

use crate::db::{Store, Tick};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const MAX_BATCH: usize = 500;

/// Accumulate ticks and flush them to the store in batches. Returns once
/// every sender is gone and the last batch is written.
pub async fn run_tick_writer(mut rx: mpsc::Receiver<Tick>, store: Arc<Store>) {
    let mut buffer: Vec<Tick> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            tick = rx.recv() => {
                match tick {
                    Some(t) => {
                        buffer.push(t);
                        if buffer.len() >= MAX_BATCH {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<Tick>) {
    if buffer.is_empty() {
        return;
    }

    match store.add_ticks(buffer) {
        Ok(written) if written < buffer.len() => {
            tracing::warn!("Flushed {} of {} ticks", written, buffer.len());
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Failed to flush {} ticks: {}", buffer.len(), e),
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TickStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_writer_flushes_on_close() {
        let store = Arc::new(Store::in_memory().unwrap());
        let website_id = store.add_website("u", "https://w1.example").unwrap().id;
        let (tx, rx) = mpsc::channel(16);
        let writer = tokio::spawn(run_tick_writer(rx, store.clone()));

        let tick = |website_id: &str, latency: u64| Tick {
            website_id: website_id.to_string(),
            validator_id: "v1".to_string(),
            status: TickStatus::Good,
            latency,
            timestamp: Utc::now(),
        };

        tx.send(tick(&website_id, 10)).await.unwrap();
        // A website deleted from under the writer only loses its own tick
        tx.send(tick("gone", 15)).await.unwrap();
        tx.send(tick(&website_id, 20)).await.unwrap();
        tx.send(tick(&website_id, 30)).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let ticks = store.get_ticks(&website_id).unwrap();
        assert_eq!(ticks.iter().map(|t| t.latency).collect::<Vec<_>>(), vec![10, 20, 30]);
    }
}
