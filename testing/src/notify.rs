//! In-memory [`NotificationChannel`] for driving scheduler daemon tests
//! without Postgres `LISTEN/NOTIFY`.

use async_stream::stream;
use scheduler_core::notify::{Arrival, ArrivalStream, NotificationChannel, NotifyError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Per-channel buffer depth. A lagging subscriber only loses latency (the
/// next arrival still triggers a re-peek), never correctness, so a small
/// bound is enough even for a fast-firing test.
const CHANNEL_CAPACITY: usize = 256;

/// An in-process, pub/sub wake-up channel keyed by channel name (i.e.
/// `table_id`), standing in for Postgres `LISTEN/NOTIFY` in tests.
///
/// Unlike the Postgres-backed listener, there is no connection to drop, so
/// arrivals are never synthetic.
#[derive(Default)]
pub struct InMemoryNotificationChannel {
    channels: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl InMemoryNotificationChannel {
    /// Build an empty channel registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<()> {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl NotificationChannel for InMemoryNotificationChannel {
    fn notify(
        &self,
        channel: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + '_>> {
        let sender = self.sender_for(channel);
        Box::pin(async move {
            // No subscribers is not an error: the next `peek_next` poll
            // still finds the row, exactly as the real trigger's NOTIFY
            // reaching zero LISTENers is not an error.
            let _ = sender.send(());
            Ok(())
        })
    }

    fn listen(
        &self,
        channels: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<ArrivalStream, NotifyError>> + Send + '_>> {
        let subscriptions: Vec<(String, broadcast::Receiver<()>)> = channels
            .iter()
            .map(|c| ((*c).to_string(), self.sender_for(c).subscribe()))
            .collect();

        Box::pin(async move {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

            for (table_id, mut receiver) in subscriptions {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(()) => {
                                let arrival = Arrival {
                                    table_id: table_id.clone(),
                                    synthetic: false,
                                };
                                if tx.send(arrival).is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
            drop(tx);

            let stream: ArrivalStream = Box::pin(stream! {
                while let Some(arrival) = rx.recv().await {
                    yield Ok(arrival);
                }
            });

            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn notify_wakes_listener() {
        let channel = InMemoryNotificationChannel::new();
        let mut stream = channel.listen(&["game_reminder"]).await.unwrap();

        channel.notify("game_reminder").await.unwrap();

        let arrival = stream.next().await.unwrap().unwrap();
        assert_eq!(arrival.table_id, "game_reminder");
        assert!(!arrival.synthetic);
    }

    #[tokio::test]
    async fn notify_before_listen_is_not_an_error() {
        let channel = InMemoryNotificationChannel::new();
        assert!(channel.notify("game_reminder").await.is_ok());
    }

    #[tokio::test]
    async fn listen_merges_multiple_channels() {
        let channel = InMemoryNotificationChannel::new();
        let mut stream = channel
            .listen(&["game_reminder", "game_status_transition"])
            .await
            .unwrap();

        channel.notify("game_status_transition").await.unwrap();

        let arrival = stream.next().await.unwrap().unwrap();
        assert_eq!(arrival.table_id, "game_status_transition");
    }
}
