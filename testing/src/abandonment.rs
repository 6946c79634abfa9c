//! In-memory [`AbandonmentSink`] for asserting on abandoned dead-letter
//! messages without a Postgres-backed archive.

use scheduler_core::abandonment::{AbandonedEntry, AbandonmentError, AbandonmentSink};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Collects every abandoned entry recorded against it, in order, for direct
/// test inspection.
#[derive(Default)]
pub struct InMemoryAbandonmentSink {
    entries: Mutex<Vec<AbandonedEntry>>,
}

impl InMemoryAbandonmentSink {
    /// Build an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries recorded so far, in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<AbandonedEntry> {
        self.entries.lock().expect("abandonment sink poisoned").clone()
    }
}

impl AbandonmentSink for InMemoryAbandonmentSink {
    fn record_abandoned(
        &self,
        entry: AbandonedEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), AbandonmentError>> + Send + '_>> {
        Box::pin(async move {
            self.entries.lock().expect("abandonment sink poisoned").push(entry);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn records_entries_for_inspection() {
        let sink = InMemoryAbandonmentSink::new();
        sink.record_abandoned(AbandonedEntry {
            queue_name: "game_reminder_dispatch.dlq".to_string(),
            routing_key: "game.reminder_due".to_string(),
            body: b"{}".to_vec(),
            death_count: 6,
            first_seen_at: Utc::now(),
            reason: "death_count 6 exceeds abandon threshold 5".to_string(),
        })
        .await
        .unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].death_count, 6);
    }
}
