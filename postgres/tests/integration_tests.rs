//! Integration tests for the `PostgreSQL` backend against a real `Postgres`
//! instance: [`PgScheduleStore`]'s claim/peek/cancel semantics, the
//! `schedule_rows` wake-up trigger via [`PgNotifyListener`], and
//! [`AbandonedMessageArchive`]'s write/read round trip.
//!
//! # Panics
//!
//! These tests use `expect()` and `panic!()` for setup failures, which is
//! acceptable in test code.

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::{Duration, Utc};
use futures::StreamExt;
use scheduler_core::abandonment::{AbandonedEntry, AbandonmentSink};
use scheduler_core::kind::ScheduleKind;
use scheduler_core::notify::NotificationChannel;
use scheduler_core::schedule::ScheduleState;
use scheduler_core::schedule_store::{ScheduleStore, ScheduleStoreError};
use scheduler_core::subject::SubjectKey;
use scheduler_postgres::{AbandonedMessageArchive, PgNotifyListener, PgScheduleStore};
use sqlx::postgres::PgPoolOptions;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;

async fn setup() -> (PgScheduleStore, AbandonedMessageArchive, String, testcontainers::ContainerAsync<Postgres>)
{
    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start Postgres container");
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get port");
    let database_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to Postgres");

    PgScheduleStore::migrate(&pool)
        .await
        .expect("failed to run migrations");

    let store = PgScheduleStore::new(pool.clone());
    let archive = AbandonedMessageArchive::new(pool);

    (store, archive, database_url, container)
}

#[tokio::test]
async fn insert_then_claim_then_mark_done() {
    let (store, _archive, _url, _container) = setup().await;

    let id = store
        .insert(
            "game_reminder",
            SubjectKey::new("session-1"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::milliseconds(1),
            serde_json::json!({"channel_id": "123"}),
        )
        .await
        .expect("insert failed");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (peeked_id, _due_at) = store
        .peek_next("game_reminder")
        .await
        .expect("peek failed")
        .expect("expected a pending row");
    assert_eq!(peeked_id, id);

    let row = store.claim(id, Utc::now()).await.expect("claim failed");
    assert_eq!(row.state, ScheduleState::Claimed);
    assert_eq!(row.attempt_count, 1);

    store.mark_done(id).await.expect("mark_done failed");

    let result = store.claim(id, Utc::now()).await;
    assert!(matches!(result, Err(ScheduleStoreError::AlreadyClaimed { .. })));
}

#[tokio::test]
async fn claim_before_due_fails_with_not_due() {
    let (store, _archive, _url, _container) = setup().await;

    let id = store
        .insert(
            "game_reminder",
            SubjectKey::new("session-2"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::hours(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    let result = store.claim(id, Utc::now()).await;
    assert!(matches!(result, Err(ScheduleStoreError::NotDue { .. })));
}

#[tokio::test]
async fn cancel_by_subject_prevents_later_claim() {
    let (store, _archive, _url, _container) = setup().await;

    let subject = SubjectKey::new("session-3");
    let id = store
        .insert(
            "game_reminder",
            subject.clone(),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::milliseconds(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    let cancelled = store
        .cancel_by_subject("game_reminder", &subject, None)
        .await
        .expect("cancel_by_subject failed");
    assert_eq!(cancelled, 1);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert!(store
        .peek_next("game_reminder")
        .await
        .expect("peek failed")
        .is_none());

    let result = store.claim(id, Utc::now()).await;
    assert!(matches!(result, Err(ScheduleStoreError::AlreadyClaimed { .. })));
}

#[tokio::test]
async fn mark_pending_again_requeues_for_retry() {
    let (store, _archive, _url, _container) = setup().await;

    let id = store
        .insert(
            "game_reminder",
            SubjectKey::new("session-4"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::milliseconds(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.claim(id, Utc::now()).await.expect("claim failed");

    let retry_at = Utc::now() + Duration::milliseconds(1);
    store
        .mark_pending_again(id, retry_at)
        .await
        .expect("mark_pending_again failed");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let row = store.claim(id, Utc::now()).await.expect("re-claim failed");
    assert_eq!(row.attempt_count, 2);
}

#[tokio::test]
async fn reset_stale_claims_recovers_crashed_dispatch() {
    let (store, _archive, _url, _container) = setup().await;

    let id = store
        .insert(
            "game_reminder",
            SubjectKey::new("session-5"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::milliseconds(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.claim(id, Utc::now()).await.expect("claim failed");

    let recovered = store
        .reset_stale_claims("game_reminder", Utc::now() + Duration::seconds(1))
        .await
        .expect("reset_stale_claims failed");
    assert_eq!(recovered, 1);

    let row = store.claim(id, Utc::now()).await.expect("re-claim after recovery failed");
    assert_eq!(row.attempt_count, 2);
}

#[tokio::test]
async fn cancel_exhausted_is_terminal() {
    let (store, _archive, _url, _container) = setup().await;

    let id = store
        .insert(
            "game_reminder",
            SubjectKey::new("session-6"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::milliseconds(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.claim(id, Utc::now()).await.expect("claim failed");

    store.cancel_exhausted(id).await.expect("cancel_exhausted failed");

    let result = store.claim(id, Utc::now()).await;
    assert!(matches!(result, Err(ScheduleStoreError::AlreadyClaimed { .. })));
}

#[tokio::test]
async fn insert_wakes_a_listener_on_the_schedule_wakeup_channel() {
    let (store, _archive, database_url, _container) = setup().await;

    let listener = PgNotifyListener::new(database_url);
    let mut stream = listener
        .listen(&["schedule_wakeup_game_reminder"])
        .await
        .expect("listen failed");

    // Give the LISTEN connection a moment to register before the trigger fires.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    store
        .insert(
            "game_reminder",
            SubjectKey::new("session-7"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::hours(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    let arrival = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for arrival")
        .expect("stream ended unexpectedly")
        .expect("arrival error");

    assert_eq!(arrival.table_id, "schedule_wakeup_game_reminder");
    assert!(!arrival.synthetic);
}

#[tokio::test]
async fn reschedule_earlier_wakes_a_listener() {
    let (store, _archive, database_url, _container) = setup().await;

    let id = store
        .insert(
            "game_reminder",
            SubjectKey::new("session-8"),
            ScheduleKind::new("reminder"),
            Utc::now() + Duration::days(1),
            serde_json::json!({}),
        )
        .await
        .expect("insert failed");

    let listener = PgNotifyListener::new(database_url);
    let mut stream = listener
        .listen(&["schedule_wakeup_game_reminder"])
        .await
        .expect("listen failed");

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    store
        .reschedule(id, Utc::now() + Duration::hours(1))
        .await
        .expect("reschedule failed");

    let arrival = tokio::time::timeout(std::time::Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for arrival")
        .expect("stream ended unexpectedly")
        .expect("arrival error");

    assert_eq!(arrival.table_id, "schedule_wakeup_game_reminder");
}

#[tokio::test]
async fn abandoned_message_archive_records_and_lists_entries() {
    let (_store, archive, _url, _container) = setup().await;

    archive
        .record_abandoned(AbandonedEntry {
            queue_name: "game_reminder_dispatch.dlq".to_string(),
            routing_key: "game.reminder_due".to_string(),
            body: br#"{"schedule_id":1}"#.to_vec(),
            death_count: 6,
            first_seen_at: Utc::now(),
            reason: "death_count 6 exceeds abandon threshold 5".to_string(),
        })
        .await
        .expect("record_abandoned failed");

    let count = archive
        .count_pending("game_reminder_dispatch.dlq")
        .await
        .expect("count_pending failed");
    assert_eq!(count, 1);

    let entries = archive
        .list_pending("game_reminder_dispatch.dlq", 10)
        .await
        .expect("list_pending failed");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].death_count, 6);
    assert_eq!(entries[0].reason, "death_count 6 exceeds abandon threshold 5");
}
