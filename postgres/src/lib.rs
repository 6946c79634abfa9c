//! `PostgreSQL` backend for the scheduling subsystem.
//!
//! Provides [`PgScheduleStore`] (the `ScheduleStore` implementation backed by
//! the `schedule_rows` table and its `LISTEN/NOTIFY` trigger),
//! [`PgNotifyListener`] (the reconnecting notification-channel client), and
//! [`AbandonedMessageArchive`] (the archive sink for dead-letter messages the
//! retry daemon has given up on).
//!
//! # Example
//!
//! ```ignore
//! use scheduler_postgres::{PgScheduleStore, PgNotifyListener};
//! use sqlx::PgPool;
//!
//! async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//!     PgScheduleStore::migrate(&pool).await?;
//!     let store = PgScheduleStore::new(pool);
//!     let listener = PgNotifyListener::new("postgres://localhost/scheduler");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod abandoned_messages;
mod notify;
mod schedule_store;

pub use abandoned_messages::{AbandonedMessage, AbandonedMessageArchive};
pub use notify::PgNotifyListener;
pub use schedule_store::PgScheduleStore;
