//! # Scheduler Testing
//!
//! In-memory test doubles for every trait in `scheduler-core`, plus
//! controllable clocks, so the scheduler daemon and retry daemon's control
//! flow can be driven deterministically without a real Postgres or AMQP
//! instance.
//!
//! - [`clock::FixedClock`] / [`clock::ControllableClock`]: deterministic
//!   `now()`.
//! - [`notify::InMemoryNotificationChannel`]: an in-process stand-in for
//!   `LISTEN/NOTIFY`.
//! - [`schedule_store::InMemoryScheduleStore`]: a `HashMap`-backed
//!   `ScheduleStore` wired to a notification channel so it fires the same
//!   wake-ups the Postgres trigger would.
//! - [`broker::InMemoryBrokerGateway`]: per-queue buffers standing in for the
//!   AMQP broker, including DLQ routing on `nack_no_requeue`.
//! - [`abandonment::InMemoryAbandonmentSink`]: collects abandoned entries for
//!   direct assertion.
//!
//! ## Example
//!
//! ```
//! use scheduler_testing::clock::test_clock;
//! use scheduler_testing::notify::InMemoryNotificationChannel;
//! use scheduler_testing::schedule_store::InMemoryScheduleStore;
//! use scheduler_core::clock::Clock;
//! use std::sync::Arc;
//!
//! let notify = Arc::new(InMemoryNotificationChannel::new());
//! let clock: Arc<dyn Clock> = Arc::new(test_clock());
//! let _store = InMemoryScheduleStore::new(notify, clock);
//! ```

pub mod abandonment;
pub mod broker;
pub mod clock;
pub mod notify;
pub mod schedule_store;

pub use abandonment::InMemoryAbandonmentSink;
pub use broker::{InMemoryBrokerGateway, InMemoryQueueTopology};
pub use clock::{ControllableClock, FixedClock, test_clock};
pub use notify::InMemoryNotificationChannel;
pub use schedule_store::InMemoryScheduleStore;
