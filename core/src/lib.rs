//! # Scheduler Core
//!
//! Core domain types and traits for the durable, event-driven scheduling
//! subsystem: schedule rows, the wake-up notification channel, and the
//! message broker gateway.
//!
//! ## Core Concepts
//!
//! - [`schedule::ScheduleRow`]: a durable record of a future event.
//! - [`schedule_store::ScheduleStore`]: the trait a scheduler daemon and its
//!   producers use to create, claim, and retire rows.
//! - [`notify::NotificationChannel`]: a content-free wake-up signal so a
//!   daemon learns about newly-relevant rows without polling alone.
//! - [`broker::BrokerGateway`]: confirmed publish and ack-controlled consume
//!   against the downstream message broker.
//!
//! ## Architecture Principles
//!
//! - Truth lives in the schedule store; notifications are only a latency
//!   optimization, never a correctness dependency.
//! - Every store/channel/gateway trait is dyn-compatible so the generic
//!   scheduler daemon (in the runtime crate) can be instantiated against
//!   concrete Postgres/AMQP implementations or in-memory test doubles
//!   without its own code changing.
//! - Dependency injection via trait objects, not global state.

pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod abandonment;
pub mod broker;
pub mod clock;
pub mod kind;
pub mod notify;
pub mod schedule;
pub mod schedule_store;
pub mod subject;
