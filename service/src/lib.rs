//! # Scheduler Service
//!
//! The bootstrap binary for the scheduling subsystem: loads [`Config`] from
//! the environment, runs migrations, declares broker topology, and starts
//! one scheduler daemon per schedule table plus one retry daemon per DLQ.
//! Wired together the way `examples/ticketing/src/app`'s `TicketingApp`
//! coordinator wires its resources.

#![warn(missing_docs)]

pub mod app;
pub mod config;
pub mod health;

pub use app::{AppError, ServiceApp};
pub use config::Config;
