//! Reliable at-least-once delivery of payment domain events over a durable broker.
//!
//! `sync` holds the concurrency primitives, `domain` the message model and the
//! [`domain::ports::Broker`] port, `application` the publish/consume protocol,
//! and `infrastructure` the broker backends.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod sync;
pub mod telemetry;
