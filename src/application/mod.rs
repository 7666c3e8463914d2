//! Application layer: the publish/consume protocol built on the `Broker` port.
//!
//! [`messaging::MessagingService`] wires the pieces together at startup;
//! each component can also be constructed on its own.

pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod dedup;
pub mod messaging;
pub mod publisher;
pub mod retry;
