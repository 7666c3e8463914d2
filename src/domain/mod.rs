//! Messaging domain types and the broker port.

pub mod dead_letter;
pub mod event;
pub mod message;
pub mod ports;
pub mod topology;
