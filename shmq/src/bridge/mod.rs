//! IPC bridge between the host and worker processes.
//!
//! Payload bytes live in a named shared-memory segment; the two sides hand the
//! segment back and forth by exchanging length tokens over a pair of message queues.
//!
//! # Architecture
//!
//! - **segment**: named shm object, page-rounded and grown on demand
//! - **channel**: the two message queues, one inbound per side
//! - **protocol**: control token encoding (decimal payload length)

pub mod channel;
pub mod protocol;
pub mod segment;
