//! ntsync - publish/subscribe entry synchronization for small control networks
//!
//! ntsync shares named, typed values between one server and its clients over
//! a point-to-point link. It is the synchronization core only: the byte-level
//! transport and the handshake are supplied by the embedding program.
//!
//! # Key Features
//!
//! - **Server-assigned ids**: entries are keyed by name; the server hands out
//!   compact integer ids per connection
//! - **Wraparound sequence numbers**: a 16-bit per-entry version resolves
//!   out-of-order updates, last writer wins
//! - **Batched writes**: local changes are buffered and flushed on a fixed
//!   period, with keep-alives when idle
//! - **At most one queued transmission per entry per flush**, however often
//!   it is written
//! - **Listeners** for the whole store, one table, one key or sub-table
//!   discovery, plus async watchers
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use anyhow::Result;
//! use ntsync::transport::TransactionSink;
//! use ntsync::types::{EntrySnapshot, Role, SequenceNumber};
//! use ntsync::write_manager::WriteManagerConfig;
//! use ntsync::Node;
//!
//! struct NullSink;
//!
//! impl TransactionSink for NullSink {
//!     fn send_assignment(&self, _entry: &EntrySnapshot) -> Result<()> { Ok(()) }
//!     fn send_update(&self, _entry: &EntrySnapshot, _seq: SequenceNumber) -> Result<()> { Ok(()) }
//!     fn flush(&self) -> Result<()> { Ok(()) }
//!     fn send_keep_alive(&self) -> Result<()> { Ok(()) }
//! }
//!
//! let node = Node::new(Role::Client, Arc::new(NullSink), WriteManagerConfig::default());
//! node.put_double("/Drive/speed", 1.0).unwrap();
//! assert_eq!(node.get_double("/Drive/speed").unwrap(), 1.0);
//! ```
//!
//! # Architecture
//!
//! - [`store::EntryStore`] - the entries and both of their indices, behind one lock
//! - [`node::Node`] - typed access, connection state and wiring
//! - [`write_manager::WriteManager`] - double-buffered outbound queues and the flush thread
//! - [`dirtier::TransactionDirtier`] - drops repeat transmissions within one flush
//! - [`listener`] - change listeners and the adapters narrowing them
//!
//! # Non-goals
//!
//! - Exactly-once delivery
//! - Durable persistence
//! - Conflict resolution beyond last-writer-wins by sequence number
//! - Authentication or encryption

pub mod codec;
pub mod dirtier;
pub mod entry;
pub mod error;
pub mod listener;
pub mod node;
pub mod store;
pub mod transport;
pub mod types;
pub mod write_manager;

pub use error::{Result, TableError};
pub use node::Node;

#[cfg(test)]
mod tests;
