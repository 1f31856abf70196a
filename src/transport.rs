//! Seams between the synchronization core and the outside world.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{EntrySnapshot, SequenceNumber};

/// Conceptual message kinds of the link protocol. Only assignments, updates
/// and keep-alives are produced by this crate; the hello messages belong to
/// the handshake layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    KeepAlive = 0x00,
    ClientHello = 0x01,
    ProtocolVersionUnsupported = 0x02,
    ServerHelloComplete = 0x03,
    EntryAssignment = 0x10,
    FieldUpdate = 0x11,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => MessageKind::KeepAlive,
            0x01 => MessageKind::ClientHello,
            0x02 => MessageKind::ProtocolVersionUnsupported,
            0x03 => MessageKind::ServerHelloComplete,
            0x10 => MessageKind::EntryAssignment,
            0x11 => MessageKind::FieldUpdate,
            _ => return None,
        })
    }
}

/// Outbound side of the wire transport. Driven only by the write manager.
///
/// Methods run inside the write manager's flush. Writing to the same node
/// from them is allowed, but those writes wait for the next tick; flushing
/// that node from them deadlocks.
pub trait TransactionSink: Send + Sync {
    /// Announces an entry: id, name, type, sequence number and value.
    fn send_assignment(&self, entry: &EntrySnapshot) -> Result<()>;

    /// Sends a new value for an already announced entry.
    fn send_update(&self, entry: &EntrySnapshot, sequence: SequenceNumber) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn send_keep_alive(&self) -> Result<()>;
}

/// Whether a transaction introduces an entry or changes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Assignment,
    Update,
}

/// Consumer of accepted store changes.
///
/// The store holds one for locally originated changes (normally the write
/// manager, behind a [`crate::dirtier::TransactionDirtier`]) and optionally
/// one for remotely originated changes, e.g. to fan them out to other peers.
pub trait TransactionReceiver: Send + Sync {
    fn offer_assignment(&self, entry: &EntrySnapshot);

    fn offer_update(&self, entry: &EntrySnapshot);

    fn offer(&self, kind: TransactionKind, entry: &EntrySnapshot) {
        match kind {
            TransactionKind::Assignment => self.offer_assignment(entry),
            TransactionKind::Update => self.offer_update(entry),
        }
    }
}
