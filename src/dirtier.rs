use std::sync::Arc;

use tracing::trace;

use crate::entry::Entry;
use crate::transport::{TransactionKind, TransactionReceiver};
use crate::types::{EntryHandle, EntrySnapshot};

/// A transaction decided under the store lock and delivered after it is
/// released, so receivers never run with the store locked.
pub struct PendingTransaction {
    target: Arc<dyn TransactionReceiver>,
    kind: TransactionKind,
    entry: EntrySnapshot,
}

impl PendingTransaction {
    pub fn new(
        target: Arc<dyn TransactionReceiver>,
        kind: TransactionKind,
        entry: EntrySnapshot,
    ) -> Self {
        Self {
            target,
            kind,
            entry,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn entry(&self) -> &EntrySnapshot {
        &self.entry
    }

    pub fn deliver(self) {
        self.target.offer(self.kind, &self.entry);
    }
}

/// Lets an entry through to the outgoing receiver at most once per flush.
///
/// An entry stays dirty from the moment it is queued until the write manager
/// drains it; further writes in between only change the value the flush will
/// pick up.
#[derive(Clone)]
pub struct TransactionDirtier {
    target: Arc<dyn TransactionReceiver>,
}

impl TransactionDirtier {
    pub fn new(target: Arc<dyn TransactionReceiver>) -> Self {
        Self { target }
    }

    /// Must be called with the store lock held, since `entry` is shared state.
    pub fn offer(
        &self,
        kind: TransactionKind,
        handle: EntryHandle,
        entry: &mut Entry,
    ) -> Option<PendingTransaction> {
        if entry.is_dirty() {
            trace!(name = entry.name(), ?kind, "Entry already queued, dropping");
            return None;
        }
        entry.mark_dirty();
        Some(PendingTransaction::new(
            self.target.clone(),
            kind,
            entry.snapshot(handle),
        ))
    }
}
