use chrono::Utc;

use crate::error::{Result, TableError};
use crate::types::{EntryHandle, EntryId, EntryType, EntrySnapshot, SequenceNumber, Value};

/// A single named, typed, versioned value.
///
/// Name and type never change after creation. The id is assigned at most once
/// per connection (see [`Entry::assign_id`] and [`Entry::clear_id`]).
#[derive(Debug, Clone)]
pub struct Entry {
    id: EntryId,
    name: String,
    entry_type: EntryType,
    value: Value,
    sequence: SequenceNumber,
    /// Still owes listeners its `is_new` notification
    is_new: bool,
    /// Queued for transmission and not flushed yet
    dirty: bool,
    last_change: i64,
}

impl Entry {
    pub fn new(name: impl Into<String>, entry_type: EntryType, value: Value) -> Self {
        Self {
            id: EntryId::UNKNOWN,
            name: name.into(),
            entry_type,
            value,
            sequence: SequenceNumber::default(),
            is_new: true,
            dirty: false,
            last_change: Utc::now().timestamp_millis(),
        }
    }

    /// Entry as decoded from a remote assignment.
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn last_change(&self) -> i64 {
        self.last_change
    }

    /// Applies a versioned write if `sequence` is newer than the current one.
    pub fn try_update(&mut self, sequence: SequenceNumber, value: Value) -> bool {
        if !sequence.is_newer_than(self.sequence) {
            return false;
        }
        self.sequence = sequence;
        self.set_value(value);
        true
    }

    /// Overwrites version and value unconditionally. Only the server's
    /// assignment may also replace the type.
    pub fn force_put(
        &mut self,
        sequence: SequenceNumber,
        value: Value,
        entry_type: Option<EntryType>,
    ) {
        if let Some(entry_type) = entry_type {
            self.entry_type = entry_type;
        }
        self.sequence = sequence;
        self.set_value(value);
    }

    fn set_value(&mut self, value: Value) {
        self.value = value;
        self.last_change = Utc::now().timestamp_millis();
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn assign_id(&mut self, id: EntryId) -> Result<()> {
        if !self.id.is_unknown() {
            return Err(TableError::IdAlreadyAssigned {
                name: self.name.clone(),
                existing: self.id,
                requested: id,
            });
        }
        self.id = id;
        Ok(())
    }

    pub fn clear_id(&mut self) {
        self.id = EntryId::UNKNOWN;
    }

    /// Returns the pending `is_new` flag and clears it.
    pub(crate) fn take_is_new(&mut self) -> bool {
        std::mem::replace(&mut self.is_new, false)
    }

    pub(crate) fn snapshot(&self, handle: EntryHandle) -> EntrySnapshot {
        EntrySnapshot {
            handle,
            id: self.id,
            name: self.name.clone(),
            entry_type: self.entry_type,
            value: self.value.clone(),
            sequence: self.sequence,
            last_change: self.last_change,
        }
    }
}
