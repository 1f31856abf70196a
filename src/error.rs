//! Error types for the entry synchronization core.

use thiserror::Error;

use crate::types::{EntryId, EntryType};

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// Errors surfaced by the store, node and codec layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    /// No entry exists under the queried name.
    #[error("unknown table key: {0}")]
    KeyNotDefined(String),

    /// A write targeted an existing entry declared with another type.
    #[error("key {name} already exists as {existing}, cannot use it as {requested}")]
    TypeMismatch {
        name: String,
        existing: EntryType,
        requested: EntryType,
    },

    /// The protocol tried to give an entry a second id.
    #[error("entry {name} already has id {existing}, refusing to assign {requested}")]
    IdAlreadyAssigned {
        name: String,
        existing: EntryId,
        requested: EntryId,
    },

    /// A required argument was empty.
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),

    /// A codec type id collides with a built-in type tag.
    #[error("type id {0:#04x} is reserved for a built-in type")]
    ReservedTypeId(u8),

    /// A complex value could not be converted.
    #[error("codec error for {name}: {message}")]
    Codec { name: String, message: String },
}

impl TableError {
    /// Invariant violations that should end the offending connection,
    /// as opposed to validation errors returned to the caller.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TableError::IdAlreadyAssigned { .. })
    }
}
