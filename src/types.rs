use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection-scoped integer handle for an entry, assigned by the server.
///
/// `0xFFFF` is reserved on the wire to mean "not assigned yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u16);

impl EntryId {
    pub const UNKNOWN: EntryId = EntryId(0xFFFF);

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("unknown")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Participant-local handle to an entry slot in an [`crate::store::EntryStore`].
///
/// Unlike [`EntryId`] this never changes for the lifetime of the store, so it
/// survives reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryHandle(pub(crate) usize);

impl EntryHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// 16-bit per-entry version counter with wraparound ordering.
///
/// A number is newer than another when it lies in the forward half of the
/// number space. Updates that are stale by more than half the space are
/// indistinguishable from future ones and get rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u16);

impl SequenceNumber {
    const HALF: u16 = 1 << 15;

    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Whether `self` should replace `current`.
    pub fn is_newer_than(self, current: SequenceNumber) -> bool {
        let distance = self.0.wrapping_sub(current.0);
        distance != 0 && distance < Self::HALF
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire tags owned by the built-in types. Codec tags must avoid them.
pub const BUILTIN_TYPE_IDS: [u8; 7] = [0x00, 0x01, 0x02, 0x03, 0x10, 0x11, 0x12];

/// Type tag of an entry. Fixed when the entry is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    Boolean,
    Double,
    String,
    Raw,
    BooleanArray,
    DoubleArray,
    StringArray,
    /// Codec-defined structured type; the tag identifies the codec.
    Complex(u8),
}

impl EntryType {
    /// Tag byte used by the wire encoding.
    pub fn id(self) -> u8 {
        match self {
            EntryType::Boolean => 0x00,
            EntryType::Double => 0x01,
            EntryType::String => 0x02,
            EntryType::Raw => 0x03,
            EntryType::BooleanArray => 0x10,
            EntryType::DoubleArray => 0x11,
            EntryType::StringArray => 0x12,
            EntryType::Complex(id) => id,
        }
    }

    /// Codec type for `id`, or `None` if a built-in type owns the tag.
    pub fn complex(id: u8) -> Option<Self> {
        (!BUILTIN_TYPE_IDS.contains(&id)).then_some(EntryType::Complex(id))
    }

    /// False for a `Complex` carrying a built-in tag, which `from_id` would
    /// decode as the built-in type.
    pub fn is_valid(self) -> bool {
        match self {
            EntryType::Complex(id) => !BUILTIN_TYPE_IDS.contains(&id),
            _ => true,
        }
    }

    pub fn from_id(id: u8) -> Self {
        match id {
            0x00 => EntryType::Boolean,
            0x01 => EntryType::Double,
            0x02 => EntryType::String,
            0x03 => EntryType::Raw,
            0x10 => EntryType::BooleanArray,
            0x11 => EntryType::DoubleArray,
            0x12 => EntryType::StringArray,
            other => EntryType::Complex(other),
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::Boolean => f.write_str("boolean"),
            EntryType::Double => f.write_str("double"),
            EntryType::String => f.write_str("string"),
            EntryType::Raw => f.write_str("raw"),
            EntryType::BooleanArray => f.write_str("boolean[]"),
            EntryType::DoubleArray => f.write_str("double[]"),
            EntryType::StringArray => f.write_str("string[]"),
            EntryType::Complex(id) => write!(f, "complex({id:#04x})"),
        }
    }
}

/// Payload of an entry. Opaque to the synchronization engine apart from
/// equality, which short-circuits redundant writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    Complex { type_id: u8, data: Vec<u8> },
}

impl Value {
    pub fn entry_type(&self) -> EntryType {
        match self {
            Value::Boolean(_) => EntryType::Boolean,
            Value::Double(_) => EntryType::Double,
            Value::String(_) => EntryType::String,
            Value::Raw(_) => EntryType::Raw,
            Value::BooleanArray(_) => EntryType::BooleanArray,
            Value::DoubleArray(_) => EntryType::DoubleArray,
            Value::StringArray(_) => EntryType::StringArray,
            Value::Complex { type_id, .. } => EntryType::Complex(*type_id),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }
}

fn same_double(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

// NaN compares equal to NaN so re-putting it does not bump the version.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => same_double(*a, *b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Raw(a), Value::Raw(b)) => a == b,
            (Value::BooleanArray(a), Value::BooleanArray(b)) => a == b,
            (Value::DoubleArray(a), Value::DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| same_double(*x, *y))
            }
            (Value::StringArray(a), Value::StringArray(b)) => a == b,
            (
                Value::Complex { type_id: ta, data: da },
                Value::Complex { type_id: tb, data: db },
            ) => ta == tb && da == db,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

/// Which side of the link a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Authoritative side; assigns entry ids.
    Server,
    /// Adopts ids announced by the server.
    Client,
}

/// Point-in-time copy of an entry, handed across lock boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub handle: EntryHandle,
    pub id: EntryId,
    pub name: String,
    pub entry_type: EntryType,
    pub value: Value,
    pub sequence: SequenceNumber,
    /// Milliseconds since the Unix epoch of the last accepted change.
    pub last_change: i64,
}
