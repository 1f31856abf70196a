//! Conversion between structured application values and the opaque bytes
//! carried by [`Value::Complex`].

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TableError};
use crate::types::{EntryType, Value};

/// Codec for one structured value type.
pub trait ComplexCodec: Send + Sync {
    type Internal;

    /// Tag stored as the entry type of values produced by this codec. Must
    /// not be one of [`crate::types::BUILTIN_TYPE_IDS`].
    fn type_id(&self) -> u8;

    /// Decodes `external`. `previous` is the last decoded value for the same
    /// key, which codecs may reuse.
    fn internalize(
        &self,
        name: &str,
        external: &[u8],
        previous: Option<Self::Internal>,
    ) -> Result<Self::Internal>;

    fn externalize(&self, name: &str, internal: &Self::Internal, out: &mut Vec<u8>) -> Result<()>;

    fn entry_type(&self) -> EntryType {
        EntryType::Complex(self.type_id())
    }

    fn to_value(&self, name: &str, internal: &Self::Internal) -> Result<Value> {
        let mut data = Vec::new();
        self.externalize(name, internal, &mut data)?;
        Ok(Value::Complex {
            type_id: self.type_id(),
            data,
        })
    }

    fn from_value(
        &self,
        name: &str,
        value: &Value,
        previous: Option<Self::Internal>,
    ) -> Result<Self::Internal> {
        match value {
            Value::Complex { type_id, data } if *type_id == self.type_id() => {
                self.internalize(name, data, previous)
            }
            other => Err(TableError::TypeMismatch {
                name: name.to_string(),
                existing: other.entry_type(),
                requested: self.entry_type(),
            }),
        }
    }
}

/// Codec for any serde type, encoded with bincode.
pub struct BincodeCodec<T> {
    type_id: u8,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Fails if `type_id` is one of the built-in type tags.
    pub fn new(type_id: u8) -> Result<Self> {
        if EntryType::complex(type_id).is_none() {
            return Err(TableError::ReservedTypeId(type_id));
        }
        Ok(Self {
            type_id,
            _marker: PhantomData,
        })
    }
}

impl<T> ComplexCodec for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    type Internal = T;

    fn type_id(&self) -> u8 {
        self.type_id
    }

    fn internalize(&self, name: &str, external: &[u8], _previous: Option<T>) -> Result<T> {
        let (value, _) = bincode::serde::decode_from_slice(external, bincode::config::standard())
            .map_err(|err| TableError::Codec {
                name: name.to_string(),
                message: err.to_string(),
            })?;
        Ok(value)
    }

    fn externalize(&self, name: &str, internal: &T, out: &mut Vec<u8>) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(internal, bincode::config::standard())
            .map_err(|err| TableError::Codec {
                name: name.to_string(),
                message: err.to_string(),
            })?;
        out.extend_from_slice(&bytes);
        Ok(())
    }
}
