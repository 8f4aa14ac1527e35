//! Pluggable value serialization for entry payloads.

use crate::error::Result;
use bincode::Options as _;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Hard upper bound for any payload we will attempt to deserialize from disk.
///
/// Cache corruption should degrade to a cache miss, not an out-of-memory
/// crash: a corrupted length prefix must not be able to request an enormous
/// allocation.
pub const PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Turns an in-memory value into bytes and back.
///
/// The engine frames entry files itself (the leading tag line is
/// engine-owned), so the format only has to round-trip the value; it is
/// self-delimiting by virtue of owning the rest of the file.
pub trait Serializer<T> {
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Default serializer: bincode with fixed-width, little-endian integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for BincodeSerializer {
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode_options().serialize(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode_options()
            .with_limit(PAYLOAD_LIMIT_BYTES as u64)
            .deserialize(bytes)?)
    }
}

/// Human-readable alternative for payloads that get inspected by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T: Serialize + DeserializeOwned> Serializer<T> for JsonSerializer {
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
