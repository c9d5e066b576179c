//! Content-addressed block storage.
//!
//! Blocks are immutable byte sequences keyed by the blake3 hash of their
//! contents. Putting the same bytes twice yields the same address and the
//! second put is a no-op, so concurrent puts of identical content need no
//! coordination. `delete` does not check whether another chain still
//! references the block; callers own that decision.

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemStore;

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// blake3 digest of a block's bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress([u8; 32]);

impl ContentAddress {
    pub const LEN: usize = 32;

    pub fn for_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(s, &mut raw).ok()?;
        Some(Self(raw))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True if `data` hashes to this address.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::for_bytes(data) == *self
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s).ok_or_else(|| Error::InvalidArgument(format!("invalid address {:?}", s)))
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid content address"))
    }
}

/// Capability interface every block backend implements.
///
/// All methods must be safe to call concurrently from multiple tasks.
pub trait BlockStore: Send + Sync {
    /// Store a block, returning its address. Idempotent.
    fn put(&self, data: Bytes) -> Result<ContentAddress>;

    /// Fetch a block. `Error::NotFound` if absent.
    fn get(&self, address: &ContentAddress) -> Result<Bytes>;

    fn has(&self, address: &ContentAddress) -> Result<bool>;

    /// Remove a block. Removing an absent block is not an error.
    fn delete(&self, address: &ContentAddress) -> Result<()>;

    /// Every address currently held, in no particular order.
    fn list(&self) -> Result<Vec<ContentAddress>>;

    /// Size of a stored block in bytes.
    fn size(&self, address: &ContentAddress) -> Result<u64> {
        Ok(self.get(address)?.len() as u64)
    }
}

pub(crate) fn block_not_found(address: &ContentAddress) -> Error {
    Error::NotFound(format!("block not found: {}", address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_deterministic() {
        let a = ContentAddress::for_bytes(b"hello");
        let b = ContentAddress::for_bytes(b"hello");
        let c = ContentAddress::for_bytes(b"hello!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.verify(b"hello"));
        assert!(!a.verify(b"hello!"));
    }

    #[test]
    fn test_hex_parse() {
        let a = ContentAddress::for_bytes(b"block");
        let parsed: ContentAddress = a.to_hex().parse().unwrap();
        assert_eq!(a, parsed);
        assert!("not-hex".parse::<ContentAddress>().is_err());
        assert!(ContentAddress::from_hex("abcd").is_none());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let a = ContentAddress::for_bytes(b"block");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{}\"", a.to_hex()));
        let back: ContentAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
