//! In-memory block store.

use super::{block_not_found, BlockStore, ContentAddress};
use crate::error::Result;
use bytes::Bytes;
use dashmap::DashMap;

#[derive(Default)]
pub struct MemStore {
    blocks: DashMap<ContentAddress, Bytes>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for MemStore {
    fn put(&self, data: Bytes) -> Result<ContentAddress> {
        let address = ContentAddress::for_bytes(&data);
        self.blocks.entry(address).or_insert(data);
        Ok(address)
    }

    fn get(&self, address: &ContentAddress) -> Result<Bytes> {
        self.blocks
            .get(address)
            .map(|r| r.value().clone())
            .ok_or_else(|| block_not_found(address))
    }

    fn has(&self, address: &ContentAddress) -> Result<bool> {
        Ok(self.blocks.contains_key(address))
    }

    fn delete(&self, address: &ContentAddress) -> Result<()> {
        self.blocks.remove(address);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ContentAddress>> {
        Ok(self.blocks.iter().map(|r| *r.key()).collect())
    }

    fn size(&self, address: &ContentAddress) -> Result<u64> {
        self.blocks
            .get(address)
            .map(|r| r.value().len() as u64)
            .ok_or_else(|| block_not_found(address))
    }
}
