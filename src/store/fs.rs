//! Filesystem block store.
//!
//! Layout:
//! ```text
//! {root}/blocks/
//!   {hex[0..2]}/
//!     {hex[2..]}
//! ```
//! Writes land in a temp file in the shard directory and are renamed into
//! place, so a reader never observes a partially written block.

use super::{block_not_found, BlockStore, ContentAddress};
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().join("blocks");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn block_path(&self, address: &ContentAddress) -> PathBuf {
        let hex = address.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl BlockStore for FsStore {
    fn put(&self, data: Bytes) -> Result<ContentAddress> {
        let address = ContentAddress::for_bytes(&data);
        let path = self.block_path(&address);
        if path.exists() {
            return Ok(address);
        }

        let shard = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(shard)?;

        let mut tmp = tempfile::NamedTempFile::new_in(shard)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

        Ok(address)
    }

    fn get(&self, address: &ContentAddress) -> Result<Bytes> {
        match fs::read(self.block_path(address)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(block_not_found(address)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn has(&self, address: &ContentAddress) -> Result<bool> {
        Ok(self.block_path(address).is_file())
    }

    fn delete(&self, address: &ContentAddress) -> Result<()> {
        match fs::remove_file(self.block_path(address)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn list(&self) -> Result<Vec<ContentAddress>> {
        let mut out = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().to_string();
            for entry in fs::read_dir(shard.path())? {
                let name = entry?.file_name().to_string_lossy().to_string();
                // skip in-flight temp files
                if let Some(address) = ContentAddress::from_hex(&format!("{}{}", prefix, name)) {
                    out.push(address);
                }
            }
        }
        Ok(out)
    }

    fn size(&self, address: &ContentAddress) -> Result<u64> {
        match fs::metadata(self.block_path(address)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(block_not_found(address)),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip_on_disk() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::open(tmp.path()).unwrap();

        let address = store.put(Bytes::from_static(b"on disk")).unwrap();
        assert!(store.has(&address).unwrap());
        assert_eq!(store.get(&address).unwrap().as_ref(), b"on disk");
        assert_eq!(store.size(&address).unwrap(), 7);

        let hex = address.to_hex();
        assert!(tmp.path().join("blocks").join(&hex[..2]).join(&hex[2..]).is_file());
    }

    #[test]
    fn test_reopen_sees_existing_blocks() {
        let tmp = TempDir::new().unwrap();
        let address = {
            let store = FsStore::open(tmp.path()).unwrap();
            store.put(Bytes::from_static(b"persisted")).unwrap()
        };
        let store = FsStore::open(tmp.path()).unwrap();
        assert_eq!(store.list().unwrap(), vec![address]);
    }

    #[test]
    fn test_second_put_leaves_store_unchanged() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::open(tmp.path()).unwrap();
        let a = store.put(Bytes::from_static(b"twice")).unwrap();
        let b = store.put(Bytes::from_static(b"twice")).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::open(tmp.path()).unwrap();
        let a = store.put(Bytes::from_static(b"x")).unwrap();
        store.delete(&a).unwrap();
        assert!(matches!(store.get(&a), Err(Error::NotFound(_))));
        store.delete(&a).unwrap();
    }
}
