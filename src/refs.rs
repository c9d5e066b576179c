// Reference table
//
// Maps (profile id, dataset name) to the current head address. Persisted
// as JSON at {repo}/refs.json with an atomic temp-file rename on every
// mutation. Mutations of a single reference are serialized through a
// per-reference async lock; different references never contend.

use crate::error::{Error, Result};
use crate::store::ContentAddress;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefKey {
    pub profile_id: String,
    pub name: String,
}

impl RefKey {
    pub fn new(profile_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            name: name.into(),
        }
    }
}

/// The authoritative local pointer for one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    pub init_id: String,
    pub username: String,
    pub profile_id: String,
    pub name: String,
    pub head: ContentAddress,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub foreign: bool,
    #[serde(default)]
    pub fsi_path: Option<PathBuf>,
}

impl RefEntry {
    pub fn key(&self) -> RefKey {
        RefKey::new(&self.profile_id, &self.name)
    }
}

#[derive(Serialize, Deserialize)]
struct RefsFile {
    version: u32,
    refs: Vec<RefEntry>,
}

pub struct RefStore {
    file: Option<PathBuf>,
    entries: RwLock<BTreeMap<RefKey, RefEntry>>,
    locks: DashMap<RefKey, Arc<Mutex<()>>>,
}

impl RefStore {
    const FORMAT_VERSION: u32 = 1;

    pub fn in_memory() -> Self {
        Self {
            file: None,
            entries: RwLock::new(BTreeMap::new()),
            locks: DashMap::new(),
        }
    }

    /// Open or create the table backed by `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            file: Some(path),
            entries: RwLock::new(entries),
            locks: DashMap::new(),
        })
    }

    fn load_from_file(path: &Path) -> Result<BTreeMap<RefKey, RefEntry>> {
        let data = fs::read(path)?;
        let file: RefsFile = serde_json::from_slice(&data)
            .map_err(|e| Error::Codec(format!("{}: {}", path.display(), e)))?;
        if file.version != Self::FORMAT_VERSION {
            return Err(Error::Codec(format!(
                "{}: unsupported refs format version {}",
                path.display(),
                file.version
            )));
        }
        Ok(file.refs.into_iter().map(|e| (e.key(), e)).collect())
    }

    fn save_to_file(&self, entries: &BTreeMap<RefKey, RefEntry>) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let file = RefsFile {
            version: Self::FORMAT_VERSION,
            refs: entries.values().cloned().collect(),
        };
        let temp_file = path.with_extension("tmp");
        fs::write(&temp_file, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&temp_file, path)?;
        Ok(())
    }

    /// Acquire the mutation lock for one reference.
    ///
    /// Every head-changing operation holds this for its whole duration.
    pub async fn lock(&self, key: &RefKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn get(&self, key: &RefKey) -> Option<RefEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn find(&self, username: &str, name: &str) -> Option<RefEntry> {
        self.entries
            .read()
            .values()
            .find(|e| e.username == username && e.name == name)
            .cloned()
    }

    /// Insert or replace an entry
    pub fn put(&self, entry: RefEntry) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(entry.key(), entry);
        self.save_to_file(&entries)
    }

    pub fn remove(&self, key: &RefKey) -> Result<Option<RefEntry>> {
        let mut entries = self.entries.write();
        let removed = entries.remove(key);
        if removed.is_some() {
            self.save_to_file(&entries)?;
        }
        Ok(removed)
    }

    pub fn list(&self) -> Vec<RefEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(name: &str, head: &[u8]) -> RefEntry {
        RefEntry {
            init_id: format!("init-{}", name),
            username: "alice".to_string(),
            profile_id: "QmAlice".to_string(),
            name: name.to_string(),
            head: ContentAddress::for_bytes(head),
            published: false,
            foreign: false,
            fsi_path: None,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let refs = RefStore::in_memory();
        refs.put(entry("cities", b"v1")).unwrap();

        let key = RefKey::new("QmAlice", "cities");
        assert_eq!(refs.get(&key).unwrap().head, ContentAddress::for_bytes(b"v1"));
        assert_eq!(refs.find("alice", "cities").unwrap().key(), key);
        assert!(refs.find("bob", "cities").is_none());

        refs.put(entry("cities", b"v2")).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.get(&key).unwrap().head, ContentAddress::for_bytes(b"v2"));

        assert!(refs.remove(&key).unwrap().is_some());
        assert!(refs.remove(&key).unwrap().is_none());
        assert!(refs.is_empty());
    }

    #[test]
    fn test_persists_across_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("refs.json");
        {
            let refs = RefStore::open(&path).unwrap();
            refs.put(entry("cities", b"v1")).unwrap();
            refs.put(entry("movies", b"m1")).unwrap();
        }
        let refs = RefStore::open(&path).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.find("alice", "movies").is_some());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_lock_is_per_reference() {
        let refs = Arc::new(RefStore::in_memory());
        let a = RefKey::new("QmAlice", "a");
        let b = RefKey::new("QmAlice", "b");

        let _held = refs.lock(&a).await;

        // a different reference is not blocked
        tokio::time::timeout(Duration::from_millis(100), refs.lock(&b))
            .await
            .expect("lock on another reference should not wait");

        // the same reference is
        let blocked = tokio::time::timeout(Duration::from_millis(50), refs.lock(&a)).await;
        assert!(blocked.is_err());
    }
}
