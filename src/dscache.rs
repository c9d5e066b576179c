//! Resolution cache.
//!
//! Maps (username, dataset name) to a [`VersionInfo`] summary so names can
//! be resolved without walking chains. The cache is derived data: it can
//! always be rebuilt from the reference table and the block store.
//!
//! Readers take a snapshot (`Arc<CacheRoot>`) with no locking. Writers are
//! serialized, build a modified copy of the current root and publish it
//! with a single atomic swap, so a reader sees either the old table or the
//! new one and never a partially patched one.

use crate::chain;
use crate::dsref::VersionInfo;
use crate::error::{Error, Result};
use crate::refs::RefEntry;
use crate::store::BlockStore;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"DSC\x01";

/// Name of the most-recently-committed feed
pub const FEED_RECENT: &str = "recent";

/// Every feed a peer can answer
pub const FEED_NAMES: &[&str] = &[FEED_RECENT];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAssoc {
    pub username: String,
    pub profile_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRoot {
    pub users: Vec<UserAssoc>,
    pub refs: Vec<VersionInfo>,
}

impl CacheRoot {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = MAGIC.to_vec();
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let body = data
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| Error::Codec("not a resolution cache file".to_string()))?;
        Ok(bincode::deserialize(body)?)
    }

    pub fn profile_id(&self, username: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.profile_id.as_str())
    }

    pub fn resolve_by_name(&self, username: &str, name: &str) -> Result<VersionInfo> {
        let profile_id = self
            .profile_id(username)
            .ok_or_else(|| Error::NotFound(format!("unknown username {:?}", username)))?;

        self.lookup(profile_id, name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("dataset ref not found {}/{}", username, name)))
    }

    pub fn lookup(&self, profile_id: &str, name: &str) -> Option<&VersionInfo> {
        self.refs
            .iter()
            .find(|r| r.profile_id == profile_id && r.name == name)
    }

    fn upsert(&mut self, info: VersionInfo) {
        match self
            .users
            .iter_mut()
            .find(|u| u.profile_id == info.profile_id)
        {
            Some(user) => user.username = info.username.clone(),
            None => self.users.push(UserAssoc {
                username: info.username.clone(),
                profile_id: info.profile_id.clone(),
            }),
        }

        match self
            .refs
            .iter_mut()
            .find(|r| r.profile_id == info.profile_id && r.name == info.name)
        {
            Some(existing) => *existing = info,
            None => self.refs.push(info),
        }
    }

    fn remove(&mut self, profile_id: &str, name: &str) -> bool {
        let before = self.refs.len();
        self.refs
            .retain(|r| !(r.profile_id == profile_id && r.name == name));
        before != self.refs.len()
    }

    /// Published references, most recently committed first
    pub fn recent(&self, limit: usize) -> Vec<VersionInfo> {
        let mut out: Vec<VersionInfo> = self.refs.iter().filter(|r| r.published).cloned().collect();
        out.sort_by(|a, b| {
            b.commit_time
                .cmp(&a.commit_time)
                .then_with(|| a.username.cmp(&b.username))
                .then_with(|| a.name.cmp(&b.name))
        });
        out.truncate(limit);
        out
    }

    pub fn feed(&self, name: &str, limit: usize) -> Result<Vec<VersionInfo>> {
        match name {
            FEED_RECENT => Ok(self.recent(limit)),
            other => Err(Error::NotFound(format!("unknown feed {:?}", other))),
        }
    }

    pub fn feeds(&self, limit: usize) -> BTreeMap<String, Vec<VersionInfo>> {
        FEED_NAMES
            .iter()
            .map(|name| (name.to_string(), self.recent(limit)))
            .collect()
    }
}

// Components a partial transfer left behind read as absent.
fn missing_as_default<T: Default>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

/// Summarize the head of `entry`.
pub fn build_version_info(store: &dyn BlockStore, entry: &RefEntry) -> Result<VersionInfo> {
    let version = chain::load_version(store, &entry.head)?;
    let commit = version.commit()?;
    let meta = missing_as_default(version.meta())?.unwrap_or_default();
    let structure = missing_as_default(version.structure())?.unwrap_or_default();
    let body_size = match version.body_size() {
        Err(e) if e.is_not_found() => structure.length,
        other => other?,
    };
    let num_versions = chain::history(store, &entry.head)?.len() as u64;

    Ok(VersionInfo {
        init_id: entry.init_id.clone(),
        username: entry.username.clone(),
        profile_id: entry.profile_id.clone(),
        name: entry.name.clone(),
        path: Some(entry.head),
        published: entry.published,
        foreign: entry.foreign,
        meta_title: meta.title,
        theme_list: meta.theme.join(","),
        body_size,
        body_rows: structure.entries,
        body_format: structure.format,
        num_errors: structure.errors,
        commit_time: commit.timestamp,
        num_versions,
        fsi_path: entry
            .fsi_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
    })
}

pub struct Dscache {
    root: ArcSwap<CacheRoot>,
    writer: Mutex<()>,
    file: Option<PathBuf>,
}

impl Default for Dscache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Dscache {
    pub fn in_memory() -> Self {
        Self::from_root(CacheRoot::default(), None)
    }

    fn from_root(root: CacheRoot, file: Option<PathBuf>) -> Self {
        Self {
            root: ArcSwap::from_pointee(root),
            writer: Mutex::new(()),
            file,
        }
    }

    /// Load the cache file at `path`, rebuilding from `refs` when it is
    /// missing or unreadable.
    pub fn open_or_rebuild(
        path: impl AsRef<Path>,
        store: &dyn BlockStore,
        refs: &[RefEntry],
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let loaded = match fs::read(&path) {
            Ok(data) => match CacheRoot::deserialize(&data) {
                Ok(root) => Some(root),
                Err(e) => {
                    warn!("Discarding cache file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::Io(e)),
        };

        match loaded {
            Some(root) => {
                debug!("Loaded {} cached refs from {}", root.refs.len(), path.display());
                Ok(Self::from_root(root, Some(path)))
            }
            None => {
                let cache = Self::from_root(CacheRoot::default(), Some(path));
                cache.rebuild(store, refs)?;
                Ok(cache)
            }
        }
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<CacheRoot> {
        self.root.load_full()
    }

    pub fn resolve_by_name(&self, username: &str, name: &str) -> Result<VersionInfo> {
        self.root.load().resolve_by_name(username, name)
    }

    pub fn is_empty(&self) -> bool {
        self.root.load().refs.is_empty()
    }

    /// Insert or replace the summary for one reference
    pub fn update_ref(&self, info: VersionInfo) {
        let _guard = self.writer.lock();
        let mut next = CacheRoot::clone(&self.root.load());
        debug!("Cache update {}/{} -> {:?}", info.username, info.name, info.path);
        next.upsert(info);
        self.publish(next);
    }

    pub fn remove_ref(&self, profile_id: &str, name: &str) {
        let _guard = self.writer.lock();
        let mut next = CacheRoot::clone(&self.root.load());
        if next.remove(profile_id, name) {
            debug!("Cache remove {}:{}", profile_id, name);
            self.publish(next);
        }
    }

    /// Replace the whole table with summaries rebuilt from `refs`.
    ///
    /// References whose heads cannot be read are skipped with a warning.
    pub fn rebuild(&self, store: &dyn BlockStore, refs: &[RefEntry]) -> Result<usize> {
        let _guard = self.writer.lock();
        let mut next = CacheRoot::default();
        for entry in refs {
            match build_version_info(store, entry) {
                Ok(info) => next.upsert(info),
                Err(e) => warn!("Skipping {}/{} in cache rebuild: {}", entry.username, entry.name, e),
            }
        }
        let count = next.refs.len();
        info!("Rebuilt resolution cache: {} of {} refs", count, refs.len());
        self.publish(next);
        Ok(count)
    }

    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let data = self.root.load().serialize()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_file = path.with_extension("tmp");
        fs::write(&temp_file, data)?;
        fs::rename(&temp_file, path)?;
        Ok(())
    }

    // A failed write only loses the on-disk copy; the next open rebuilds it.
    fn publish(&self, next: CacheRoot) {
        self.root.store(Arc::new(next));
        if let Err(e) = self.persist() {
            warn!("Failed to persist resolution cache: {}", e);
        }
    }
}
