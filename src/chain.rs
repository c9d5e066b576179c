//! Version records and history traversal.
//!
//! Each version is a small JSON record block pointing at its parent and at
//! its component blocks. The chain is walked iteratively from a head back
//! to the root by following `parent` links.

use crate::dataset::{Commit, Dataset, Meta, Structure};
use crate::error::{Error, Result};
use crate::store::{BlockStore, ContentAddress};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Upper bound on history walks. Content addressing rules out cycles, so
/// this only protects against pathological stores.
pub const MAX_HISTORY: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub parent: Option<ContentAddress>,
    pub commit: ContentAddress,
    pub meta: Option<ContentAddress>,
    pub structure: Option<ContentAddress>,
    pub body: Option<ContentAddress>,
}

impl VersionRecord {
    /// Component block addresses, excluding the record itself and its parent
    pub fn components(&self) -> impl Iterator<Item = ContentAddress> + '_ {
        std::iter::once(self.commit)
            .chain(self.meta)
            .chain(self.structure)
            .chain(self.body)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Codec(format!("invalid version record: {}", e)))
    }
}

/// A loaded version. Components are fetched only when asked for.
pub struct Version<'a> {
    pub address: ContentAddress,
    pub record: VersionRecord,
    store: &'a dyn BlockStore,
}

impl<'a> Version<'a> {
    pub fn commit(&self) -> Result<Commit> {
        load_json(self.store, &self.record.commit)
    }

    pub fn meta(&self) -> Result<Option<Meta>> {
        self.record
            .meta
            .map(|a| load_json(self.store, &a))
            .transpose()
    }

    pub fn structure(&self) -> Result<Option<Structure>> {
        self.record
            .structure
            .map(|a| load_json(self.store, &a))
            .transpose()
    }

    pub fn body(&self) -> Result<Option<Bytes>> {
        self.record.body.map(|a| self.store.get(&a)).transpose()
    }

    pub fn body_size(&self) -> Result<u64> {
        match self.record.body {
            Some(a) => self.store.size(&a),
            None => Ok(0),
        }
    }

    /// Assemble everything except the body.
    pub fn to_dataset_without_body(&self) -> Result<Dataset> {
        Ok(Dataset {
            path: Some(self.address),
            commit: Some(self.commit()?),
            meta: self.meta()?,
            structure: self.structure()?,
            body_path: self.record.body,
            ..Default::default()
        })
    }

    pub fn to_dataset(&self) -> Result<Dataset> {
        let mut ds = self.to_dataset_without_body()?;
        ds.body = self.body()?.map(|b| b.to_vec());
        Ok(ds)
    }
}

fn load_json<T: DeserializeOwned>(store: &dyn BlockStore, address: &ContentAddress) -> Result<T> {
    let data = store.get(address)?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::Codec(format!("invalid component {}: {}", address, e)))
}

fn put_json<T: Serialize>(store: &dyn BlockStore, value: &T) -> Result<ContentAddress> {
    store.put(Bytes::from(serde_json::to_vec(value)?))
}

pub fn load_version<'a>(store: &'a dyn BlockStore, address: &ContentAddress) -> Result<Version<'a>> {
    let data = store.get(address)?;
    Ok(Version {
        address: *address,
        record: VersionRecord::decode(&data)?,
        store,
    })
}

pub fn load_dataset(store: &dyn BlockStore, address: &ContentAddress) -> Result<Dataset> {
    load_version(store, address)?.to_dataset()
}

/// Write `ds` as a new version on top of `parent`.
///
/// `ds.commit` must be present; it is written as given, so the caller sets
/// timestamp and signature.
pub fn write_version(
    store: &dyn BlockStore,
    parent: Option<ContentAddress>,
    ds: &Dataset,
) -> Result<ContentAddress> {
    let commit = ds
        .commit
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("commit is required".to_string()))?;

    let record = VersionRecord {
        parent,
        commit: put_json(store, commit)?,
        meta: ds.meta.as_ref().map(|m| put_json(store, m)).transpose()?,
        structure: ds
            .structure
            .as_ref()
            .map(|s| put_json(store, s))
            .transpose()?,
        body: ds
            .body
            .as_ref()
            .map(|b| store.put(Bytes::from(b.clone())))
            .transpose()?,
    };
    put_json(store, &record)
}

/// Addresses of every version reachable from `head`, newest first.
pub fn history(store: &dyn BlockStore, head: &ContentAddress) -> Result<Vec<ContentAddress>> {
    Ok(walk(store, head)?.into_iter().map(|(a, _)| a).collect())
}

/// Versions reachable from `head` with their decoded records, newest first.
pub fn walk(
    store: &dyn BlockStore,
    head: &ContentAddress,
) -> Result<Vec<(ContentAddress, VersionRecord)>> {
    let mut out = Vec::new();
    let mut next = Some(*head);
    while let Some(address) = next {
        if out.len() >= MAX_HISTORY {
            return Err(Error::InvalidArgument(format!(
                "history from {} exceeds {} versions",
                head, MAX_HISTORY
            )));
        }
        let record = VersionRecord::decode(&store.get(&address)?)?;
        next = record.parent;
        out.push((address, record));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub path: ContentAddress,
    pub commit: Commit,
    pub body_size: u64,
}

/// Commit log from `head`, newest first.
pub fn log(store: &dyn BlockStore, head: &ContentAddress) -> Result<Vec<LogEntry>> {
    history(store, head)?
        .into_iter()
        .map(|address| {
            let version = load_version(store, &address)?;
            Ok(LogEntry {
                path: address,
                commit: version.commit()?,
                body_size: version.body_size()?,
            })
        })
        .collect()
}
