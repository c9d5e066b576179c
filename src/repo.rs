//! A local repository: block store, reference table, resolution cache and
//! the owning profile.

use crate::chain;
use crate::config::Config;
use crate::dataset::{Dataset, Structure};
use crate::dscache::{build_version_info, Dscache};
use crate::dsref::{validate_name, Ref, VersionInfo};
use crate::error::{Error, Result};
use crate::refs::{RefEntry, RefKey, RefStore};
use crate::store::{BlockStore, FsStore, MemStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub username: String,
    pub id: String,
}

impl Profile {
    pub fn new(username: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            id: id.into(),
        }
    }
}

pub struct Repo {
    store: Arc<dyn BlockStore>,
    refs: RefStore,
    cache: Arc<Dscache>,
    profile: Profile,
}

impl Repo {
    pub fn new(store: Arc<dyn BlockStore>, refs: RefStore, cache: Arc<Dscache>, profile: Profile) -> Self {
        Self {
            store,
            refs,
            cache,
            profile,
        }
    }

    pub fn in_memory(profile: Profile) -> Self {
        Self::with_store(Arc::new(MemStore::new()), profile)
    }

    /// In-memory references and cache over the given block store
    pub fn with_store(store: Arc<dyn BlockStore>, profile: Profile) -> Self {
        Self::new(store, RefStore::in_memory(), Arc::new(Dscache::in_memory()), profile)
    }

    /// Open the on-disk repository described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let root = config.repo_path();
        std::fs::create_dir_all(&root)?;

        let store: Arc<dyn BlockStore> = Arc::new(FsStore::open(&root)?);
        let refs = RefStore::open(root.join("refs.json"))?;
        let cache = Dscache::open_or_rebuild(config.cache_path(), store.as_ref(), &refs.list())?;
        debug!("Opened repo at {} ({} refs)", root.display(), refs.len());

        Ok(Self::new(
            store,
            refs,
            Arc::new(cache),
            Profile::new(&config.profile.username, &config.profile.id),
        ))
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    pub fn cache(&self) -> &Arc<Dscache> {
        &self.cache
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Find the table entry a reference names. The profile id wins over
    /// the username when both are present.
    pub fn get_ref(&self, reference: &Ref) -> Result<RefEntry> {
        let found = if reference.profile_id.is_empty() {
            self.refs.find(&reference.username, &reference.name)
        } else {
            self.refs
                .get(&RefKey::new(&reference.profile_id, &reference.name))
        };
        found.ok_or_else(|| {
            Error::NotFound(format!(
                "dataset ref not found {}/{}",
                reference.username, reference.name
            ))
        })
    }

    /// Record `entry` as the new state of its reference and refresh the
    /// cache. The caller holds the reference lock.
    pub(crate) fn set_head(&self, entry: RefEntry) -> Result<VersionInfo> {
        let info = build_version_info(self.store.as_ref(), &entry)?;
        self.install_head(entry, info)
    }

    /// Record `entry` with an already built `info`. The caller holds the
    /// reference lock and has checked the chain.
    pub(crate) fn install_head(&self, entry: RefEntry, info: VersionInfo) -> Result<VersionInfo> {
        self.refs.put(entry)?;
        self.cache.update_ref(info.clone());
        Ok(info)
    }

    /// Drop a reference from the table and the cache. The caller holds the
    /// reference lock.
    pub(crate) fn drop_entry(&self, key: &RefKey) -> Result<Option<RefEntry>> {
        let removed = self.refs.remove(key)?;
        self.cache.remove_ref(&key.profile_id, &key.name);
        Ok(removed)
    }

    /// Commit `ds` as the new head of `name`.
    ///
    /// The commit timestamp defaults to now, the commit is signed with the
    /// repo's profile, and a missing structure is inferred from the body.
    pub async fn save(&self, name: &str, mut ds: Dataset) -> Result<Ref> {
        validate_name(name)?;
        let key = RefKey::new(&self.profile.id, name);
        let _lock = self.refs.lock(&key).await;

        let existing = self.refs.get(&key);
        let parent = existing.as_ref().map(|e| e.head);

        let mut commit = ds.commit.take().unwrap_or_default();
        if commit.timestamp == 0 {
            commit.timestamp = chrono::Utc::now().timestamp();
        }
        if commit.title.is_empty() {
            commit.title = if parent.is_some() {
                "updated dataset".to_string()
            } else {
                "created dataset".to_string()
            };
        }
        commit.sign(&self.profile.id);
        ds.commit = Some(commit);

        if ds.structure.is_none() {
            if let Some(body) = &ds.body {
                ds.structure = Some(Structure::infer("json", body));
            }
        }

        let head = chain::write_version(self.store.as_ref(), parent, &ds)?;
        let entry = match existing {
            Some(prev) => RefEntry { head, ..prev },
            None => RefEntry {
                init_id: init_id(&self.profile.id, name),
                username: self.profile.username.clone(),
                profile_id: self.profile.id.clone(),
                name: name.to_string(),
                head,
                published: false,
                foreign: false,
                fsi_path: None,
            },
        };
        self.set_head(entry)?;
        info!("Saved {}/{}@{}", self.profile.username, name, head);

        Ok(Ref {
            username: self.profile.username.clone(),
            profile_id: self.profile.id.clone(),
            name: name.to_string(),
            path: Some(head),
        })
    }

    /// Forget a reference. Its blocks stay in the store.
    pub async fn delete_ref(&self, reference: &Ref) -> Result<RefEntry> {
        let entry = self.get_ref(reference)?;
        let key = entry.key();
        let _lock = self.refs.lock(&key).await;
        let removed = self.drop_entry(&key)?.ok_or_else(|| {
            Error::NotFound(format!("dataset ref not found {}", reference.alias()))
        })?;
        info!("Deleted reference {}", reference.alias());
        Ok(removed)
    }

    pub async fn set_published(&self, reference: &Ref, published: bool) -> Result<VersionInfo> {
        self.modify(reference, |e| e.published = published).await
    }

    /// Link or unlink a working-directory checkout
    pub async fn link(&self, reference: &Ref, fsi_path: Option<PathBuf>) -> Result<VersionInfo> {
        self.modify(reference, move |e| e.fsi_path = fsi_path).await
    }

    async fn modify(&self, reference: &Ref, f: impl FnOnce(&mut RefEntry)) -> Result<VersionInfo> {
        let key = self.get_ref(reference)?.key();
        let _lock = self.refs.lock(&key).await;
        let mut entry = self
            .refs
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("dataset ref not found {}", reference.alias())))?;
        f(&mut entry);
        self.set_head(entry)
    }
}

fn init_id(profile_id: &str, name: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(profile_id.as_bytes());
    hasher.update(name.as_bytes());
    hasher.update(&chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Meta;

    fn alice() -> Repo {
        Repo::in_memory(Profile::new("alice", "QmAlice"))
    }

    fn body(rows: &str) -> Dataset {
        Dataset {
            meta: Some(Meta {
                title: "cities".to_string(),
                ..Default::default()
            }),
            body: Some(rows.as_bytes().to_vec()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_save_advances_head() {
        let repo = alice();
        let v1 = repo.save("cities", body("[1]")).await.unwrap();
        let v2 = repo.save("cities", body("[1,2]")).await.unwrap();
        assert_ne!(v1.path, v2.path);

        let entry = repo.get_ref(&Ref::new("alice", "cities")).unwrap();
        assert_eq!(Some(entry.head), v2.path);

        let history = chain::history(repo.store().as_ref(), &entry.head).unwrap();
        assert_eq!(history, vec![v2.path.unwrap(), v1.path.unwrap()]);

        let info = repo.cache().resolve_by_name("alice", "cities").unwrap();
        assert_eq!(info.num_versions, 2);
        assert_eq!(info.body_rows, 2);
        assert_eq!(info.init_id, entry.init_id);
    }

    #[tokio::test]
    async fn test_save_signs_and_titles_commit() {
        let repo = alice();
        let r = repo.save("cities", body("[1]")).await.unwrap();
        let ds = chain::load_dataset(repo.store().as_ref(), &r.path.unwrap()).unwrap();
        let commit = ds.commit.unwrap();
        assert_eq!(commit.author, "QmAlice");
        assert_eq!(commit.title, "created dataset");
        assert!(!commit.signature.is_empty());
        assert!(commit.timestamp > 0);
    }

    #[tokio::test]
    async fn test_save_rejects_bad_name() {
        let repo = alice();
        assert!(matches!(
            repo.save("9lives", body("[]")).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_ref_and_publish() {
        let repo = alice();
        repo.save("cities", body("[1]")).await.unwrap();
        let r = Ref::new("alice", "cities");

        let info = repo.set_published(&r, true).await.unwrap();
        assert!(info.published);
        assert!(repo.cache().resolve_by_name("alice", "cities").unwrap().published);

        repo.delete_ref(&r).await.unwrap();
        assert!(repo.get_ref(&r).unwrap_err().is_not_found());
        assert!(repo.cache().resolve_by_name("alice", "cities").is_err());
        assert!(repo.delete_ref(&r).await.is_err());
    }

    #[tokio::test]
    async fn test_open_from_config_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.profile.username = "alice".to_string();
        config.profile.id = "QmAlice".to_string();
        config.repo.path = Some(tmp.path().to_path_buf());

        {
            let repo = Repo::open(&config).unwrap();
            repo.save("cities", body("[1,2,3]")).await.unwrap();
        }

        // lose the cache file; reopening rebuilds it
        std::fs::remove_file(config.cache_path()).unwrap();
        let repo = Repo::open(&config).unwrap();
        let info = repo.cache().resolve_by_name("alice", "cities").unwrap();
        assert_eq!(info.body_rows, 3);
    }
}
