//! Transfer sessions and admission control.
//!
//! A session lives for one push or pull on the receiving side. Received
//! blocks are staged in memory and only copied into the repository store
//! once the whole chain has arrived and verified, so a rejected or aborted
//! transfer leaves the destination exactly as it was.
//!
//! ```text
//! Requested -> AdmissionChecked -> Transferring -> Verifying -> Committed
//!     |                                 |              |
//!     +-> Rejected                      +-> Aborted <--+
//! ```

use super::protocol::{Manifest, MAX_BLOCK_SIZE};
use crate::chain;
use crate::config::AdmissionPolicy;
use crate::dscache::build_version_info;
use crate::dsref::VersionInfo;
use crate::error::{Error, Result};
use crate::refs::{RefEntry, RefKey};
use crate::repo::Repo;
use crate::store::{BlockStore, ContentAddress, MemStore};
use bytes::Bytes;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    AdmissionChecked,
    Transferring,
    Verifying,
    Committed,
    Rejected,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Rejected | Self::Aborted)
    }
}

/// Staged blocks layered over a base store. Reads fall through to the
/// base; writes only touch the staging layer.
struct Overlay<'a> {
    staged: &'a MemStore,
    base: &'a dyn BlockStore,
}

impl BlockStore for Overlay<'_> {
    fn put(&self, data: Bytes) -> Result<ContentAddress> {
        self.staged.put(data)
    }

    fn get(&self, address: &ContentAddress) -> Result<Bytes> {
        match self.staged.get(address) {
            Err(e) if e.is_not_found() => self.base.get(address),
            other => other,
        }
    }

    fn has(&self, address: &ContentAddress) -> Result<bool> {
        Ok(self.staged.has(address)? || self.base.has(address)?)
    }

    fn delete(&self, address: &ContentAddress) -> Result<()> {
        self.staged.delete(address)
    }

    fn list(&self) -> Result<Vec<ContentAddress>> {
        let mut all = self.base.list()?;
        all.extend(self.staged.list()?);
        all.sort();
        all.dedup();
        Ok(all)
    }
}

pub struct TransferSession {
    state: SessionState,
    policy: AdmissionPolicy,
    manifest: Manifest,
    started: Instant,
    deadline: Option<Instant>,
    wanted: HashSet<ContentAddress>,
    received: HashSet<ContentAddress>,
    bytes: u64,
    staging: MemStore,
}

impl TransferSession {
    pub fn new(manifest: Manifest, policy: AdmissionPolicy) -> Self {
        let started = Instant::now();
        Self {
            state: SessionState::Requested,
            deadline: policy.time_limit().map(|limit| started + limit),
            policy,
            manifest,
            started,
            wanted: HashSet::new(),
            received: HashSet::new(),
            bytes: 0,
            staging: MemStore::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    pub fn blocks_received(&self) -> usize {
        self.received.len()
    }

    /// Time left before the session's budget runs out
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn reject(&mut self, reason: String) -> Error {
        warn!("Rejecting {}: {}", self.manifest.alias(), reason);
        self.state = SessionState::Rejected;
        Error::AdmissionRejected(reason)
    }

    /// Mark the session failed. No persistent state has been touched.
    pub fn abort(&mut self, reason: &Error) {
        if !self.state.is_terminal() {
            warn!("Aborting transfer of {}: {}", self.manifest.alias(), reason);
            self.state = SessionState::Aborted;
        }
    }

    /// Apply the admission policy and work out which blocks to fetch.
    ///
    /// Blocks already present in `local` are not requested again.
    pub fn admit(&mut self, local: &dyn BlockStore) -> Result<Vec<ContentAddress>> {
        if self.state != SessionState::Requested {
            return Err(Error::Protocol(format!(
                "admission in state {:?}",
                self.state
            )));
        }

        let total = self.manifest.total_size();
        if let Some(max) = self.policy.size_limit() {
            if total > max {
                return Err(self.reject(format!(
                    "transfer size {} bytes exceeds limit of {} bytes",
                    total, max
                )));
            }
        }

        let oversized = self
            .manifest
            .entries
            .iter()
            .find(|e| e.size > MAX_BLOCK_SIZE)
            .map(|e| {
                format!(
                    "block {} is {} bytes, over the transfer limit of {} bytes",
                    e.address, e.size, MAX_BLOCK_SIZE
                )
            });
        if let Some(reason) = oversized {
            return Err(self.reject(reason));
        }

        if self.policy.time_limit() == Some(Duration::ZERO) {
            return Err(self.reject("transfer time budget is zero".to_string()));
        }

        if self.policy.require_all_blocks {
            let missing = self.manifest.unavailable().count();
            if missing > 0 {
                return Err(self.reject(format!(
                    "{} of {} blocks are not available from the sender",
                    missing,
                    self.manifest.entries.len()
                )));
            }
        }

        let mut want = Vec::new();
        for entry in &self.manifest.entries {
            if !entry.available || !self.wanted.insert(entry.address) {
                continue;
            }
            if local.has(&entry.address)? {
                self.wanted.remove(&entry.address);
                continue;
            }
            want.push(entry.address);
        }

        debug!(
            "Admitted {} ({} bytes, want {} of {} blocks)",
            self.manifest.alias(),
            total,
            want.len(),
            self.manifest.entries.len()
        );
        self.state = SessionState::AdmissionChecked;
        Ok(want)
    }

    pub fn begin_transfer(&mut self) -> Result<()> {
        if self.state != SessionState::AdmissionChecked {
            return Err(Error::Protocol(format!(
                "transfer started in state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Transferring;
        Ok(())
    }

    fn check_deadline(&self) -> Result<()> {
        match (self.deadline, self.policy.time_limit()) {
            (Some(deadline), Some(limit)) if Instant::now() >= deadline => {
                Err(Error::AdmissionRejected(format!(
                    "transfer exceeded time budget of {}ms",
                    limit.as_millis()
                )))
            }
            _ => Ok(()),
        }
    }

    /// Stage one received block after checking its address and the limits.
    pub fn receive_block(&mut self, address: ContentAddress, data: Bytes) -> Result<()> {
        if self.state != SessionState::Transferring {
            return Err(Error::Protocol(format!(
                "block received in state {:?}",
                self.state
            )));
        }
        let result = self.stage(address, data);
        if let Err(e) = &result {
            self.abort(e);
        }
        result
    }

    fn stage(&mut self, address: ContentAddress, data: Bytes) -> Result<()> {
        self.check_deadline()?;
        if !self.wanted.contains(&address) {
            return Err(Error::Protocol(format!("unrequested block {}", address)));
        }

        let actual = ContentAddress::for_bytes(&data);
        if actual != address {
            return Err(Error::Integrity {
                address: address.to_hex(),
                actual: actual.to_hex(),
            });
        }

        self.bytes += data.len() as u64;
        if let Some(max) = self.policy.size_limit() {
            if self.bytes > max {
                return Err(Error::AdmissionRejected(format!(
                    "received {} bytes, over limit of {} bytes",
                    self.bytes, max
                )));
            }
        }

        self.staging.put(data)?;
        self.received.insert(address);
        Ok(())
    }

    /// Check that every requested block arrived and the chain from the
    /// manifest head is complete over staged and local blocks.
    pub fn verify(&mut self, local: &dyn BlockStore) -> Result<()> {
        if self.state != SessionState::Transferring {
            return Err(Error::Protocol(format!(
                "verify in state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Verifying;
        let result = self.verify_chain(local);
        if let Err(e) = &result {
            self.abort(e);
        }
        result
    }

    fn verify_chain(&self, local: &dyn BlockStore) -> Result<()> {
        self.check_deadline()?;
        if let Some(missing) = self.wanted.difference(&self.received).next() {
            return Err(Error::Protocol(format!(
                "transfer ended without block {}",
                missing
            )));
        }

        let overlay = Overlay {
            staged: &self.staging,
            base: local,
        };
        let versions = chain::walk(&overlay, &self.manifest.head)?;
        for (_, record) in &versions {
            if !overlay.has(&record.commit)? {
                return Err(Error::NotFound(format!("block not found: {}", record.commit)));
            }
            if self.policy.require_all_blocks {
                for component in record.components() {
                    if !overlay.has(&component)? {
                        return Err(Error::NotFound(format!("block not found: {}", component)));
                    }
                }
            }
        }
        debug!(
            "Verified {} versions of {}",
            versions.len(),
            self.manifest.alias()
        );
        Ok(())
    }

    /// Copy staged blocks into the repo and point the reference at the new
    /// head. Existing entries keep their published flag and checkout link.
    ///
    /// The chain is checked again under the reference lock, before any
    /// block is copied, since local blocks it relies on may have been
    /// removed since [`verify`](Self::verify).
    pub async fn commit(mut self, repo: &Repo) -> Result<VersionInfo> {
        if self.state != SessionState::Verifying {
            return Err(Error::Protocol(format!(
                "commit in state {:?}",
                self.state
            )));
        }

        let foreign = self.manifest.profile_id != repo.profile().id;
        let key = RefKey::new(&self.manifest.profile_id, &self.manifest.name);
        let _lock = repo.refs().lock(&key).await;

        let entry = self.entry_for(repo, &key, foreign);
        let checked = self.verify_chain(repo.store().as_ref()).and_then(|_| {
            let overlay = Overlay {
                staged: &self.staging,
                base: repo.store().as_ref(),
            };
            build_version_info(&overlay, &entry)
        });
        let info = match checked {
            Ok(info) => info,
            Err(e) => {
                self.abort(&e);
                return Err(e);
            }
        };

        for address in self.staging.list()? {
            repo.store().put(self.staging.get(&address)?)?;
        }
        let info = repo.install_head(entry, info)?;
        self.state = SessionState::Committed;
        info!(
            "Committed {}@{} ({} blocks, {} bytes in {:?})",
            self.manifest.alias(),
            self.manifest.head,
            self.received.len(),
            self.bytes,
            self.started.elapsed()
        );
        Ok(info)
    }

    fn entry_for(&self, repo: &Repo, key: &RefKey, foreign: bool) -> RefEntry {
        let m = &self.manifest;
        match repo.refs().get(key) {
            Some(prev) => RefEntry {
                init_id: m.init_id.clone(),
                username: m.username.clone(),
                head: m.head,
                foreign,
                ..prev
            },
            None => RefEntry {
                init_id: m.init_id.clone(),
                username: m.username.clone(),
                profile_id: m.profile_id.clone(),
                name: m.name.clone(),
                head: m.head,
                published: false,
                foreign,
                fsi_path: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::dsref::Ref;
    use crate::history::remove_n_versions_from_store;
    use crate::remote::sender::build_manifest;
    use crate::repo::Profile;

    async fn source() -> (Repo, Manifest) {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        for i in 0..3 {
            repo.save(
                "cities",
                Dataset {
                    body: Some(format!("[{}]", i).into_bytes()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        let info = repo.cache().resolve_by_name("alice", "cities").unwrap();
        let manifest = build_manifest(repo.store().as_ref(), &info).unwrap();
        (repo, manifest)
    }

    fn dest() -> Repo {
        Repo::in_memory(Profile::new("bob", "QmBob"))
    }

    async fn run(session: &mut TransferSession, src: &Repo, dst: &Repo) -> Result<()> {
        let want = session.admit(dst.store().as_ref())?;
        session.begin_transfer()?;
        for address in want {
            session.receive_block(address, src.store().get(&address)?)?;
        }
        session.verify(dst.store().as_ref())
    }

    #[tokio::test]
    async fn test_full_transfer_commits() {
        let (src, manifest) = source().await;
        let dst = dest();
        let mut session = TransferSession::new(manifest.clone(), AdmissionPolicy::default());
        run(&mut session, &src, &dst).await.unwrap();
        assert!(dst.store().list().unwrap().is_empty());

        let info = session.commit(&dst).await.unwrap();
        assert_eq!(info.path, Some(manifest.head));
        assert!(info.foreign);
        assert_eq!(info.num_versions, 3);
        assert_eq!(
            dst.store().list().unwrap().len(),
            src.store().list().unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_size_limit_rejects_before_transfer() {
        let (_, manifest) = source().await;
        let policy = AdmissionPolicy {
            accept_size_max: 10,
            ..Default::default()
        };
        let mut session = TransferSession::new(manifest, policy);
        let err = session.admit(&MemStore::new()).unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected(_)));
        assert_eq!(session.state(), SessionState::Rejected);
    }

    #[tokio::test]
    async fn test_zero_time_budget_rejects() {
        let (_, manifest) = source().await;
        let policy = AdmissionPolicy {
            accept_timeout_ms: 0,
            ..Default::default()
        };
        let mut session = TransferSession::new(manifest, policy);
        assert!(matches!(
            session.admit(&MemStore::new()),
            Err(Error::AdmissionRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_require_all_blocks() {
        let (_, mut manifest) = source().await;
        manifest.entries[0].available = false;

        let mut strict = TransferSession::new(manifest.clone(), AdmissionPolicy::default());
        assert!(matches!(
            strict.admit(&MemStore::new()),
            Err(Error::AdmissionRejected(_))
        ));

        let lax = AdmissionPolicy {
            require_all_blocks: false,
            ..Default::default()
        };
        let mut session = TransferSession::new(manifest.clone(), lax);
        let want = session.admit(&MemStore::new()).unwrap();
        assert_eq!(want.len(), manifest.entries.len() - 1);
    }

    #[tokio::test]
    async fn test_corrupt_block_aborts() {
        let (_, manifest) = source().await;
        let mut session = TransferSession::new(manifest, AdmissionPolicy::default());
        let want = session.admit(&MemStore::new()).unwrap();
        session.begin_transfer().unwrap();

        let err = session
            .receive_block(want[0], Bytes::from_static(b"tampered"))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_missing_block_fails_verify() {
        let (src, manifest) = source().await;
        let dst = dest();
        let mut session = TransferSession::new(manifest, AdmissionPolicy::default());
        let want = session.admit(dst.store().as_ref()).unwrap();
        session.begin_transfer().unwrap();
        for address in &want[1..] {
            session
                .receive_block(*address, src.store().get(address).unwrap())
                .unwrap();
        }
        assert!(session.verify(dst.store().as_ref()).is_err());
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(dst.store().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_known_blocks_not_requested() {
        let (src, manifest) = source().await;
        let dst = dest();
        let shared = manifest.entries[0].address;
        dst.store().put(src.store().get(&shared).unwrap()).unwrap();

        let mut session = TransferSession::new(manifest, AdmissionPolicy::default());
        let want = session.admit(dst.store().as_ref()).unwrap();
        assert!(!want.contains(&shared));
    }

    #[tokio::test]
    async fn test_commit_after_local_removal_leaves_store_untouched() {
        let (src, manifest) = source().await;
        let dst = dest();
        let mut first = TransferSession::new(manifest.clone(), AdmissionPolicy::default());
        run(&mut first, &src, &dst).await.unwrap();
        first.commit(&dst).await.unwrap();

        src.save(
            "cities",
            Dataset {
                body: Some(b"[3]".to_vec()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let info = src.cache().resolve_by_name("alice", "cities").unwrap();
        let next = build_manifest(src.store().as_ref(), &info).unwrap();
        let mut session = TransferSession::new(next, AdmissionPolicy::default());
        run(&mut session, &src, &dst).await.unwrap();

        // the versions the new head builds on disappear before commit
        let mut old = Ref::new("alice", "cities");
        old.path = Some(manifest.head);
        remove_n_versions_from_store(Some(&dst), &old, -1).await.unwrap();
        assert!(dst.store().list().unwrap().is_empty());

        let err = session.commit(&dst).await.unwrap_err();
        assert!(err.is_not_found(), "{}", err);
        assert!(dst.store().list().unwrap().is_empty());
        assert!(dst.cache().resolve_by_name("alice", "cities").is_err());
    }

    #[tokio::test]
    async fn test_oversized_manifest_entry_is_rejected() {
        let (_, mut manifest) = source().await;
        manifest.entries[0].size = MAX_BLOCK_SIZE + 1;
        let policy = AdmissionPolicy {
            accept_size_max: -1,
            ..Default::default()
        };
        let mut session = TransferSession::new(manifest, policy);
        let err = session.admit(&MemStore::new()).unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected(_)));
        assert!(err.to_string().contains("transfer limit"));
        assert_eq!(session.state(), SessionState::Rejected);
    }
}
