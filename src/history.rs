//! Removing the most recent versions of a dataset.

use crate::chain;
use crate::dsref::Ref;
use crate::error::{Error, Result};
use crate::repo::Repo;
use crate::store::ContentAddress;
use std::collections::HashSet;
use tracing::{debug, info};

/// Remove the `n` newest versions of `reference` from the repo's store.
///
/// `n == -1` (or any `n` at least the chain length) removes the whole
/// chain and deletes the reference. On success the reference is rewound to
/// the newest surviving version and the cache is patched; the returned
/// `Ref` carries the new head, or no path when nothing survives.
///
/// Blocks that a surviving version of the same chain still points at are
/// kept. If a delete fails part way the error is returned as-is, the
/// reference is left at its old head and already-deleted blocks stay
/// deleted.
pub async fn remove_n_versions_from_store(
    repo: Option<&Repo>,
    reference: &Ref,
    n: i64,
) -> Result<Ref> {
    let repo = repo.ok_or_else(|| Error::InvalidArgument("need a repo".to_string()))?;
    let path = reference
        .path
        .ok_or_else(|| Error::InvalidArgument("need a dataset reference with a path".to_string()))?;
    if n < -1 {
        return Err(Error::InvalidArgument(
            "invalid 'n', n should be n >= 0 or n == -1 to indicate removing all versions"
                .to_string(),
        ));
    }

    let key = repo.get_ref(reference)?.key();
    let _lock = repo.refs().lock(&key).await;

    // re-read under the lock
    let mut entry = repo.get_ref(reference)?;
    if entry.head != path {
        return Err(Error::InvalidArgument(format!(
            "{} is not the head of {} (head is {})",
            path,
            reference.alias(),
            entry.head
        )));
    }

    let store = repo.store().as_ref();
    let versions = chain::walk(store, &path)?;
    let total = versions.len();
    let k = if n == -1 || n as usize >= total {
        total
    } else {
        n as usize
    };
    if k == 0 {
        return Ok(reference.clone());
    }

    let (removed, retained) = versions.split_at(k);
    let keep: HashSet<ContentAddress> = retained
        .iter()
        .flat_map(|(address, record)| std::iter::once(*address).chain(record.components()))
        .collect();

    debug!(
        "Removing {} of {} versions from {}",
        k,
        total,
        reference.alias()
    );
    for (address, record) in removed {
        for component in record.components() {
            if !keep.contains(&component) {
                store.delete(&component)?;
            }
        }
        store.delete(address)?;
    }

    let mut out = reference.clone();
    out.profile_id = entry.profile_id.clone();
    match retained.first() {
        Some((new_head, _)) => {
            entry.head = *new_head;
            repo.set_head(entry)?;
            out.path = Some(*new_head);
        }
        None => {
            repo.drop_entry(&key)?;
            out.path = None;
        }
    }

    info!(
        "Removed {} versions of {}, head now {}",
        k,
        reference.alias(),
        out.path.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string())
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Dataset;
    use crate::repo::Profile;

    async fn chain_of(repo: &Repo, len: usize) -> Ref {
        let mut r = Ref::default();
        for i in 0..len {
            r = repo
                .save(
                    "cities",
                    Dataset {
                        body: Some(format!("[{}]", i).into_bytes()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        r
    }

    #[tokio::test]
    async fn test_zero_is_noop() {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        let head = chain_of(&repo, 3).await;
        let out = remove_n_versions_from_store(Some(&repo), &head, 0).await.unwrap();
        assert_eq!(out, head);
        assert_eq!(
            repo.cache().resolve_by_name("alice", "cities").unwrap().num_versions,
            3
        );
    }

    #[tokio::test]
    async fn test_stale_path_rejected() {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        let first = chain_of(&repo, 1).await;
        repo.save("cities", Dataset::default()).await.unwrap();
        let err = remove_n_versions_from_store(Some(&repo), &first, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_shared_body_survives() {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        let same = || Dataset {
            body: Some(b"[1,2,3]".to_vec()),
            ..Default::default()
        };
        repo.save("cities", same()).await.unwrap();
        let head = repo.save("cities", same()).await.unwrap();

        let out = remove_n_versions_from_store(Some(&repo), &head, 1).await.unwrap();
        let ds = chain::load_dataset(repo.store().as_ref(), &out.path.unwrap()).unwrap();
        assert_eq!(ds.body.as_deref(), Some(&b"[1,2,3]"[..]));
    }
}
