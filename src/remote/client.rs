//! Client side of the peer protocol.

use super::protocol::{
    self as wire, Done, Fatal, Feeds, FeedsRequest, Hello, HelloFlags, Manifest, MessageType,
    Preview, PreviewRequest, PullRequest, RemoveRequest, Want, PROTOCOL_VERSION,
};
use super::receiver::receive_chain;
use super::sender::{build_manifest, send_blocks};
use super::transport::{PeerConnection, PeerTransport};
use crate::config::{AdmissionPolicy, Config};
use crate::dataset::Dataset;
use crate::dscache::FEED_RECENT;
use crate::dsref::VersionInfo;
use crate::error::{Error, Result};
use crate::resolver::DatasetResolver;
use crate::repo::Repo;
use crate::store::ContentAddress;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Operations a local repo can ask of a remote peer.
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Replicate the chain behind a local reference to the peer. Returns
    /// the peer's head and what was transferred.
    async fn add_dataset(&self, refstr: &str) -> Result<Done>;

    /// Fetch a reference from the peer into the local repo
    async fn pull_dataset(&self, refstr: &str) -> Result<VersionInfo>;

    /// Every feed the peer publishes
    async fn feeds(&self) -> Result<BTreeMap<String, Vec<VersionInfo>>>;

    async fn feed(&self, name: &str) -> Result<Vec<VersionInfo>>;

    /// Head metadata and a truncated body of a peer's dataset
    async fn preview(&self, refstr: &str) -> Result<Dataset>;

    /// Ask the peer to drop the `n` most recent versions of a reference.
    /// Returns the peer's new head, `None` when the reference is gone.
    async fn remove_versions(&self, refstr: &str, n: i64) -> Result<Option<ContentAddress>>;
}

/// Stands in for an unconfigured client: every call fails with
/// [`Error::NoRemoteClient`].
#[async_trait]
impl<C: SyncClient> SyncClient for Option<C> {
    async fn add_dataset(&self, refstr: &str) -> Result<Done> {
        match self {
            Some(client) => client.add_dataset(refstr).await,
            None => Err(Error::NoRemoteClient),
        }
    }

    async fn pull_dataset(&self, refstr: &str) -> Result<VersionInfo> {
        match self {
            Some(client) => client.pull_dataset(refstr).await,
            None => Err(Error::NoRemoteClient),
        }
    }

    async fn feeds(&self) -> Result<BTreeMap<String, Vec<VersionInfo>>> {
        match self {
            Some(client) => client.feeds().await,
            None => Err(Error::NoRemoteClient),
        }
    }

    async fn feed(&self, name: &str) -> Result<Vec<VersionInfo>> {
        match self {
            Some(client) => client.feed(name).await,
            None => Err(Error::NoRemoteClient),
        }
    }

    async fn preview(&self, refstr: &str) -> Result<Dataset> {
        match self {
            Some(client) => client.preview(refstr).await,
            None => Err(Error::NoRemoteClient),
        }
    }

    async fn remove_versions(&self, refstr: &str, n: i64) -> Result<Option<ContentAddress>> {
        match self {
            Some(client) => client.remove_versions(refstr, n).await,
            None => Err(Error::NoRemoteClient),
        }
    }
}

/// A [`SyncClient`] talking to one peer through a [`PeerTransport`].
///
/// Pulls are admitted under this client's own policy.
pub struct PeerSyncClient<T> {
    repo: Arc<Repo>,
    transport: T,
    policy: AdmissionPolicy,
    compress: bool,
    deadline: Option<Duration>,
}

impl<T: PeerTransport> PeerSyncClient<T> {
    pub fn new(repo: Arc<Repo>, transport: T) -> Self {
        Self {
            repo,
            transport,
            policy: AdmissionPolicy::default(),
            compress: false,
            deadline: None,
        }
    }

    pub fn from_config(repo: Arc<Repo>, transport: T, config: &Config) -> Self {
        Self::new(repo, transport)
            .with_policy(config.admission.clone())
            .with_compression(config.remote.compress)
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Bound every request, I/O included. Expiry drops the connection
    /// and nothing is committed locally.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    async fn bounded<F, O>(&self, what: &str, fut: F) -> Result<O>
    where
        F: Future<Output = Result<O>> + Send,
        O: Send,
    {
        match self.deadline {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::DeadlineExceeded(format!(
                    "{} on {} after {:?}",
                    what,
                    self.transport.describe(),
                    limit
                ))
            })?,
            None => fut.await,
        }
    }

    /// Connect and exchange hellos for a single operation
    async fn open(&self, op: HelloFlags) -> Result<(PeerConnection, bool)> {
        let mut conn = self.transport.connect().await?;
        let mut flags = op;
        flags.set(HelloFlags::COMPRESSION, self.compress);
        let hello = Hello::new(flags, &self.repo.profile().username);
        wire::write_frame(&mut conn.writer, &hello.encode()).await?;

        let reply = Hello::decode(wire::expect_frame(&mut conn.reader, MessageType::Hello).await?)?;
        if reply.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "peer answered with protocol version {}, expected {}",
                reply.version, PROTOCOL_VERSION
            )));
        }
        if !reply.flags.contains(op) {
            return Err(Error::Protocol(format!(
                "peer did not accept {:?}, answered {:?}",
                op, reply.flags
            )));
        }
        debug!("Connected to {} ({})", reply.peer, self.transport.describe());
        Ok((conn, reply.compress()))
    }

    async fn push(&self, refstr: &str) -> Result<Done> {
        let (reference, mut info) = DatasetResolver::for_repo(&self.repo).resolve(refstr)?;
        if reference.path.is_some() {
            info.path = reference.path;
        }
        let manifest = build_manifest(self.repo.store().as_ref(), &info)?;

        let (mut conn, compress) = self.open(HelloFlags::PUSH).await?;
        wire::write_frame(&mut conn.writer, &manifest.encode()?).await?;
        let want = Want::decode(wire::expect_frame(&mut conn.reader, MessageType::Want).await?)?;

        let listed: HashSet<_> = manifest.entries.iter().map(|e| e.address).collect();
        if let Some(stray) = want.addresses.iter().find(|a| !listed.contains(a)) {
            let err = Error::Protocol(format!(
                "peer asked for {} which is not part of {}",
                stray,
                manifest.alias()
            ));
            let _ = wire::write_frame(&mut conn.writer, &Fatal::from_error(&err).encode()).await;
            return Err(err);
        }

        let sent = send_blocks(
            self.repo.store().as_ref(),
            &want.addresses,
            compress,
            &mut conn.writer,
        )
        .await;
        match sent {
            Ok(_) => {}
            // a peer that aborts mid-transfer says why before hanging up
            Err(e @ Error::RemoteUnavailable(_)) => {
                return match wire::read_frame(&mut conn.reader).await {
                    Ok((MessageType::Fatal, payload)) => Err(Fatal::decode(payload)?.into_error()),
                    _ => Err(e),
                };
            }
            // the peer is still waiting for blocks
            Err(e) => {
                let _ = wire::write_frame(&mut conn.writer, &Fatal::from_error(&e).encode()).await;
                return Err(e);
            }
        }

        let done = Done::decode(wire::expect_frame(&mut conn.reader, MessageType::Done).await?)?;
        conn.finish().await?;
        info!(
            "Pushed {} to {} ({} blocks, {} bytes)",
            manifest.alias(),
            self.transport.describe(),
            done.blocks,
            done.bytes
        );
        Ok(done)
    }

    async fn pull(&self, refstr: &str) -> Result<VersionInfo> {
        let (mut conn, _) = self.open(HelloFlags::PULL).await?;
        let request = PullRequest {
            reference: refstr.to_string(),
        };
        wire::write_frame(&mut conn.writer, &request.encode()).await?;
        let manifest = Manifest::decode(wire::expect_frame(&mut conn.reader, MessageType::Manifest).await?)?;
        let alias = manifest.alias();

        let received = receive_chain(
            &self.repo,
            &self.policy,
            manifest,
            &mut conn.reader,
            &mut conn.writer,
        )
        .await;
        let received = match received {
            Ok(received) => received,
            Err(e) => {
                let _ = wire::write_frame(&mut conn.writer, &Fatal::from_error(&e).encode()).await;
                return Err(e);
            }
        };
        conn.finish().await?;
        info!(
            "Pulled {} from {} ({} blocks, {} bytes)",
            alias,
            self.transport.describe(),
            received.blocks,
            received.bytes
        );
        Ok(received.info)
    }

    async fn fetch_feeds(&self, name: &str) -> Result<BTreeMap<String, Vec<VersionInfo>>> {
        let (mut conn, _) = self.open(HelloFlags::FEEDS).await?;
        let request = FeedsRequest {
            name: name.to_string(),
        };
        wire::write_frame(&mut conn.writer, &request.encode()).await?;
        let feeds = Feeds::decode(wire::expect_frame(&mut conn.reader, MessageType::Feeds).await?)?;
        conn.finish().await?;
        Ok(feeds.feeds)
    }

    async fn fetch_preview(&self, refstr: &str) -> Result<Dataset> {
        let (mut conn, _) = self.open(HelloFlags::PREVIEW).await?;
        let request = PreviewRequest {
            reference: refstr.to_string(),
        };
        wire::write_frame(&mut conn.writer, &request.encode()).await?;
        let preview = Preview::decode(wire::expect_frame(&mut conn.reader, MessageType::Preview).await?)?;
        conn.finish().await?;
        Ok(preview.dataset)
    }

    async fn request_remove(&self, refstr: &str, n: i64) -> Result<Option<ContentAddress>> {
        let (mut conn, _) = self.open(HelloFlags::REMOVE).await?;
        let request = RemoveRequest {
            reference: refstr.to_string(),
            n,
        };
        wire::write_frame(&mut conn.writer, &request.encode()).await?;
        let done = Done::decode(wire::expect_frame(&mut conn.reader, MessageType::Done).await?)?;
        conn.finish().await?;
        info!(
            "Removed {} versions of {} on {}",
            n,
            refstr,
            self.transport.describe()
        );
        Ok(done.head)
    }
}

#[async_trait]
impl<T: PeerTransport> SyncClient for PeerSyncClient<T> {
    async fn add_dataset(&self, refstr: &str) -> Result<Done> {
        self.bounded("push", self.push(refstr)).await
    }

    async fn pull_dataset(&self, refstr: &str) -> Result<VersionInfo> {
        self.bounded("pull", self.pull(refstr)).await
    }

    async fn feeds(&self) -> Result<BTreeMap<String, Vec<VersionInfo>>> {
        self.bounded("feeds", self.fetch_feeds("")).await
    }

    async fn feed(&self, name: &str) -> Result<Vec<VersionInfo>> {
        let name = if name.is_empty() { FEED_RECENT } else { name };
        let mut feeds = self.bounded("feed", self.fetch_feeds(name)).await?;
        feeds
            .remove(name)
            .ok_or_else(|| Error::Protocol(format!("peer did not return feed {:?}", name)))
    }

    async fn preview(&self, refstr: &str) -> Result<Dataset> {
        self.bounded("preview", self.fetch_preview(refstr)).await
    }

    async fn remove_versions(&self, refstr: &str, n: i64) -> Result<Option<ContentAddress>> {
        self.bounded("remove", self.request_remove(refstr, n)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::transport::LocalPeer;

    #[tokio::test]
    async fn test_unconfigured_client() {
        let client: Option<PeerSyncClient<LocalPeer>> = None;
        assert!(matches!(
            client.feeds().await.unwrap_err(),
            Error::NoRemoteClient
        ));
        assert!(matches!(
            client.add_dataset("alice/cities").await.unwrap_err(),
            Error::NoRemoteClient
        ));
    }
}
