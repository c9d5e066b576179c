//! Peer server - answers one request per connection.
//!
//! Runs in-process behind [`LocalPeer`](super::LocalPeer) or as
//! `dsync --server <repo-dir>` over stdin/stdout.

use super::protocol::{
    self as wire, negotiate_version, Done, Fatal, Feeds, FeedsRequest, Hello, HelloFlags, Manifest,
    MessageType, Preview, PreviewRequest, PullRequest, RemoveRequest, VersionNegotiationResult,
    Want,
};
use super::receiver::receive_chain;
use super::sender::{build_manifest, send_blocks};
use crate::chain;
use crate::config::{AdmissionPolicy, Config, RemoteConfig};
use crate::dataset::Dataset;
use crate::dsref::{Ref, VersionInfo};
use crate::error::{Error, Result};
use crate::history::remove_n_versions_from_store;
use crate::repo::Repo;
use crate::resolver::DatasetResolver;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub struct Peer {
    repo: Arc<Repo>,
    policy: AdmissionPolicy,
    remote: RemoteConfig,
}

impl Peer {
    pub fn new(repo: Arc<Repo>, policy: AdmissionPolicy, remote: RemoteConfig) -> Self {
        Self {
            repo,
            policy,
            remote,
        }
    }

    pub fn from_config(repo: Arc<Repo>, config: &Config) -> Self {
        Self::new(repo, config.admission.clone(), config.remote.clone())
    }

    pub fn repo(&self) -> &Arc<Repo> {
        &self.repo
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Serve a single request on the given stream.
    ///
    /// Failures are reported to the client as a Fatal frame and returned.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let result = self.dispatch(&mut reader, &mut writer).await;
        if let Err(e) = &result {
            warn!("Peer request failed: {}", e);
            // the client may already be gone
            let _ = wire::write_frame(&mut writer, &Fatal::from_error(e).encode()).await;
        }
        result
    }

    async fn dispatch<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let hello = Hello::decode(wire::expect_frame(reader, MessageType::Hello).await?)?;
        match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(_) => {}
            VersionNegotiationResult::TooOld {
                client,
                min_supported,
            } => {
                return Err(Error::Protocol(format!(
                    "protocol version {} is too old, minimum is {}",
                    client, min_supported
                )))
            }
            VersionNegotiationResult::TooNew {
                client,
                max_supported,
            } => {
                return Err(Error::Protocol(format!(
                    "protocol version {} is too new, maximum is {}",
                    client, max_supported
                )))
            }
        }

        let op = hello.flags & HelloFlags::OPERATIONS;
        if op.bits().count_ones() != 1 {
            return Err(Error::Protocol(format!(
                "hello must name exactly one operation, got {:?}",
                op
            )));
        }
        let compress = hello.compress();
        let mut flags = op;
        flags.set(HelloFlags::COMPRESSION, compress);
        wire::write_frame(writer, &Hello::new(flags, &self.repo.profile().username).encode()).await?;
        debug!("Serving {:?} for {:?}", op, hello.peer);

        if op == HelloFlags::PUSH {
            self.handle_push(reader, writer).await
        } else if op == HelloFlags::PULL {
            self.handle_pull(reader, writer, compress).await
        } else if op == HelloFlags::FEEDS {
            self.handle_feeds(reader, writer).await
        } else if op == HelloFlags::PREVIEW {
            self.handle_preview(reader, writer).await
        } else {
            self.handle_remove(reader, writer).await
        }
    }

    fn resolver(&self) -> DatasetResolver {
        DatasetResolver::for_repo(&self.repo)
    }

    /// Resolve `refstr` to a summary whose path is the requested version
    fn resolve(&self, refstr: &str) -> Result<(Ref, VersionInfo)> {
        let (mut reference, mut info) = self.resolver().resolve(refstr)?;
        match reference.path {
            Some(path) => info.path = Some(path),
            None => reference.path = info.path,
        }
        Ok((reference, info))
    }

    async fn handle_push<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let manifest = Manifest::decode(wire::expect_frame(reader, MessageType::Manifest).await?)?;
        info!(
            "Receiving {} ({} blocks, {} bytes)",
            manifest.alias(),
            manifest.entries.len(),
            manifest.total_size()
        );
        let received = receive_chain(&self.repo, &self.policy, manifest, reader, writer).await?;
        let done = Done {
            head: received.info.path,
            blocks: received.blocks,
            bytes: received.bytes,
        };
        wire::write_frame(writer, &done.encode()).await
    }

    async fn handle_pull<R, W>(&self, reader: &mut R, writer: &mut W, compress: bool) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request = PullRequest::decode(wire::expect_frame(reader, MessageType::PullRequest).await?)?;
        let (_, info) = self.resolve(&request.reference)?;
        let manifest = build_manifest(self.repo.store().as_ref(), &info)?;
        wire::write_frame(writer, &manifest.encode()?).await?;

        let want = match wire::expect_frame(reader, MessageType::Want).await {
            Ok(payload) => Want::decode(payload)?,
            Err(e) => {
                // the client turned the manifest down
                debug!("Pull of {} declined: {}", manifest.alias(), e);
                return Ok(());
            }
        };

        let listed: HashSet<_> = manifest.entries.iter().map(|e| e.address).collect();
        if let Some(stray) = want.addresses.iter().find(|a| !listed.contains(a)) {
            return Err(Error::Protocol(format!(
                "requested block {} is not part of {}",
                stray,
                manifest.alias()
            )));
        }

        let (blocks, bytes) = send_blocks(self.repo.store().as_ref(), &want.addresses, compress, writer).await?;
        info!("Sent {} to puller ({} blocks, {} bytes)", manifest.alias(), blocks, bytes);
        Ok(())
    }

    async fn handle_feeds<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request = FeedsRequest::decode(wire::expect_frame(reader, MessageType::FeedsRequest).await?)?;
        let feeds = self.feeds(&request.name)?;
        wire::write_frame(writer, &Feeds { feeds }.encode()?).await
    }

    async fn handle_preview<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request = PreviewRequest::decode(wire::expect_frame(reader, MessageType::PreviewRequest).await?)?;
        let dataset = self.preview(&request.reference)?;
        wire::write_frame(writer, &Preview { dataset }.encode()?).await
    }

    async fn handle_remove<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let request = RemoveRequest::decode(wire::expect_frame(reader, MessageType::RemoveRequest).await?)?;
        if !self.policy.allow_removes {
            return Err(Error::AdmissionRejected(format!(
                "peer does not accept removes (asked to remove {} versions of {})",
                request.n, request.reference
            )));
        }

        let (reference, _) = self.resolve(&request.reference)?;
        let out = remove_n_versions_from_store(Some(self.repo.as_ref()), &reference, request.n).await?;
        wire::write_frame(
            writer,
            &Done {
                head: out.path,
                blocks: 0,
                bytes: 0,
            }
            .encode(),
        )
        .await
    }

    /// Answer a feed request from the cache alone. An empty name returns
    /// every feed.
    pub fn feeds(&self, name: &str) -> Result<BTreeMap<String, Vec<VersionInfo>>> {
        let root = self.repo.cache().snapshot();
        let page = self.remote.feed_page_size;
        if name.is_empty() {
            return Ok(root.feeds(page));
        }
        let feed = root.feed(name, page)?;
        Ok(BTreeMap::from([(name.to_string(), feed)]))
    }

    /// Head metadata and structure with at most `preview_body_max` bytes of
    /// body.
    pub fn preview(&self, refstr: &str) -> Result<Dataset> {
        let (reference, _) = self.resolve(refstr)?;
        let head = reference
            .path
            .ok_or_else(|| Error::NotFound(format!("no versions of {}", reference.alias())))?;

        let version = chain::load_version(self.repo.store().as_ref(), &head)?;
        let mut ds = version.to_dataset_without_body()?;
        if let Some(body) = version.body()? {
            let keep = body.len().min(self.remote.preview_body_max);
            ds.body = Some(body.slice(..keep).to_vec());
        }
        ds.name = reference.name;
        ds.peername = reference.username;
        Ok(ds)
    }

    /// Serve one request on this process's stdin/stdout
    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Profile;

    async fn peer(remote: RemoteConfig) -> Peer {
        let repo = Repo::in_memory(Profile::new("alice", "QmAlice"));
        let body: Vec<u8> = format!("[{}]", vec!["1"; 1000].join(",")).into_bytes();
        repo.save(
            "cities",
            Dataset {
                body: Some(body),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        Peer::new(Arc::new(repo), AdmissionPolicy::default(), remote)
    }

    #[tokio::test]
    async fn test_preview_truncates_body() {
        let peer = peer(RemoteConfig {
            preview_body_max: 10,
            ..Default::default()
        })
        .await;
        let ds = peer.preview("alice/cities").unwrap();
        assert_eq!(ds.body.as_ref().unwrap().len(), 10);
        assert_eq!(ds.structure.unwrap().entries, 1000);
        assert_eq!(ds.name, "cities");
        assert_eq!(ds.peername, "alice");
        assert!(ds.commit.is_some());
    }

    #[tokio::test]
    async fn test_preview_me_is_peer_profile() {
        let peer = peer(RemoteConfig::default()).await;
        let ds = peer.preview("me/cities").unwrap();
        assert_eq!(ds.peername, "alice");
        assert_eq!(ds.body.unwrap().len(), 2001);
    }

    #[tokio::test]
    async fn test_feeds_only_published() {
        let peer = peer(RemoteConfig::default()).await;
        assert!(peer.feeds("recent").unwrap()["recent"].is_empty());

        peer.repo()
            .set_published(&Ref::new("alice", "cities"), true)
            .await
            .unwrap();
        let feeds = peer.feeds("").unwrap();
        assert_eq!(feeds["recent"].len(), 1);
        assert!(peer.feeds("trending").unwrap_err().is_not_found());
    }
}
