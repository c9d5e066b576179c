//! Ways of reaching a peer.
//!
//! Every transport yields a fresh duplex byte stream per request. The peer
//! on the other end runs [`Peer::serve`] on it.

use super::server::Peer;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

/// In-memory pipe capacity for [`LocalPeer`]
const DUPLEX_BUFFER: usize = 256 * 1024;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One open request stream
pub struct PeerConnection {
    pub reader: BoxReader,
    pub writer: BoxWriter,
    child: Option<Child>,
}

impl PeerConnection {
    pub fn new(reader: BoxReader, writer: BoxWriter) -> Self {
        Self {
            reader,
            writer,
            child: None,
        }
    }

    /// Close the stream and reap the server process, if any.
    pub async fn finish(self) -> Result<()> {
        let PeerConnection {
            reader,
            writer,
            child,
        } = self;
        drop(writer);
        drop(reader);
        if let Some(mut child) = child {
            let status = child.wait().await?;
            if !status.success() {
                debug!("peer process exited with {}", status);
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn connect(&self) -> Result<PeerConnection>;

    /// Human-readable peer location for logs
    fn describe(&self) -> String;
}

/// A peer served from a task in this process
#[derive(Clone)]
pub struct LocalPeer {
    peer: Arc<Peer>,
}

impl LocalPeer {
    pub fn new(peer: Arc<Peer>) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

#[async_trait]
impl PeerTransport for LocalPeer {
    async fn connect(&self) -> Result<PeerConnection> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let (server_reader, server_writer) = tokio::io::split(server);
        let peer = Arc::clone(&self.peer);
        tokio::spawn(async move {
            if let Err(e) = peer.serve(server_reader, server_writer).await {
                debug!("local peer request ended: {}", e);
            }
        });

        let (reader, writer) = tokio::io::split(client);
        Ok(PeerConnection::new(Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.peer.repo().profile().username)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

/// A peer reached by spawning `dsync --server <repo-dir>`, locally or over
/// ssh, and talking to it over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessPeer {
    program: PathBuf,
    ssh: Option<SshTarget>,
    repo_dir: PathBuf,
}

impl ProcessPeer {
    /// Run this executable against a local repo directory
    pub fn local(repo_dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_program(std::env::current_exe()?, repo_dir))
    }

    pub fn with_program(program: impl Into<PathBuf>, repo_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            ssh: None,
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }

    /// Run `dsync` on a remote host
    pub fn ssh(target: SshTarget, repo_dir: impl AsRef<Path>) -> Self {
        Self {
            program: PathBuf::from("dsync"),
            ssh: Some(target),
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }

    /// Parse `[user@]host:path` as an ssh peer and anything else as a
    /// local repo directory.
    pub fn parse(location: &str) -> Result<Self> {
        match location.split_once(':') {
            Some((host, path)) if !host.is_empty() && !host.contains('/') && !path.is_empty() => {
                let (user, host) = match host.split_once('@') {
                    Some((user, host)) => (Some(user.to_string()), host),
                    None => (None, host),
                };
                Ok(Self::ssh(
                    SshTarget {
                        host: host.to_string(),
                        user,
                        port: None,
                        identity_file: None,
                    },
                    path,
                ))
            }
            _ => Self::local(location),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.ssh {
            Some(target) => {
                let mut cmd = Command::new("ssh");
                cmd.arg(&target.host);
                if let Some(user) = &target.user {
                    cmd.arg("-l").arg(user);
                }
                if let Some(port) = target.port {
                    cmd.arg("-p").arg(port.to_string());
                }
                if let Some(key) = &target.identity_file {
                    cmd.arg("-i").arg(key);
                }
                cmd.arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.arg("--server").arg(&self.repo_dir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl PeerTransport for ProcessPeer {
    async fn connect(&self) -> Result<PeerConnection> {
        let mut child = self.command().spawn().map_err(|e| {
            Error::RemoteUnavailable(format!("failed to start {}: {}", self.describe(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::RemoteUnavailable("failed to open peer stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::RemoteUnavailable("failed to open peer stdout".to_string()))?;

        Ok(PeerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }

    fn describe(&self) -> String {
        match &self.ssh {
            Some(target) => match &target.user {
                Some(user) => format!("{}@{}:{}", user, target.host, self.repo_dir.display()),
                None => format!("{}:{}", target.host, self.repo_dir.display()),
            },
            None => self.repo_dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_location() {
        let peer = ProcessPeer::parse("bob@data.example.com:/srv/dsync").unwrap();
        let target = peer.ssh.clone().unwrap();
        assert_eq!(target.host, "data.example.com");
        assert_eq!(target.user.as_deref(), Some("bob"));
        assert_eq!(peer.repo_dir, PathBuf::from("/srv/dsync"));
        assert_eq!(peer.describe(), "bob@data.example.com:/srv/dsync");
    }

    #[test]
    fn test_parse_local_location() {
        let peer = ProcessPeer::parse("/tmp/repo").unwrap();
        assert!(peer.ssh.is_none());
        assert_eq!(peer.describe(), "/tmp/repo");

        let relative = ProcessPeer::parse("./peers/b").unwrap();
        assert!(relative.ssh.is_none());
    }
}
