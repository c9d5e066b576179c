//! Receiving side of a chain transfer.
//!
//! Shared by a peer accepting a push and a client performing a pull: both
//! check the manifest against their own policy, ask for the blocks they
//! lack, then verify and commit through a [`TransferSession`].

use super::protocol::{self as wire, Block, BlockEnd, Fatal, Manifest, MessageType, Want};
use super::session::TransferSession;
use crate::config::AdmissionPolicy;
use crate::dsref::VersionInfo;
use crate::error::{Error, Result};
use crate::repo::Repo;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone)]
pub struct Received {
    pub info: VersionInfo,
    pub blocks: u64,
    pub bytes: u64,
}

/// Admit, fetch, verify and commit the chain described by `manifest`.
///
/// On error nothing has been written to the repo. Telling the peer about
/// the failure is left to the caller.
pub async fn receive_chain<R, W>(
    repo: &Repo,
    policy: &AdmissionPolicy,
    manifest: Manifest,
    reader: &mut R,
    writer: &mut W,
) -> Result<Received>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut session = TransferSession::new(manifest, policy.clone());
    let want = session.admit(repo.store().as_ref())?;
    wire::write_frame(writer, &Want { addresses: want }.encode()).await?;

    session.begin_transfer()?;
    if let Err(e) = receive_blocks(&mut session, policy, reader).await {
        session.abort(&e);
        return Err(e);
    }
    session.verify(repo.store().as_ref())?;

    let blocks = session.blocks_received() as u64;
    let bytes = session.bytes_received();
    let info = session.commit(repo).await?;
    Ok(Received {
        info,
        blocks,
        bytes,
    })
}

async fn receive_blocks<R: AsyncRead + Unpin>(
    session: &mut TransferSession,
    policy: &AdmissionPolicy,
    reader: &mut R,
) -> Result<()> {
    loop {
        let (msg_type, payload) = match session.remaining() {
            Some(left) => tokio::time::timeout(left, wire::read_frame(reader))
                .await
                .map_err(|_| {
                    Error::AdmissionRejected(format!(
                        "transfer exceeded time budget of {}ms",
                        policy.accept_timeout_ms
                    ))
                })??,
            None => wire::read_frame(reader).await?,
        };

        match msg_type {
            MessageType::Block => {
                let block = Block::decode(payload)?;
                let address = block.address;
                session.receive_block(address, block.into_content()?)?;
            }
            MessageType::BlockEnd => {
                let end = BlockEnd::decode(payload)?;
                if end.count != session.blocks_received() as u64 {
                    return Err(Error::Protocol(format!(
                        "sender reported {} blocks, received {}",
                        end.count,
                        session.blocks_received()
                    )));
                }
                return Ok(());
            }
            MessageType::Fatal => return Err(Fatal::decode(payload)?.into_error()),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {:?} during block transfer",
                    other
                )))
            }
        }
    }
}
