//! Sending side of a chain transfer.

use super::protocol::{self as wire, Block, BlockEnd, Manifest, ManifestEntry, MAX_BLOCK_SIZE};
use crate::chain;
use crate::dsref::VersionInfo;
use crate::error::{Error, Result};
use crate::store::{BlockStore, ContentAddress};
use std::collections::HashSet;
use tokio::io::AsyncWrite;
use tracing::debug;

/// Describe every block of the chain behind `info`.
///
/// Version records must be readable. Components that are missing locally
/// are listed as unavailable so the destination's policy can decide. A
/// block too large for one frame fails the whole manifest.
pub fn build_manifest(store: &dyn BlockStore, info: &VersionInfo) -> Result<Manifest> {
    let head = info
        .path
        .ok_or_else(|| Error::InvalidArgument(format!("{}/{} has no versions", info.username, info.name)))?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for (address, record) in chain::walk(store, &head)? {
        for block in std::iter::once(address).chain(record.components()) {
            if !seen.insert(block) {
                continue;
            }
            let entry = match store.size(&block) {
                Ok(size) if size > MAX_BLOCK_SIZE => {
                    return Err(Error::InvalidArgument(format!(
                        "block {} of {}/{} is {} bytes, over the transfer limit of {} bytes",
                        block, info.username, info.name, size, MAX_BLOCK_SIZE
                    )))
                }
                Ok(size) => ManifestEntry {
                    address: block,
                    size,
                    available: true,
                },
                Err(e) if e.is_not_found() => ManifestEntry {
                    address: block,
                    size: 0,
                    available: false,
                },
                Err(e) => return Err(e),
            };
            entries.push(entry);
        }
    }

    Ok(Manifest {
        init_id: info.init_id.clone(),
        username: info.username.clone(),
        profile_id: info.profile_id.clone(),
        name: info.name.clone(),
        head,
        entries,
    })
}

/// Stream the requested blocks followed by BlockEnd.
///
/// Returns (blocks, bytes) sent, counting uncompressed bytes.
pub async fn send_blocks<W: AsyncWrite + Unpin>(
    store: &dyn BlockStore,
    wanted: &[ContentAddress],
    compress: bool,
    writer: &mut W,
) -> Result<(u64, u64)> {
    let mut bytes = 0u64;
    for address in wanted {
        let data = store.get(address)?;
        bytes += data.len() as u64;
        let block = Block::new(*address, data, compress)?;
        wire::write_frame(writer, &block.encode()).await?;
    }

    let count = wanted.len() as u64;
    wire::write_frame(writer, &BlockEnd { count }.encode()).await?;
    debug!("Sent {} blocks ({} bytes, compress={})", count, bytes, compress);
    Ok((count, bytes))
}
