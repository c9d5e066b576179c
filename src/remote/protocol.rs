//! Peer wire protocol.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings are length-prefixed (u16 len + UTF-8).
//! Frame format: len:u32 | type:u8 | payload, where len counts the payload.
//!
//! Fixed-shape messages are packed by hand; manifests, feeds and previews
//! are bincode-encoded payloads.

use crate::dataset::Dataset;
use crate::dsref::VersionInfo;
use crate::error::{Error, Result};
use crate::store::ContentAddress;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Maximum frame size (64MB)
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Largest block that fits in a single Block frame
pub const MAX_BLOCK_SIZE: u64 = MAX_FRAME_SIZE as u64 - (1 + ContentAddress::LEN as u64 + 4);

const HEADER_LEN: usize = 5;

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Manifest = 0x02,
    Want = 0x03,
    Block = 0x04,
    BlockEnd = 0x05,
    Done = 0x06,
    FeedsRequest = 0x07,
    Feeds = 0x08,
    PreviewRequest = 0x09,
    Preview = 0x0A,
    RemoveRequest = 0x0B,
    PullRequest = 0x0C,
    Fatal = 0x0E,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Manifest),
            0x03 => Some(Self::Want),
            0x04 => Some(Self::Block),
            0x05 => Some(Self::BlockEnd),
            0x06 => Some(Self::Done),
            0x07 => Some(Self::FeedsRequest),
            0x08 => Some(Self::Feeds),
            0x09 => Some(Self::PreviewRequest),
            0x0A => Some(Self::Preview),
            0x0B => Some(Self::RemoveRequest),
            0x0C => Some(Self::PullRequest),
            0x0E => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    /// Operation requested by the client, plus session options
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFlags: u32 {
        const PUSH = 1 << 0;
        const PULL = 1 << 1;
        const FEEDS = 1 << 2;
        const PREVIEW = 1 << 3;
        const REMOVE = 1 << 4;
        const COMPRESSION = 1 << 5;
    }
}

impl HelloFlags {
    pub const OPERATIONS: HelloFlags = HelloFlags::PUSH
        .union(HelloFlags::PULL)
        .union(HelloFlags::FEEDS)
        .union(HelloFlags::PREVIEW)
        .union(HelloFlags::REMOVE);
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        const COMPRESSED = 1 << 0;
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidArgument = 1,
    NotFound = 2,
    Integrity = 3,
    AdmissionRejected = 4,
    Protocol = 5,
    Internal = 6,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::InvalidArgument),
            2 => Some(Self::NotFound),
            3 => Some(Self::Integrity),
            4 => Some(Self::AdmissionRejected),
            5 => Some(Self::Protocol),
            6 => Some(Self::Internal),
            _ => None,
        }
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn header(buf: &mut BytesMut, msg_type: MessageType, payload_len: usize) {
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(Error::Protocol(format!("{} truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(Error::Protocol(format!("{} truncated", what)));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| Error::Protocol(format!("invalid UTF-8 in {}", what)))
}

fn get_address(payload: &mut Bytes, what: &str) -> Result<ContentAddress> {
    if payload.remaining() < ContentAddress::LEN {
        return Err(Error::Protocol(format!("{} truncated", what)));
    }
    let mut raw = [0u8; 32];
    payload.copy_to_slice(&mut raw);
    Ok(ContentAddress::from_raw(raw))
}

fn string_frame(msg_type: MessageType, s: &str) -> Bytes {
    let payload_len = 2 + s.len();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
    header(&mut buf, msg_type, payload_len);
    put_str(&mut buf, s);
    buf.freeze()
}

fn bincode_frame<T: Serialize>(msg_type: MessageType, value: &T) -> Result<Bytes> {
    let payload = bincode::serialize(value)?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header(&mut buf, msg_type, payload.len());
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

fn bincode_decode<T: DeserializeOwned>(payload: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| Error::Protocol(format!("invalid {}: {}", what, e)))
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
    /// Username of the sending side, for logs
    pub peer: String,
}

impl Hello {
    pub fn new(flags: HelloFlags, peer: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
            peer: peer.into(),
        }
    }

    pub fn compress(&self) -> bool {
        self.flags.contains(HelloFlags::COMPRESSION)
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + 4 + 2 + self.peer.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Hello, payload_len);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        put_str(&mut buf, &self.peer);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            return Err(Error::Protocol("Hello payload too short".to_string()));
        }
        let version = payload.get_u16();
        let flags = HelloFlags::from_bits_truncate(payload.get_u32());
        let peer = get_str(&mut payload, "Hello peer")?;
        Ok(Self {
            version,
            flags,
            peer,
        })
    }
}

// =============================================================================
// MANIFEST (0x02)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub address: ContentAddress,
    pub size: u64,
    /// Whether the sender can supply this block
    pub available: bool,
}

/// Everything a destination needs to decide on and perform a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub init_id: String,
    pub username: String,
    pub profile_id: String,
    pub name: String,
    pub head: ContentAddress,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn unavailable(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| !e.available)
    }

    pub fn alias(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }

    pub fn encode(&self) -> Result<Bytes> {
        bincode_frame(MessageType::Manifest, self)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        bincode_decode(&payload, "Manifest")
    }
}

// =============================================================================
// WANT (0x03)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Want {
    pub addresses: Vec<ContentAddress>,
}

impl Want {
    pub fn encode(&self) -> Bytes {
        let payload_len = 4 + self.addresses.len() * ContentAddress::LEN;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Want, payload_len);
        buf.put_u32(self.addresses.len() as u32);
        for address in &self.addresses {
            buf.put_slice(address.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(Error::Protocol("Want payload too short".to_string()));
        }
        let count = payload.get_u32() as usize;
        if payload.remaining() < count * ContentAddress::LEN {
            return Err(Error::Protocol("Want payload truncated".to_string()));
        }
        let addresses = (0..count)
            .map(|_| get_address(&mut payload, "Want address"))
            .collect::<Result<_>>()?;
        Ok(Self { addresses })
    }
}

// =============================================================================
// BLOCK (0x04)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub flags: BlockFlags,
    pub address: ContentAddress,
    pub data: Bytes,
}

impl Block {
    /// Frame `data`, zstd-compressing it when `compress` is set and that
    /// makes it smaller.
    pub fn new(address: ContentAddress, data: Bytes, compress: bool) -> Result<Self> {
        if data.len() as u64 > MAX_BLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "block {} is {} bytes, over the transfer limit of {} bytes",
                address,
                data.len(),
                MAX_BLOCK_SIZE
            )));
        }
        if compress {
            let packed = zstd::encode_all(&data[..], 3)?;
            if packed.len() < data.len() {
                return Ok(Self {
                    flags: BlockFlags::COMPRESSED,
                    address,
                    data: Bytes::from(packed),
                });
            }
        }
        Ok(Self {
            flags: BlockFlags::empty(),
            address,
            data,
        })
    }

    /// The block's original bytes
    pub fn into_content(self) -> Result<Bytes> {
        if self.flags.contains(BlockFlags::COMPRESSED) {
            let raw = zstd::decode_all(&self.data[..])
                .map_err(|e| Error::Protocol(format!("bad compressed block {}: {}", self.address, e)))?;
            Ok(Bytes::from(raw))
        } else {
            Ok(self.data)
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 1 + ContentAddress::LEN + 4 + self.data.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Block, payload_len);
        buf.put_u8(self.flags.bits());
        buf.put_slice(self.address.as_bytes());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 + ContentAddress::LEN + 4 {
            return Err(Error::Protocol("Block payload too short".to_string()));
        }
        let flags = BlockFlags::from_bits_truncate(payload.get_u8());
        let address = get_address(&mut payload, "Block address")?;
        let data_len = payload.get_u32() as usize;
        if payload.remaining() < data_len {
            return Err(Error::Protocol("Block content truncated".to_string()));
        }
        let data = payload.copy_to_bytes(data_len);
        Ok(Self {
            flags,
            address,
            data,
        })
    }
}

// =============================================================================
// BLOCK_END (0x05)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEnd {
    pub count: u64,
}

impl BlockEnd {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 8);
        header(&mut buf, MessageType::BlockEnd, 8);
        buf.put_u64(self.count);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            return Err(Error::Protocol("BlockEnd payload too short".to_string()));
        }
        Ok(Self {
            count: payload.get_u64(),
        })
    }
}

// =============================================================================
// DONE (0x06)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Done {
    /// Head after the operation, if the reference still exists
    pub head: Option<ContentAddress>,
    pub blocks: u64,
    pub bytes: u64,
}

impl Done {
    pub fn encode(&self) -> Bytes {
        let payload_len = 1 + ContentAddress::LEN + 16;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Done, payload_len);
        match &self.head {
            Some(head) => {
                buf.put_u8(1);
                buf.put_slice(head.as_bytes());
            }
            None => {
                buf.put_u8(0);
                buf.put_bytes(0, ContentAddress::LEN);
            }
        }
        buf.put_u64(self.blocks);
        buf.put_u64(self.bytes);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 + ContentAddress::LEN + 16 {
            return Err(Error::Protocol("Done payload too short".to_string()));
        }
        let has_head = payload.get_u8() != 0;
        let head = get_address(&mut payload, "Done head")?;
        Ok(Self {
            head: has_head.then_some(head),
            blocks: payload.get_u64(),
            bytes: payload.get_u64(),
        })
    }
}

// =============================================================================
// Requests (0x07, 0x09, 0x0B, 0x0C)
// =============================================================================

/// Empty `name` asks for every feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedsRequest {
    pub name: String,
}

impl FeedsRequest {
    pub fn encode(&self) -> Bytes {
        string_frame(MessageType::FeedsRequest, &self.name)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            name: get_str(&mut payload, "FeedsRequest name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    pub reference: String,
}

impl PreviewRequest {
    pub fn encode(&self) -> Bytes {
        string_frame(MessageType::PreviewRequest, &self.reference)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            reference: get_str(&mut payload, "PreviewRequest reference")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub reference: String,
}

impl PullRequest {
    pub fn encode(&self) -> Bytes {
        string_frame(MessageType::PullRequest, &self.reference)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        Ok(Self {
            reference: get_str(&mut payload, "PullRequest reference")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveRequest {
    pub reference: String,
    pub n: i64,
}

impl RemoveRequest {
    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + self.reference.len() + 8;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        header(&mut buf, MessageType::RemoveRequest, payload_len);
        put_str(&mut buf, &self.reference);
        buf.put_i64(self.n);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let reference = get_str(&mut payload, "RemoveRequest reference")?;
        if payload.remaining() < 8 {
            return Err(Error::Protocol("RemoveRequest payload truncated".to_string()));
        }
        Ok(Self {
            reference,
            n: payload.get_i64(),
        })
    }
}

// =============================================================================
// FEEDS (0x08) / PREVIEW (0x0A)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feeds {
    pub feeds: BTreeMap<String, Vec<VersionInfo>>,
}

impl Feeds {
    pub fn encode(&self) -> Result<Bytes> {
        bincode_frame(MessageType::Feeds, self)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        bincode_decode(&payload, "Feeds")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub dataset: Dataset,
}

impl Preview {
    pub fn encode(&self) -> Result<Bytes> {
        bincode_frame(MessageType::Preview, self)
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        bincode_decode(&payload, "Preview")
    }
}

// =============================================================================
// FATAL (0x0E)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    /// Describe `err` for the remote side
    pub fn from_error(err: &Error) -> Self {
        let (code, message) = match err {
            Error::InvalidArgument(m) => (ErrorCode::InvalidArgument, m.clone()),
            Error::NotFound(m) => (ErrorCode::NotFound, m.clone()),
            Error::Integrity { address, actual } => {
                (ErrorCode::Integrity, format!("{} {}", address, actual))
            }
            Error::AdmissionRejected(m) => (ErrorCode::AdmissionRejected, m.clone()),
            Error::Protocol(m) => (ErrorCode::Protocol, m.clone()),
            other => (ErrorCode::Internal, other.to_string()),
        };
        Self {
            code: code as u16,
            message,
        }
    }

    /// The error the remote side reported
    pub fn into_error(self) -> Error {
        match ErrorCode::from_u16(self.code) {
            Some(ErrorCode::InvalidArgument) => Error::InvalidArgument(self.message),
            Some(ErrorCode::NotFound) => Error::NotFound(self.message),
            Some(ErrorCode::Integrity) => {
                let (address, actual) = self
                    .message
                    .split_once(' ')
                    .map(|(a, b)| (a.to_string(), b.to_string()))
                    .unwrap_or_else(|| (self.message.clone(), String::new()));
                Error::Integrity { address, actual }
            }
            Some(ErrorCode::AdmissionRejected) => Error::AdmissionRejected(self.message),
            Some(ErrorCode::Protocol) => Error::Protocol(self.message),
            Some(ErrorCode::Internal) | None => {
                Error::Protocol(format!("remote error {}: {}", self.code, self.message))
            }
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + 2 + self.message.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        header(&mut buf, MessageType::Fatal, payload_len);
        buf.put_u16(self.code);
        put_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(Error::Protocol("Fatal payload too short".to_string()));
        }
        let code = payload.get_u16();
        let message = get_str(&mut payload, "Fatal message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::RemoteUnavailable("peer closed the connection".to_string()))
        }
        Err(e) => return Err(Error::RemoteUnavailable(format!("read failed: {}", e))),
    };

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r
        .read_u8()
        .await
        .map_err(|e| Error::RemoteUnavailable(format!("read failed: {}", e)))?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| Error::Protocol(format!("unknown message type 0x{:02x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| Error::RemoteUnavailable(format!("read failed: {}", e)))?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Read the next frame, expecting `expected`. A Fatal frame is turned back
/// into the error it carries.
pub async fn expect_frame<R: AsyncRead + Unpin>(r: &mut R, expected: MessageType) -> Result<Bytes> {
    let (msg_type, payload) = read_frame(r).await?;
    if msg_type == expected {
        return Ok(payload);
    }
    if msg_type == MessageType::Fatal {
        return Err(Fatal::decode(payload)?.into_error());
    }
    Err(Error::Protocol(format!(
        "expected {:?}, got {:?}",
        expected, msg_type
    )))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    if frame.len() > HEADER_LEN + MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "frame size {} exceeds maximum allowed size {}",
            frame.len() - HEADER_LEN,
            MAX_FRAME_SIZE
        )));
    }
    w.write_all(frame)
        .await
        .map_err(|e| Error::RemoteUnavailable(format!("write failed: {}", e)))?;
    w.flush()
        .await
        .map_err(|e| Error::RemoteUnavailable(format!("write failed: {}", e)))
}

// =============================================================================
// Version Negotiation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    Supported(u16),
    TooOld { client: u16, min_supported: u16 },
    TooNew { client: u16, max_supported: u16 },
}

pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(frame: Bytes) -> (MessageType, Bytes) {
        let mut frame = frame;
        let len = frame.get_u32() as usize;
        let msg_type = MessageType::from_u8(frame.get_u8()).unwrap();
        assert_eq!(frame.remaining(), len);
        (msg_type, frame)
    }

    #[test]
    fn test_hello_wire_layout() {
        let hello = Hello::new(HelloFlags::PUSH | HelloFlags::COMPRESSION, "alice");
        let (msg_type, p) = payload(hello.encode());
        assert_eq!(msg_type, MessageType::Hello);
        let decoded = Hello::decode(p).unwrap();
        assert_eq!(decoded, hello);
        assert!(decoded.compress());
    }

    #[test]
    fn test_compressed_block_restores_content() {
        let data = Bytes::from(vec![b'a'; 4096]);
        let address = ContentAddress::for_bytes(&data);
        let block = Block::new(address, data.clone(), true).unwrap();
        assert!(block.data.len() < data.len());

        let (_, p) = payload(block.encode());
        let decoded = Block::decode(p).unwrap();
        assert_eq!(decoded.into_content().unwrap(), data);
    }

    #[test]
    fn test_incompressible_block_sent_raw() {
        let data = Bytes::from_static(b"xq");
        let address = ContentAddress::for_bytes(&data);
        let block = Block::new(address, data.clone(), true).unwrap();
        assert!(block.flags.is_empty());
        assert_eq!(block.into_content().unwrap(), data);
    }

    #[test]
    fn test_oversized_block_is_refused() {
        let data = Bytes::from(vec![0u8; MAX_BLOCK_SIZE as usize + 1]);
        let address = ContentAddress::for_bytes(&data);
        let err = Block::new(address, data, false).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("transfer limit"));
    }

    #[test]
    fn test_done_without_head() {
        let done = Done {
            head: None,
            blocks: 3,
            bytes: 10,
        };
        let (_, p) = payload(done.encode());
        assert_eq!(Done::decode(p).unwrap(), done);
    }

    #[test]
    fn test_fatal_maps_back_to_error() {
        let err = Error::AdmissionRejected("too big".to_string());
        let (_, p) = payload(Fatal::from_error(&err).encode());
        let back = Fatal::decode(p).unwrap().into_error();
        assert!(matches!(back, Error::AdmissionRejected(ref m) if m == "too big"));

        let err = Error::Integrity {
            address: "aa".to_string(),
            actual: "bb".to_string(),
        };
        let back = Fatal::from_error(&err).into_error();
        assert!(matches!(back, Error::Integrity { ref address, ref actual } if address == "aa" && actual == "bb"));
    }

    #[test]
    fn test_truncated_payloads_rejected() {
        assert!(Want::decode(Bytes::from_static(&[0, 0, 0, 2, 1, 2])).is_err());
        assert!(Block::decode(Bytes::from_static(&[0, 1])).is_err());
        assert!(Fatal::decode(Bytes::from_static(&[0])).is_err());
    }

    #[tokio::test]
    async fn test_frame_io_and_fatal_passthrough() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &FeedsRequest { name: "recent".into() }.encode())
            .await
            .unwrap();
        write_frame(&mut a, &Fatal::from_error(&Error::NotFound("gone".into())).encode())
            .await
            .unwrap();

        let p = expect_frame(&mut b, MessageType::FeedsRequest).await.unwrap();
        assert_eq!(FeedsRequest::decode(p).unwrap().name, "recent");

        let err = expect_frame(&mut b, MessageType::Done).await.unwrap_err();
        assert!(err.is_not_found());

        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(Error::RemoteUnavailable(_))
        ));
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(
            negotiate_version(PROTOCOL_VERSION),
            VersionNegotiationResult::Supported(PROTOCOL_VERSION)
        );
        assert!(matches!(
            negotiate_version(PROTOCOL_VERSION_MAX + 1),
            VersionNegotiationResult::TooNew { .. }
        ));
        assert!(matches!(negotiate_version(0), VersionNegotiationResult::TooOld { .. }));
    }
}
