//! Replicating datasets between peers.
//!
//! One request per connection: a client opens a stream through a
//! [`PeerTransport`], exchanges hellos naming the operation, and the
//! [`Peer`] on the far side answers from its own repo. Chain transfers
//! in either direction go through a [`TransferSession`] on the receiving
//! side, which enforces that side's [`AdmissionPolicy`](crate::config::AdmissionPolicy)
//! and commits only a fully verified chain.

pub mod client;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{PeerSyncClient, SyncClient};
pub use server::Peer;
pub use session::{SessionState, TransferSession};
pub use transport::{LocalPeer, PeerConnection, PeerTransport, ProcessPeer, SshTarget};
