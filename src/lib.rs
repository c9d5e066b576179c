//! Versioned datasets on content-addressed blocks.
//!
//! Each version of a dataset is a small record block pointing at its
//! parent and at separate commit, meta, structure and body blocks. A
//! reference names the head of such a chain. On top of that sit:
//!
//! - [`history`]: dropping the most recent versions of a chain
//! - [`dscache`]: a snapshot table answering "who is alice/cities" without
//!   touching the block store
//! - [`resolver`]: reference strings to loaded datasets
//! - [`remote`]: push, pull, feeds, preview and remote removal between
//!   peers, gated by an admission policy

pub mod chain;
pub mod config;
pub mod dataset;
pub mod dscache;
pub mod dsref;
pub mod error;
pub mod history;
pub mod refs;
pub mod remote;
pub mod repo;
pub mod resolver;
pub mod store;

pub use config::{AdmissionPolicy, Config};
pub use dataset::Dataset;
pub use dscache::Dscache;
pub use dsref::{Ref, VersionInfo};
pub use error::{Error, Result};
pub use history::remove_n_versions_from_store;
pub use repo::{Profile, Repo};
pub use resolver::DatasetResolver;
pub use store::{BlockStore, ContentAddress};
