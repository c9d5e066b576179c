//! Dataset references and version summaries.
//!
//! A reference string has the form `username/name` with an optional
//! `@<address>` suffix pinning a specific version.

use crate::error::{Error, Result};
use crate::store::ContentAddress;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Longest accepted dataset name
pub const MAX_NAME_LEN: usize = 144;

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").expect("static regex"))
}

fn username_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_\-.]+$").expect("static regex"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub username: String,
    pub profile_id: String,
    pub name: String,
    pub path: Option<ContentAddress>,
}

impl Ref {
    pub fn new(username: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: ContentAddress) -> Self {
        self.path = Some(path);
        self
    }

    /// Parse `username/name[@address]`.
    ///
    /// Names containing upper-case letters parse successfully; see
    /// [`is_bad_case`].
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty reference".to_string()));
        }

        let (alias, path) = match s.split_once('@') {
            Some((alias, path)) => (alias, Some(path)),
            None => (s, None),
        };

        let (username, name) = alias.split_once('/').ok_or_else(|| {
            Error::InvalidArgument(format!(
                "invalid reference {:?}: expected username/name",
                s
            ))
        })?;

        if !username_pattern().is_match(username) {
            return Err(Error::InvalidArgument(format!(
                "invalid username {:?} in reference {:?}",
                username, s
            )));
        }
        validate_name(name)?;

        let path = match path {
            Some(p) => Some(p.trim_start_matches('/').parse::<ContentAddress>()?),
            None => None,
        };

        Ok(Self {
            username: username.to_string(),
            profile_id: String::new(),
            name: name.to_string(),
            path,
        })
    }

    /// `username/name` without the path
    pub fn alias(&self) -> String {
        format!("{}/{}", self.username, self.name)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.name)?;
        if let Some(path) = &self.path {
            write!(f, "@{}", path)?;
        }
        Ok(())
    }
}

/// Names must start with a letter and contain only letters, digits and `_`.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN || !name_pattern().is_match(name) {
        return Err(Error::InvalidArgument(format!(
            "illegal name '{}', names must start with a letter and consist of only a-z,0-9, and _. max length {} characters",
            name, MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// True if `name` is legal but breaks the lower-case convention.
pub fn is_bad_case(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
}

/// Denormalized summary of a reference's current head.
///
/// Derived from the chain and the reference table, never authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub init_id: String,
    pub username: String,
    pub profile_id: String,
    pub name: String,
    pub path: Option<ContentAddress>,
    pub published: bool,
    pub foreign: bool,
    pub meta_title: String,
    /// Comma-separated meta themes
    pub theme_list: String,
    pub body_size: u64,
    pub body_rows: u64,
    pub body_format: String,
    pub num_errors: u64,
    /// Unix seconds
    pub commit_time: i64,
    pub num_versions: u64,
    pub fsi_path: Option<String>,
}

impl VersionInfo {
    pub fn simple_ref(&self) -> Ref {
        Ref {
            username: self.username.clone(),
            profile_id: self.profile_id.clone(),
            name: self.name.clone(),
            path: self.path,
        }
    }
}
