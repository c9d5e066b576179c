//! Dataset components and the assembled dataset view.
//!
//! A version is stored as separate blocks: commit, meta, structure and body.
//! `Dataset` is the assembled, in-memory view of one version; its `name`
//! and `peername` are display fields stamped at load time and are never
//! written into a block.

use crate::store::ContentAddress;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub title: String,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Profile identifier of the author
    pub author: String,
    /// Digest binding the author to this commit (see [`Commit::sign`])
    pub signature: String,
}

impl Commit {
    /// Fill `author` and `signature` for the given profile.
    pub fn sign(&mut self, profile_id: &str) {
        use base64::Engine as _;

        let mut hasher = blake3::Hasher::new();
        hasher.update(profile_id.as_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(self.title.as_bytes());
        hasher.update(self.message.as_bytes());
        self.author = profile_id.to_string();
        self.signature = base64::engine::general_purpose::STANDARD.encode(hasher.finalize().as_bytes());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub theme: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Body encoding: "json" or "csv"
    pub format: String,
    /// Body length in bytes
    pub length: u64,
    /// Number of top-level rows/entries in the body
    pub entries: u64,
    /// Validation errors recorded at save time
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub depth: u32,
    /// JSON schema text, if any
    #[serde(default)]
    pub schema: Option<String>,
}

impl Structure {
    /// Derive body statistics for `body` in `format`.
    pub fn infer(format: &str, body: &[u8]) -> Self {
        let (entries, depth) = match format {
            "json" => match serde_json::from_slice::<serde_json::Value>(body) {
                Ok(serde_json::Value::Array(rows)) => (rows.len() as u64, 1 + array_depth(&rows)),
                Ok(serde_json::Value::Object(map)) => (map.len() as u64, 1),
                Ok(_) => (1, 0),
                Err(_) => (0, 0),
            },
            "csv" => (
                body.split(|b| *b == b'\n')
                    .filter(|line| !line.is_empty())
                    .count() as u64,
                2,
            ),
            _ => (0, 0),
        };
        Self {
            format: format.to_string(),
            length: body.len() as u64,
            entries,
            errors: 0,
            depth,
            schema: None,
        }
    }
}

fn array_depth(rows: &[serde_json::Value]) -> u32 {
    match rows.first() {
        Some(serde_json::Value::Array(_)) | Some(serde_json::Value::Object(_)) => 1,
        _ => 0,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// Display name, stamped on load
    pub name: String,
    /// Display username, stamped on load
    pub peername: String,
    /// Address of this version's record, if it has been committed
    pub path: Option<ContentAddress>,
    pub commit: Option<Commit>,
    pub meta: Option<Meta>,
    pub structure: Option<Structure>,
    pub body_path: Option<ContentAddress>,
    pub body: Option<Vec<u8>>,
}

impl Dataset {
    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }

    pub fn title(&self) -> &str {
        self.meta.as_ref().map(|m| m.title.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_json_array() {
        let s = Structure::infer("json", br#"[[1,"a"],[2,"b"],[3,"c"]]"#);
        assert_eq!(s.entries, 3);
        assert_eq!(s.depth, 2);
        assert_eq!(s.length, 25);
    }

    #[test]
    fn test_infer_csv() {
        let s = Structure::infer("csv", b"city,pop\ntoronto,40000000\nnew york,8500000\n");
        assert_eq!(s.entries, 3);
        assert_eq!(s.format, "csv");
    }

    #[test]
    fn test_infer_invalid_json() {
        let s = Structure::infer("json", b"{not json");
        assert_eq!(s.entries, 0);
    }

    #[test]
    fn test_signature_depends_on_author() {
        let mut a = Commit {
            title: "initial commit".into(),
            timestamp: 1,
            ..Default::default()
        };
        let mut b = a.clone();
        a.sign("QmA");
        b.sign("QmB");
        assert_eq!(a.author, "QmA");
        assert_ne!(a.signature, b.signature);
    }
}
