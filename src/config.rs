//! Repository configuration, loaded from TOML.
//!
//! ```toml
//! [profile]
//! username = "alice"
//! id = "QmAlice"
//!
//! [repo]
//! path = "~/.dsync/repo"
//!
//! [admission]
//! accept_size_max = 104857600
//! accept_timeout_ms = -1
//! require_all_blocks = true
//! allow_removes = false
//!
//! [remote]
//! feed_page_size = 30
//! preview_body_max = 102400
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of entries a feed returns
pub const DEFAULT_FEED_PAGE_SIZE: usize = 30;

/// Default preview body sample (100KB)
pub const DEFAULT_PREVIEW_BODY_MAX: usize = 100 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub profile: ProfileConfig,
    pub repo: RepoConfig,
    pub admission: AdmissionPolicy,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfileConfig {
    pub username: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepoConfig {
    /// Root directory of the block store and reference table
    pub path: Option<PathBuf>,
    /// Persisted resolution cache. Defaults to `<path>/dscache.bin`
    pub cache_file: Option<PathBuf>,
}

/// Limits a destination applies before and during a transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Maximum total transfer size in bytes, -1 for unlimited
    pub accept_size_max: i64,
    /// Maximum transfer duration in milliseconds, -1 for unlimited
    pub accept_timeout_ms: i64,
    /// Reject manifests listing blocks the sender cannot supply
    pub require_all_blocks: bool,
    /// Honor remote requests to remove versions
    pub allow_removes: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            accept_size_max: -1,
            accept_timeout_ms: -1,
            require_all_blocks: true,
            allow_removes: false,
        }
    }
}

impl AdmissionPolicy {
    pub fn size_limit(&self) -> Option<u64> {
        (self.accept_size_max >= 0).then_some(self.accept_size_max as u64)
    }

    pub fn time_limit(&self) -> Option<Duration> {
        (self.accept_timeout_ms >= 0).then(|| Duration::from_millis(self.accept_timeout_ms as u64))
    }

    pub fn validate(&self) -> Result<()> {
        if self.accept_size_max < -1 {
            return Err(Error::Config(format!(
                "accept_size_max must be >= -1, got {}",
                self.accept_size_max
            )));
        }
        if self.accept_timeout_ms < -1 {
            return Err(Error::Config(format!(
                "accept_timeout_ms must be >= -1, got {}",
                self.accept_timeout_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub feed_page_size: usize,
    pub preview_body_max: usize,
    /// Compress blocks in transit
    pub compress: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            feed_page_size: DEFAULT_FEED_PAGE_SIZE,
            preview_body_max: DEFAULT_PREVIEW_BODY_MAX,
            compress: false,
        }
    }
}

impl Config {
    /// Default config location (`<config dir>/dsync/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dsync").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.profile.username.is_empty() {
            return Err(Error::Config("profile.username is required".to_string()));
        }
        if self.profile.id.is_empty() {
            return Err(Error::Config("profile.id is required".to_string()));
        }
        if self.remote.feed_page_size == 0 {
            return Err(Error::Config("remote.feed_page_size must be > 0".to_string()));
        }
        self.admission.validate()
    }

    /// Store root, falling back to `<data dir>/dsync`
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dsync")
        })
    }

    pub fn cache_path(&self) -> PathBuf {
        self.repo
            .cache_file
            .clone()
            .unwrap_or_else(|| self.repo_path().join("dscache.bin"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            [profile]
            username = "alice"
            id = "QmAlice"

            [admission]
            accept_size_max = 1024
            accept_timeout_ms = 500
            require_all_blocks = false
            allow_removes = true

            [remote]
            feed_page_size = 5
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();

        assert_eq!(config.profile.username, "alice");
        assert_eq!(config.admission.size_limit(), Some(1024));
        assert_eq!(
            config.admission.time_limit(),
            Some(Duration::from_millis(500))
        );
        assert!(config.admission.allow_removes);
        assert_eq!(config.remote.feed_page_size, 5);
        assert_eq!(config.remote.preview_body_max, DEFAULT_PREVIEW_BODY_MAX);
    }

    #[test]
    fn test_unlimited_policy() {
        let policy = AdmissionPolicy::default();
        assert_eq!(policy.size_limit(), None);
        assert_eq!(policy.time_limit(), None);
        assert!(policy.require_all_blocks);
        assert!(!policy.allow_removes);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let policy = AdmissionPolicy {
            accept_size_max: -5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_missing_username_rejected() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[profile]\nusername = \"bob\"\nid = \"QmBob\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.profile.id, "QmBob");
        assert_eq!(config.cache_path(), config.repo_path().join("dscache.bin"));
    }
}
