//! Turning reference strings into loaded datasets.

use crate::chain;
use crate::dataset::Dataset;
use crate::dscache::Dscache;
use crate::dsref::{is_bad_case, Ref, VersionInfo};
use crate::error::{Error, Result};
use crate::repo::Repo;
use crate::store::BlockStore;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Username placeholder for the local profile
pub const ME: &str = "me";

/// A mutable, uncommitted on-disk copy of a dataset.
pub trait WorkingDir: Send + Sync {
    fn read_dir(&self, path: &Path) -> Result<Dataset>;
    fn write_dir(&self, path: &Path, ds: &Dataset) -> Result<()>;
}

/// Checkout layout: `dataset.json` with everything but the body, and the
/// body beside it as `body.<format>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWorkingDir;

impl JsonWorkingDir {
    const DATASET_FILE: &'static str = "dataset.json";
    const BODY_FORMATS: &'static [&'static str] = &["json", "csv"];
}

impl WorkingDir for JsonWorkingDir {
    fn read_dir(&self, path: &Path) -> Result<Dataset> {
        let dataset_file = path.join(Self::DATASET_FILE);
        let data = fs::read(&dataset_file).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("no working directory at {}", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let mut ds: Dataset = serde_json::from_slice(&data)?;

        for format in Self::BODY_FORMATS {
            let body_file = path.join(format!("body.{}", format));
            if body_file.is_file() {
                ds.body = Some(fs::read(&body_file)?);
                break;
            }
        }
        Ok(ds)
    }

    fn write_dir(&self, path: &Path, ds: &Dataset) -> Result<()> {
        fs::create_dir_all(path)?;
        let mut head = ds.clone();
        let body = head.body.take();
        fs::write(path.join(Self::DATASET_FILE), serde_json::to_vec_pretty(&head)?)?;

        if let Some(body) = body {
            let format = ds
                .structure
                .as_ref()
                .map(|s| s.format.as_str())
                .filter(|f| !f.is_empty())
                .unwrap_or("json");
            fs::write(path.join(format!("body.{}", format)), body)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub dataset: Dataset,
    pub init_id: String,
    pub reference: Ref,
    pub info: VersionInfo,
}

pub struct DatasetResolver {
    cache: Arc<Dscache>,
    store: Arc<dyn BlockStore>,
    working_dir: Option<Arc<dyn WorkingDir>>,
    default_username: String,
}

impl DatasetResolver {
    pub fn new(cache: Arc<Dscache>, store: Arc<dyn BlockStore>, default_username: impl Into<String>) -> Self {
        Self {
            cache,
            store,
            working_dir: None,
            default_username: default_username.into(),
        }
    }

    /// Resolver over a repo, reading checkouts with [`JsonWorkingDir`]
    pub fn for_repo(repo: &Repo) -> Self {
        Self::new(
            Arc::clone(repo.cache()),
            Arc::clone(repo.store()),
            &repo.profile().username,
        )
        .with_working_dir(Arc::new(JsonWorkingDir))
    }

    pub fn with_working_dir(mut self, working_dir: Arc<dyn WorkingDir>) -> Self {
        self.working_dir = Some(working_dir);
        self
    }

    /// Parse `refstr` and look it up in the cache without loading any
    /// blocks. The returned reference gains the profile id; its path is
    /// left as parsed.
    pub fn resolve(&self, refstr: &str) -> Result<(Ref, VersionInfo)> {
        let mut reference = Ref::parse(refstr)?;
        if is_bad_case(&reference.name) {
            warn!(
                "dataset name {:?} has upper-case characters; names should be lower-case",
                reference.name
            );
        }
        // without a configured username "me" is looked up as written
        if reference.username == ME && !self.default_username.is_empty() {
            reference.username = self.default_username.clone();
        }

        let info = self
            .cache
            .resolve_by_name(&reference.username, &reference.name)?;
        reference.profile_id = info.profile_id.clone();
        Ok((reference, info))
    }

    /// Parse, resolve and load `refstr`.
    ///
    /// Without an explicit `@path` the current head is used, and a linked
    /// working directory takes precedence over the store.
    pub fn load_ref(&self, refstr: &str) -> Result<Resolved> {
        let (mut reference, info) = self.resolve(refstr)?;

        let default_path = reference.path.is_none();
        if default_path {
            reference.path = info.path;
        }

        let mut dataset = match (&info.fsi_path, &self.working_dir) {
            (Some(fsi_path), Some(working_dir)) if default_path => {
                debug!("Loading {} from working directory {}", reference, fsi_path);
                let mut ds = working_dir.read_dir(Path::new(fsi_path))?;
                ds.path = reference.path;
                ds
            }
            _ => {
                let path = reference.path.ok_or_else(|| {
                    Error::NotFound(format!("no versions of {}", reference.alias()))
                })?;
                chain::load_dataset(self.store.as_ref(), &path)?
            }
        };
        dataset.name = reference.name.clone();
        dataset.peername = reference.username.clone();

        Ok(Resolved {
            dataset,
            init_id: info.init_id.clone(),
            reference,
            info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Meta, Structure};

    #[test]
    fn test_working_dir_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = Dataset {
            meta: Some(Meta {
                title: "draft".to_string(),
                ..Default::default()
            }),
            structure: Some(Structure::infer("csv", b"a,b\n1,2\n")),
            body: Some(b"a,b\n1,2\n".to_vec()),
            ..Default::default()
        };
        JsonWorkingDir.write_dir(tmp.path(), &ds).unwrap();
        assert!(tmp.path().join("body.csv").is_file());

        let read = JsonWorkingDir.read_dir(tmp.path()).unwrap();
        assert_eq!(read, ds);
    }

    #[test]
    fn test_missing_working_dir_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = JsonWorkingDir.read_dir(&tmp.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }
}
