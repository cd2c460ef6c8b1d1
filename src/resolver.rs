//! Artifact resolution: maps a model repository identifier to a file on disk
//!
//! The default resolver reads the Hugging Face hub cache layout:
//!
//! ```text
//! <cache>/models--<org>--<name>/refs/main          -> revision hash
//! <cache>/models--<org>--<name>/snapshots/<hash>/  -> candidate files
//! ```

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors returned while resolving an artifact
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The repository (or the requested file inside it) is not cached locally
    #[error("{0}")]
    NotFound(String),
    /// Several candidate files exist and no filename was configured
    #[error("Multiple model files found under `{0}`; set `model_file`")]
    Ambiguous(String),
}

/// Resolves a backend's resource identifier to an absolute file path
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, repo: &str, filename: Option<&str>) -> Result<PathBuf, ResolveError>;
}

/// Resolver backed by the local Hugging Face hub cache
#[derive(Debug, Clone)]
pub struct HfCacheResolver {
    root: PathBuf,
}

impl HfCacheResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locate the cache from the environment.
    ///
    /// Order: `HF_HUB_CACHE`, then `HF_HOME/hub`, then `~/.cache/huggingface/hub`.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("HF_HUB_CACHE") {
            return Self::new(dir);
        }
        if let Some(home) = std::env::var_os("HF_HOME") {
            return Self::new(PathBuf::from(home).join("hub"));
        }
        let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".cache").join("huggingface").join("hub"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(format!("models--{}", repo.replace('/', "--")))
    }
}

impl ArtifactResolver for HfCacheResolver {
    fn resolve(&self, repo: &str, filename: Option<&str>) -> Result<PathBuf, ResolveError> {
        let repo_dir = self.repo_dir(repo);
        let ref_path = repo_dir.join("refs").join("main");

        let revision = std::fs::read_to_string(&ref_path)
            .map_err(|_| ResolveError::NotFound(format!("Model `{}` not found in cache", repo)))?;
        let revision = revision.trim();

        let unresolved = || {
            ResolveError::NotFound(format!(
                "Cannot resolve model `{}` under `{}`",
                filename.unwrap_or("<any>"),
                repo
            ))
        };

        if revision.is_empty() {
            return Err(unresolved());
        }

        let snapshot = repo_dir.join("snapshots").join(revision);
        debug!(repo, snapshot = %snapshot.display(), "Resolving artifact");

        let entries = std::fs::read_dir(&snapshot).map_err(|_| unresolved())?;
        let mut files: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        files.sort();

        let chosen = match filename {
            Some(name) if files.iter().any(|f| f == name) => name.to_string(),
            Some(_) => return Err(unresolved()),
            None => match files.as_slice() {
                [only] => only.clone(),
                [] => return Err(unresolved()),
                _ => return Err(ResolveError::Ambiguous(repo.to_string())),
            },
        };

        let path = snapshot.join(chosen);
        Ok(std::path::absolute(&path).unwrap_or(path))
    }
}
