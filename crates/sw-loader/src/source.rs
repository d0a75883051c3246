//! Script sources
//!
//! The loader never touches the filesystem directly; it reads through a
//! [`ScriptSource`] so hosts and tests can substitute an in-memory store.

use crate::error::{LoaderError, LoaderResult};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// SHA-256 of script content, hex encoded
pub fn fingerprint_of(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Backing store for script documents
pub trait ScriptSource: Send + Sync {
    /// Read the raw content of a script
    fn load(&self, reference: &str) -> LoaderResult<String>;

    /// Persist new content for a script
    fn store(&self, reference: &str, content: &str) -> LoaderResult<()>;

    /// Check whether a script exists
    fn exists(&self, reference: &str) -> bool;

    /// Content fingerprint, changes whenever the script is edited
    fn fingerprint(&self, reference: &str) -> LoaderResult<String> {
        Ok(fingerprint_of(&self.load(reference)?))
    }
}

/// Scripts stored as YAML files under a root directory
///
/// A reference `login` resolves to `login`, `login.yaml` or `login.yml`
/// (first match wins). Absolute references are used as-is.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    /// Create a source rooted at a directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn base(&self, reference: &str) -> PathBuf {
        let path = Path::new(reference);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Locate the file backing a reference
    pub fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let base = self.base(reference);
        if base.is_file() {
            return Some(base);
        }
        EXTENSIONS
            .iter()
            .map(|ext| with_extension(&base, ext))
            .find(|candidate| candidate.is_file())
    }
}

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

impl ScriptSource for FileSource {
    fn load(&self, reference: &str) -> LoaderResult<String> {
        let path = self.resolve(reference).ok_or_else(|| LoaderError::NotFound {
            reference: reference.to_string(),
        })?;
        trace!("Reading script file: {:?}", path);
        fs::read_to_string(&path).map_err(|e| LoaderError::Read { path, source: e })
    }

    fn store(&self, reference: &str, content: &str) -> LoaderResult<()> {
        let path = self
            .resolve(reference)
            .unwrap_or_else(|| with_extension(&self.base(reference), EXTENSIONS[0]));
        debug!("Writing script file: {:?}", path);
        fs::write(&path, content).map_err(|e| LoaderError::Store {
            reference: reference.to_string(),
            message: e.to_string(),
        })
    }

    fn exists(&self, reference: &str) -> bool {
        self.resolve(reference).is_some()
    }
}

/// Scripts held in memory
///
/// Used by embedding hosts and tests; edits are visible to the next read,
/// exactly like edits to a file.
#[derive(Debug, Default)]
pub struct MemorySource {
    scripts: DashMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a script
    pub fn insert(&self, reference: impl Into<String>, content: impl Into<String>) {
        self.scripts.insert(reference.into(), content.into());
    }

    /// Remove a script, returning its content
    pub fn remove(&self, reference: &str) -> Option<String> {
        self.scripts.remove(reference).map(|(_, content)| content)
    }

    /// Current content of a script
    pub fn get(&self, reference: &str) -> Option<String> {
        self.key(reference)
            .and_then(|key| self.scripts.get(&key).map(|c| c.value().clone()))
    }

    fn key(&self, reference: &str) -> Option<String> {
        if self.scripts.contains_key(reference) {
            return Some(reference.to_string());
        }
        let stem = EXTENSIONS
            .iter()
            .find_map(|ext| reference.strip_suffix(&format!(".{}", ext)))?;
        self.scripts.contains_key(stem).then(|| stem.to_string())
    }
}

impl ScriptSource for MemorySource {
    fn load(&self, reference: &str) -> LoaderResult<String> {
        self.get(reference).ok_or_else(|| LoaderError::NotFound {
            reference: reference.to_string(),
        })
    }

    fn store(&self, reference: &str, content: &str) -> LoaderResult<()> {
        let key = self.key(reference).unwrap_or_else(|| reference.to_string());
        self.scripts.insert(key, content.to_string());
        Ok(())
    }

    fn exists(&self, reference: &str) -> bool {
        self.key(reference).is_some()
    }
}
