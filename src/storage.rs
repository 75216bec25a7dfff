//! Storage capability boundary: the resolved save location for session and
//! flux CSV files.
//!
//! Implementations are constructed once per process and injected into the
//! session engine, so every test can substitute a deterministic fake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;

use crate::errors::Result;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a whole file, or `None` if it does not exist.
    async fn read_to_string(&self, name: &str) -> Result<Option<String>>;
    /// Create or replace a file and return the path it was written to.
    async fn write_string(&self, name: &str, contents: &str) -> Result<PathBuf>;
    /// Whether a file with this name already exists.
    async fn exists(&self, name: &str) -> Result<bool>;
}

/// Filesystem-backed storage rooted at one folder, created on demand.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn read_to_string(&self, name: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_of(name)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_string(&self, name: &str, contents: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_of(name);
        tokio::fs::write(&path, contents).await?;
        debug!("wrote {} bytes to {}", contents.len(), path.display());
        Ok(path)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_of(name)).await?)
    }
}

/// In-memory storage fake for tests and dry runs.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored file, if any.
    pub fn get(&self, name: &str) -> Option<String> {
        self.files.lock().unwrap().get(name).cloned()
    }

    /// Sorted names of all stored files.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_to_string(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name))
    }

    async fn write_string(&self, name: &str, contents: &str) -> Result<PathBuf> {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), contents.to_string());
        Ok(PathBuf::from(name))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(name))
    }
}
