//! Object stores: where sources, chunk outputs and final results live.
//!
//! The durable backing technology is an external collaborator; this module
//! defines the [`ObjectStore`] seam plus two implementations that are useful
//! on their own:
//!
//! * [`MemoryObjectStore`]: process-local, used as the scratch store that
//!   processors write into and as the low-durability fallback store.
//! * [`LocalDirStore`]: one file per object under a directory, written
//!   atomically (temp file + rename) so a crash never leaves a partial object.

use crate::error::JobError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Reference to an object in some store, e.g. `mem://durable/3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(String);

impl ObjectRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A place bytes can be put and fetched back from.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Persist `bytes`, returning a new reference to them.
    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectRef, JobError>;

    /// Fetch the bytes behind `reference`.
    async fn get(&self, reference: &ObjectRef) -> Result<Vec<u8>, JobError>;
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Process-local store backed by a concurrent map.
pub struct MemoryObjectStore {
    name: String,
    objects: DashMap<String, Arc<Vec<u8>>>,
    next_id: AtomicU64,
    puts: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            next_id: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Store `bytes` synchronously; handy for seeding sources in tests.
    pub fn insert(&self, bytes: impl Into<Vec<u8>>) -> ObjectRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reference = format!("mem://{}/{}", self.name, id);
        self.objects.insert(reference.clone(), Arc::new(bytes.into()));
        ObjectRef(reference)
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of successful `put` calls since creation.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectRef, JobError> {
        let reference = self.insert(bytes);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(reference)
    }

    async fn get(&self, reference: &ObjectRef) -> Result<Vec<u8>, JobError> {
        self.objects
            .get(reference.as_str())
            .map(|entry| entry.value().as_ref().clone())
            .ok_or_else(|| JobError::Store {
                store: self.name.clone(),
                detail: format!("no object '{}'", reference),
            })
    }
}

// ── Local directory store ────────────────────────────────────────────────

/// One file per object under `root`, refs look like `file://<uuid>`.
pub struct LocalDirStore {
    name: String,
    root: PathBuf,
}

impl LocalDirStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self, JobError> {
        let name = name.into();
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| JobError::Store {
                store: name.clone(),
                detail: format!("create '{}': {}", root.display(), e),
            })?;
        Ok(Self { name, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &ObjectRef) -> Result<PathBuf, JobError> {
        let file = reference
            .as_str()
            .strip_prefix("file://")
            .filter(|f| !f.is_empty() && !f.contains(['/', '\\']) && *f != "..")
            .ok_or_else(|| JobError::Store {
                store: self.name.clone(),
                detail: format!("'{}' is not a reference into this store", reference),
            })?;
        Ok(self.root.join(file))
    }

    fn store_error(&self, action: &str, e: impl fmt::Display) -> JobError {
        JobError::Store {
            store: self.name.clone(),
            detail: format!("{action}: {e}"),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalDirStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<ObjectRef, JobError> {
        let file_name = Uuid::new_v4().to_string();
        let root = self.root.clone();
        let target = root.join(&file_name);

        // Atomic write: temp file in the same directory, then rename.
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| self.store_error("write task", e))?
        .map_err(|e| self.store_error("write", e))?;

        debug!("{}: stored object {}", self.name, file_name);
        Ok(ObjectRef(format!("file://{file_name}")))
    }

    async fn get(&self, reference: &ObjectRef) -> Result<Vec<u8>, JobError> {
        let path = self.path_for(reference)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| self.store_error(&format!("read '{}'", path.display()), e))
    }
}
