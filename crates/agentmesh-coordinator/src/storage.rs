//! Key/value persistence for coordinator state.
//!
//! Each component saves whole JSON documents under a fixed key after every
//! mutation. The backing store is injected so tests can use
//! [`MemoryStorage`] and a local run uses [`FileStorage`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;

// ─── Keys ────────────────────────────────────────────────────────────

pub const CONNECTIONS_KEY: &str = "connections";
pub const PENDING_PROPOSALS_KEY: &str = "pending_proposals";
pub const SETTLED_PROPOSALS_KEY: &str = "settled_proposals";
pub const EXECUTED_PROPOSALS_KEY: &str = "executed_proposals";
pub const WATERMARKS_KEY: &str = "watermarks";

// ─── Trait ───────────────────────────────────────────────────────────

pub trait Storage: Send + Sync {
    /// Bytes stored under `key`, or `None` if nothing was saved yet.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace whatever is stored under `key`.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Decode the JSON document under `key`, or `T::default()` if absent.
pub fn load_json<T>(storage: &dyn Storage, key: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned + Default,
{
    match storage.load(key)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(T::default()),
    }
}

pub fn save_json<T>(storage: &dyn Storage, key: &str, value: &T) -> Result<(), StorageError>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value)?;
    storage.save(key, &bytes)
}

// ─── File ────────────────────────────────────────────────────────────

/// One `<key>.json` file per key under a state directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (creating if needed) a state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes to a sibling temp file and renames it over the target, so a
    /// crash mid-write leaves the previous document intact.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ─── Memory ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStorage {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
