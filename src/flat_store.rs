//! Legacy flat key-value store
//!
//! The store that predates the relational backend. It keeps whole JSON
//! documents under a handful of string keys and stays around as the fallback
//! when the relational store is unavailable and as the standing backup that
//! every relational write is mirrored into.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::FlatStoreError;
use crate::util::write_atomic;

pub const PROMPTS_KEY: &str = "prompts";
pub const CATEGORIES_KEY: &str = "categories";
pub const SETTINGS_KEY: &str = "settings";
pub const CLOUD_SYNC_KEY: &str = "cloud_sync_settings";

pub type FlatResult<T> = std::result::Result<T, FlatStoreError>;

pub trait FlatStore: Send + Sync {
    fn get(&self, key: &str) -> FlatResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> FlatResult<()>;

    fn remove(&self, key: &str) -> FlatResult<bool>;

    /// Every key/value pair, used for pre-migration backups
    fn entries(&self) -> FlatResult<BTreeMap<String, String>>;
}

/// Read a JSON document stored under `key`
pub fn get_json<T: DeserializeOwned>(store: &dyn FlatStore, key: &str) -> FlatResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize + ?Sized>(store: &dyn FlatStore, key: &str, value: &T) -> FlatResult<()> {
    store.set(key, &serde_json::to_string(value)?)
}

/// Flat store persisted as one JSON object in a file
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> FlatResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> FlatResult<()> {
        let content = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &content)?;
        Ok(())
    }
}

impl FlatStore for JsonFileStore {
    fn get(&self, key: &str) -> FlatResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> FlatResult<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> FlatResult<bool> {
        let mut entries = self.entries.lock();
        let removed = entries.remove(key).is_some();
        if removed {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    fn entries(&self) -> FlatResult<BTreeMap<String, String>> {
        Ok(self.entries.lock().clone())
    }
}

/// In-memory flat store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryFlatStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryFlatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlatStore for MemoryFlatStore {
    fn get(&self, key: &str) -> FlatResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> FlatResult<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> FlatResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn entries(&self) -> FlatResult<BTreeMap<String, String>> {
        Ok(self.entries.lock().clone())
    }
}
