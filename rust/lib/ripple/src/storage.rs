use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::error::RippleError;
use crate::value::{PartialState, SubscriberId};

/// Durable per-subscriber storage for declared stored keys.
///
/// Entries are keyed `"<prefix>_<subscriber id>"` (see `storage_key`) and
/// hold the subscriber's stored-key subset as a JSON object.
pub trait LocalStorage: Send + Sync {
    /// Replace the entry for `key`.
    fn persist(&self, key: &str, value: &PartialState) -> Result<(), RippleError>;

    /// Read the entry for `key`. Returns None if nothing was persisted.
    fn load(&self, key: &str) -> Result<Option<PartialState>, RippleError>;
}

pub fn storage_key(prefix: &str, id: &SubscriberId) -> String {
    format!("{prefix}_{id}")
}

// ============================================================================
// MemoryStorage
// ============================================================================

/// In-process storage. Values are kept serialized, like a browser's
/// local storage.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStorage for MemoryStorage {
    fn persist(&self, key: &str, value: &PartialState) -> Result<(), RippleError> {
        let raw = serde_json::to_string(value)?;
        self.entries.write().unwrap().insert(key.to_string(), raw);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<PartialState>, RippleError> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// JsonFileStorage
// ============================================================================

/// One `<key>.json` file per entry under a directory.
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    /// Open storage rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RippleError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| RippleError::Storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl LocalStorage for JsonFileStorage {
    fn persist(&self, key: &str, value: &PartialState) -> Result<(), RippleError> {
        let path = self.path_for(key);
        let raw = serde_json::to_vec(value)?;
        fs::write(&path, raw).map_err(|e| RippleError::Storage(e.to_string()))?;
        debug!("JsonFileStorage: wrote {:?}", path);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<PartialState>, RippleError> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|e| RippleError::Storage(e.to_string()))?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }
}
