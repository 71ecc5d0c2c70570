use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info};

use super::{Result, StoreError};

/// Storage capability behind the store. Each call is independently durable;
/// nothing is transactional across calls.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    fn clear(&self) -> Result<()>;

    fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }
}

fn scan(entries: &BTreeMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(scan(&entries, prefix))
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        entries.clear();
        Ok(())
    }
}

/// JSON snapshot of the whole key space. Every mutation is written to
/// `{path}.tmp`, fsynced and renamed over the real file.
pub struct FileBackend {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let entries = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice::<BTreeMap<String, String>>(&bytes)?
        } else {
            BTreeMap::new()
        };

        info!(path = %path.display(), keys = entries.len(), "Opened file store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;
        sync_parent(&self.path)?;
        debug!(path = %self.path.display(), keys = entries.len(), "Persisted store snapshot");
        Ok(())
    }

    fn mutate(&self, change: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut next = entries.clone();
        change(&mut next);
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}

// The rename is only durable once the directory entry is flushed.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}

impl KvBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.mutate(|entries| {
            entries.remove(key);
        })
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(scan(&entries, prefix))
    }

    fn clear(&self) -> Result<()> {
        self.mutate(BTreeMap::clear)
    }

    fn delete_many(&self, keys: &[String]) -> Result<()> {
        self.mutate(|entries| {
            for key in keys {
                entries.remove(key);
            }
        })
    }
}
