//! Persistent store: a shared handle over any [`Storage`] backend

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use devlink_mcu::Storage;
use log::*;

use crate::error::StorageError;

/// Object-safe view of a [`Storage`] backend
trait DynStorage: Send {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError>;
    fn set_if_changed(&mut self, namespace: &str, key: &str, value: &str) -> Result<bool, StorageError>;
    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), StorageError>;
    fn clear_namespace(&mut self, namespace: &str) -> Result<(), StorageError>;
}

fn backend<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl<S: Storage + Send> DynStorage for S {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        Storage::get(self, namespace, key).map_err(backend)
    }

    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        Storage::set(self, namespace, key, value).map_err(backend)
    }

    fn set_if_changed(&mut self, namespace: &str, key: &str, value: &str) -> Result<bool, StorageError> {
        Storage::set_if_changed(self, namespace, key, value).map_err(backend)
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        Storage::remove(self, namespace, key).map_err(backend)
    }

    fn clear_namespace(&mut self, namespace: &str) -> Result<(), StorageError> {
        Storage::clear_namespace(self, namespace).map_err(backend)
    }
}

/// Cloneable handle to the device's persistent namespaces
#[derive(Clone)]
pub struct Preferences {
    inner: Arc<Mutex<Box<dyn DynStorage>>>,
}

impl Preferences {
    pub fn new<S: Storage + Send + 'static>(storage: S) -> Self {
        Self { inner: Arc::new(Mutex::new(Box::new(storage))) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn DynStorage) -> Result<R, StorageError>) -> Result<R, StorageError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_string()))?;
        f(guard.as_mut())
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        self.with(|s| s.get(namespace, key))
    }

    /// Stored value, or an empty string when the key is absent
    pub fn get_string(&self, namespace: &str, key: &str) -> Result<String, StorageError> {
        Ok(self.get(namespace, key)?.unwrap_or_default())
    }

    pub fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.with(|s| s.set(namespace, key, value))
    }

    /// Write only when the stored value differs
    pub fn set_if_changed(&self, namespace: &str, key: &str, value: &str) -> Result<bool, StorageError> {
        let written = self.with(|s| s.set_if_changed(namespace, key, value))?;
        if written {
            debug!("Stored {}/{}", namespace, key);
        }
        Ok(written)
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.with(|s| s.remove(namespace, key))
    }

    pub fn clear_namespace(&self, namespace: &str) -> Result<(), StorageError> {
        self.with(|s| s.clear_namespace(namespace))
    }

    /// Factory reset: erase every namespace in `namespaces`
    pub fn clear_all(&self, namespaces: &[&str]) -> Result<(), StorageError> {
        for ns in namespaces {
            self.clear_namespace(ns)?;
            info!("Cleared namespace {}", ns);
        }
        Ok(())
    }
}

/// In-memory storage; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<(String, String), String>,
    writes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set` calls that reached the backend
    pub fn writes(&self) -> usize {
        self.inner.lock().map(|g| g.writes).unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    type Error = Infallible;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self
            .inner
            .lock()
            .ok()
            .and_then(|g| g.values.get(&(namespace.to_string(), key.to_string())).cloned()))
    }

    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), Self::Error> {
        if let Ok(mut g) = self.inner.lock() {
            g.values.insert((namespace.to_string(), key.to_string()), value.to_string());
            g.writes += 1;
        }
        Ok(())
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), Self::Error> {
        if let Ok(mut g) = self.inner.lock() {
            g.values.remove(&(namespace.to_string(), key.to_string()));
        }
        Ok(())
    }

    fn clear_namespace(&mut self, namespace: &str) -> Result<(), Self::Error> {
        if let Ok(mut g) = self.inner.lock() {
            g.values.retain(|(ns, _), _| ns != namespace);
        }
        Ok(())
    }
}

/// One JSON file per namespace under a directory
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn open(dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", namespace))
    }

    fn load(&self, namespace: &str) -> Result<BTreeMap<String, String>, StorageError> {
        let path = self.path(namespace);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, namespace: &str, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let data = serde_json::to_string_pretty(values)?;
        fs::write(self.path(namespace), data)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    type Error = StorageError;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.load(namespace)?.remove(key))
    }

    fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), Self::Error> {
        let mut values = self.load(namespace)?;
        values.insert(key.to_string(), value.to_string());
        self.save(namespace, &values)
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Result<(), Self::Error> {
        let mut values = self.load(namespace)?;
        if values.remove(key).is_some() {
            self.save(namespace, &values)?;
        }
        Ok(())
    }

    fn clear_namespace(&mut self, namespace: &str) -> Result<(), Self::Error> {
        let path = self.path(namespace);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
