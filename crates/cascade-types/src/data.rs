use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::DataError;

/// Keyed bag of opaque values handlers use to exchange data.
///
/// Values are stored as `Arc<dyn Any>` so retrieval is a cheap clone of the
/// handle, not of the value. Writes during handler execution are allowed;
/// readers never observe a torn entry.
#[derive(Default)]
pub struct DataBag {
    entries: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.into(), Arc::new(value));
    }

    /// Typed retrieval. Errors when the key is absent or holds a value of a
    /// different type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, DataError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let value = entries.get(key).ok_or_else(|| DataError::Missing {
            key: key.to_string(),
        })?;
        Arc::clone(value)
            .downcast::<T>()
            .map_err(|_| DataError::TypeMismatch {
                key: key.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Typed retrieval that reports absence and type mismatch alike as `None`.
    pub fn try_get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let value = entries.get(key)?;
        Arc::clone(value).downcast::<T>().ok()
    }

    /// Remove the value under `key`. Returns whether a value was present.
    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(key)
    }

    /// Snapshot of the stored keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DataBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys = self.keys();
        keys.sort();
        f.debug_struct("DataBag").field("keys", &keys).finish()
    }
}
