// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local object cache and key functions.
//!
//! The cache holds the last observed copy of every object, keyed by
//! `namespace/name`. It is written only by the informer and read by
//! reconcilers through [`KeyedStore`].

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Errors returned by cache lookups and key derivation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key is not `name` or `namespace/name`.
    #[error("unexpected key format: {0:?}")]
    InvalidKey(String),

    /// The object has no name to derive a key from.
    #[error("object has no name")]
    MissingName,

    /// The backing cache could not be read.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Objects that can be identified by namespace and name.
pub trait ObjectKey {
    /// Namespace of the object, `None` for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;

    /// Name of the object.
    fn name(&self) -> Option<&str>;

    /// Returns the `namespace/name` key of this object.
    fn key(&self) -> Result<String> {
        meta_namespace_key(self)
    }
}

/// Builds the `namespace/name` key for an object.
///
/// Cluster-scoped objects (no namespace, or an empty one) are keyed by name
/// alone.
pub fn meta_namespace_key<T: ObjectKey + ?Sized>(obj: &T) -> Result<String> {
    let name = match obj.name() {
        Some(name) if !name.is_empty() => name,
        _ => return Err(StoreError::MissingName),
    };

    match obj.namespace() {
        Some(ns) if !ns.is_empty() => Ok(format!("{ns}/{name}")),
        _ => Ok(name.to_string()),
    }
}

/// Splits a key into its namespace and name.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str)> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
        (Some(ns), Some(name), None) if !name.is_empty() => {
            Ok(((!ns.is_empty()).then_some(ns), name))
        }
        _ => Err(StoreError::InvalidKey(key.to_string())),
    }
}

/// A delete notification.
///
/// When a relist finds that an object vanished while the watch was down,
/// the final state of the object is unknown; the informer then delivers the
/// last cached copy together with its key.
#[derive(Debug, Clone)]
pub enum DeletedObject<T> {
    /// The object as observed in the delete event.
    Known(Arc<T>),

    /// The object disappeared during a relist.
    FinalStateUnknown {
        /// Key the object was cached under.
        key: String,
        /// Last cached copy.
        obj: Arc<T>,
    },
}

impl<T> DeletedObject<T> {
    /// Returns the last known copy of the object.
    pub fn object(&self) -> &Arc<T> {
        match self {
            DeletedObject::Known(obj) => obj,
            DeletedObject::FinalStateUnknown { obj, .. } => obj,
        }
    }
}

/// Derives the key for a delete notification.
///
/// Tombstones already carry the key they were cached under, which is used
/// as-is.
pub fn deletion_handling_key<T: ObjectKey>(deleted: &DeletedObject<T>) -> Result<String> {
    match deleted {
        DeletedObject::Known(obj) => obj.key(),
        DeletedObject::FinalStateUnknown { key, .. } => Ok(key.clone()),
    }
}

/// Read access to cached objects.
pub trait KeyedStore<T>: Send + Sync {
    /// Looks up an object by key. `Ok(None)` means the object does not exist.
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<T>>>;

    /// Returns every cached object.
    fn list(&self) -> Vec<Arc<T>>;

    /// Returns every cached key.
    fn list_keys(&self) -> Vec<String>;
}

/// Thread-safe in-memory cache.
#[derive(Debug)]
pub struct MemoryStore<T> {
    items: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: ObjectKey> MemoryStore<T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object, returning the previous copy.
    pub fn upsert(&self, obj: Arc<T>) -> Result<Option<Arc<T>>> {
        let key = obj.key()?;
        Ok(self.write().insert(key, obj))
    }

    /// Removes an object by key, returning the removed copy.
    pub fn remove(&self, key: &str) -> Result<Option<Arc<T>>> {
        Ok(self.write().remove(key))
    }

    /// Replaces the whole content of the store.
    ///
    /// Returns the previous content so the caller can compute which objects
    /// were added, updated or removed.
    pub fn replace(&self, objs: Vec<Arc<T>>) -> Result<HashMap<String, Arc<T>>> {
        let mut next = HashMap::with_capacity(objs.len());
        for obj in objs {
            next.insert(obj.key()?, obj);
        }
        Ok(std::mem::replace(&mut *self.write(), next))
    }

    /// Returns the number of cached objects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Writes are single map operations, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<T>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<T>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ObjectKey + Send + Sync> KeyedStore<T> for MemoryStore<T> {
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<T>>> {
        split_meta_namespace_key(key)?;
        Ok(self.read().get(key).cloned())
    }

    fn list(&self) -> Vec<Arc<T>> {
        self.read().values().cloned().collect()
    }

    fn list_keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj {
        ns: Option<String>,
        name: Option<String>,
        value: u32,
    }

    impl Obj {
        fn new(ns: &str, name: &str, value: u32) -> Self {
            Self {
                ns: Some(ns.to_string()),
                name: Some(name.to_string()),
                value,
            }
        }
    }

    impl ObjectKey for Obj {
        fn namespace(&self) -> Option<&str> {
            self.ns.as_deref()
        }

        fn name(&self) -> Option<&str> {
            self.name.as_deref()
        }
    }

    #[test]
    fn test_meta_namespace_key() {
        assert_eq!(Obj::new("ns", "a", 0).key().unwrap(), "ns/a");

        let cluster_scoped = Obj {
            ns: None,
            name: Some("node-1".to_string()),
            value: 0,
        };
        assert_eq!(cluster_scoped.key().unwrap(), "node-1");

        let nameless = Obj {
            ns: Some("ns".to_string()),
            name: None,
            value: 0,
        };
        assert_eq!(nameless.key(), Err(StoreError::MissingName));
    }

    #[test]
    fn test_split_meta_namespace_key() {
        assert_eq!(split_meta_namespace_key("ns/a").unwrap(), (Some("ns"), "a"));
        assert_eq!(split_meta_namespace_key("a").unwrap(), (None, "a"));
        assert_eq!(split_meta_namespace_key("/a").unwrap(), (None, "a"));
        assert!(split_meta_namespace_key("a/b/c").is_err());
        assert!(split_meta_namespace_key("ns/").is_err());
        assert!(split_meta_namespace_key("").is_err());
    }

    #[test]
    fn test_deletion_handling_key() {
        let obj = Arc::new(Obj::new("ns", "a", 0));
        assert_eq!(
            deletion_handling_key(&DeletedObject::Known(obj.clone())).unwrap(),
            "ns/a"
        );

        let tombstone = DeletedObject::FinalStateUnknown {
            key: "ns/old".to_string(),
            obj,
        };
        assert_eq!(deletion_handling_key(&tombstone).unwrap(), "ns/old");
    }

    #[test]
    fn test_memory_store_operations() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        assert!(store.upsert(Arc::new(Obj::new("ns", "a", 1))).unwrap().is_none());
        let previous = store.upsert(Arc::new(Obj::new("ns", "a", 2))).unwrap();
        assert_eq!(previous.unwrap().value, 1);
        assert_eq!(store.get_by_key("ns/a").unwrap().unwrap().value, 2);
        assert!(store.get_by_key("ns/missing").unwrap().is_none());
        assert!(store.get_by_key("a/b/c").is_err());

        let old = store
            .replace(vec![Arc::new(Obj::new("ns", "b", 3))])
            .unwrap();
        assert!(old.contains_key("ns/a"));
        assert_eq!(store.list_keys(), vec!["ns/b".to_string()]);

        assert_eq!(store.remove("ns/b").unwrap().unwrap().value, 3);
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_recovers_poisoned_lock() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(Arc::new(Obj::new("ns", "a", 1))).unwrap();

        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.items.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(store.items.is_poisoned());

        assert_eq!(store.len(), 1);
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.list_keys(), vec!["ns/a".to_string()]);
        assert_eq!(store.get_by_key("ns/a").unwrap().unwrap().value, 1);

        store.upsert(Arc::new(Obj::new("ns", "b", 2))).unwrap();
        assert_eq!(store.len(), 2);
    }
}
