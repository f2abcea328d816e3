//! Map of independently locked per-key state.
//!
//! The outer map is only locked long enough to find or insert an entry; all
//! mutation happens under the entry's own mutex, so unrelated keys never
//! contend with each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;

pub struct KeyedState<K, V> {
    entries: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for KeyedState<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> KeyedState<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn get_or_insert_with<F>(&self, key: &K, init: F) -> Arc<Mutex<V>>
    where
        F: FnOnce() -> V,
    {
        if let Some(entry) = self.get(key).await {
            return entry;
        }
        self.entries
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(init())))
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let entries = self.entries.read().await;
        entries
            .iter()
            .map(|(key, value)| (key.clone(), lock(value).clone()))
            .collect()
    }
}

/// Locks an entry, recovering the value if a previous holder panicked.
pub fn lock<V>(entry: &Mutex<V>) -> MutexGuard<'_, V> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}
