//! Process-local (L1) maps whose entries expire on their own.

use dashmap::DashMap;
use std::{
    borrow::Borrow,
    hash::Hash,
    time::{Duration, Instant},
};

/// Upper bound on a single entry's lifetime.
const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub(crate) struct LocalMap<K, V> {
    entries: DashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V: Clone> LocalMap<K, V> {
    pub(crate) fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Live value for `key`. An expired entry is removed and reported as a miss.
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub(crate) fn insert(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl.min(MAX_TTL);
        self.entries.insert(key, Entry { value, expires_at });
    }

    pub(crate) fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key);
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    /// Entries held, expired or not.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry and returns how many went.
    pub(crate) fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}
