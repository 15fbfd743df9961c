// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concurrent in-memory state repository.

use super::{ComputeFn, StateRepository};
use crate::metrics;
use crate::BoxFuture;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// [`StateRepository`] over a sharded concurrent map.
///
/// `compute` runs while holding the map shard's write lock for the key, so
/// updates to one key are serialized without a global lock.
pub struct InMemoryStateRepository<V> {
    name: String,
    entries: DashMap<String, V>,
}

impl<V: Clone> InMemoryStateRepository<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    fn compute_sync(&self, key: &str, f: ComputeFn<V>) -> Option<V> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().clone();
                match f(key, Some(current)) {
                    Some(value) => {
                        occupied.insert(value.clone());
                        Some(value)
                    }
                    None => {
                        occupied.remove();
                        None
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let value = f(key, None)?;
                vacant.insert(value.clone());
                Some(value)
            }
        }
    }
}

impl<V> StateRepository<V> for InMemoryStateRepository<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<V>> {
        let value = self.entries.get(key).map(|v| v.clone());
        Box::pin(async move { Ok(value) })
    }

    fn put<'a>(&'a self, key: &'a str, value: V) -> BoxFuture<'a, ()> {
        self.entries.insert(key.to_string(), value);
        metrics::record_state_write(&self.name, "put");
        Box::pin(async move { Ok(()) })
    }

    fn compute<'a>(&'a self, key: &'a str, f: ComputeFn<V>) -> BoxFuture<'a, Option<V>> {
        let result = self.compute_sync(key, f);
        metrics::record_state_write(&self.name, "compute");
        Box::pin(async move { Ok(result) })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<V>> {
        let previous = self.entries.remove(key).map(|(_, v)| v);
        metrics::record_state_write(&self.name, "remove");
        Box::pin(async move { Ok(previous) })
    }

    fn clear(&self) -> BoxFuture<'_, ()> {
        self.entries.clear();
        Box::pin(async move { Ok(()) })
    }

    fn size(&self) -> BoxFuture<'_, usize> {
        let size = self.entries.len();
        Box::pin(async move { Ok(size) })
    }

    fn keys(&self) -> BoxFuture<'_, Vec<String>> {
        let keys = self.entries.iter().map(|e| e.key().clone()).collect();
        Box::pin(async move { Ok(keys) })
    }

    fn entries(&self) -> BoxFuture<'_, Vec<(String, V)>> {
        let entries = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        Box::pin(async move { Ok(entries) })
    }
}
