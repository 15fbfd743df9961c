// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key materialized state.
//!
//! A [`StateRepository`] holds the latest value per key, built by consuming
//! one or more channels. Two implementations honor the same contract:
//!
//! | Implementation | Backing | Use |
//! |----------------|---------|-----|
//! | [`InMemoryStateRepository`] | `DashMap` | Default, compaction staging |
//! | [`SqliteStateRepository`] | SQLite (WAL) | Cardinalities that do not fit in memory |
//!
//! # Atomicity
//!
//! [`StateRepository::compute`] is linearizable per key: concurrent calls on
//! the same key never lose an update, while calls on independent keys do
//! not block each other. Whole-repository operations (`size`, `keys`,
//! `entries`, `clear`) observe a weakly consistent view.
//!
//! ```text
//! channel A: {"name": "Shoe"}  ─┐
//!                               ├─ compute("p-17") ─▶ {"name": "Shoe", "price": 42}
//! channel B: {"price": 42}     ─┘
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStateRepository;
pub use sqlite::SqliteStateRepository;

use crate::BoxFuture;

/// Read-modify-write function passed to [`StateRepository::compute`].
///
/// Receives the key and its current value; returning `None` removes the key.
pub type ComputeFn<V> = Box<dyn FnOnce(&str, Option<V>) -> Option<V> + Send>;

/// Box a closure as a [`ComputeFn`].
///
/// ```rust
/// use channel_engine::state::{compute_fn, ComputeFn};
///
/// let increment: ComputeFn<u64> = compute_fn(|_, current| Some(current.unwrap_or(0) + 1));
/// ```
pub fn compute_fn<V, F>(f: F) -> ComputeFn<V>
where
    F: FnOnce(&str, Option<V>) -> Option<V> + Send + 'static,
{
    Box::new(f)
}

/// Queryable per-key store with atomic per-key merge.
pub trait StateRepository<V>: Send + Sync + 'static
where
    V: Clone + Send + Sync + 'static,
{
    /// Name used in logs, metrics and errors.
    fn name(&self) -> &str;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<V>>;

    /// Unconditional overwrite.
    fn put<'a>(&'a self, key: &'a str, value: V) -> BoxFuture<'a, ()>;

    /// Atomically replace the value of `key` with `f(key, current)`.
    ///
    /// Returns the new value, `None` if the key was removed.
    fn compute<'a>(&'a self, key: &'a str, f: ComputeFn<V>) -> BoxFuture<'a, Option<V>>;

    /// Remove `key`, returning the previous value.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<V>>;

    fn clear(&self) -> BoxFuture<'_, ()>;

    fn size(&self) -> BoxFuture<'_, usize>;

    fn keys(&self) -> BoxFuture<'_, Vec<String>>;

    /// All entries, in no particular order.
    fn entries(&self) -> BoxFuture<'_, Vec<(String, V)>>;
}
