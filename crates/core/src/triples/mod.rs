//! The attribute store.
//!
//! A triple is `(id, name, value)`. The store answers forward lookups
//! (`id, name -> values`) and reverse lookups (`name, value -> ids`, highest
//! id first). Two backends implement the same [`Triples`] contract:
//! [`RedbTriples`] on the embedded sorted key-value engine and, with the
//! `sqlite` feature, [`SqlTriples`] on a relational engine.

pub mod cursors;
mod redb_triples;
#[cfg(feature = "sqlite")]
mod sql_triples;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use parking_lot::Mutex;

use crate::Result;

pub use redb_triples::RedbTriples;
#[cfg(feature = "sqlite")]
pub use sql_triples::SqlTriples;

/// Lazy sequence of identifiers.
pub type Ids = Box<dyn Iterator<Item = Result<u64>>>;

/// Lazy sequence of values.
pub type Values = Box<dyn Iterator<Item = Result<String>>>;

/// Attribute store contract. Implementations are safe for concurrent use.
pub trait Triples: Send + Sync {
    /// Adds `value` under `(id, name)`. Adding an existing triple is a no-op.
    fn put(&self, id: u64, name: &str, value: &str) -> Result<()>;

    fn has(&self, id: u64, name: &str, value: &str) -> Result<bool>;

    /// First value under `(id, name)` in value order, or
    /// [`InfinityError::Missing`](crate::InfinityError::Missing).
    fn get(&self, id: u64, name: &str) -> Result<String>;

    /// Every value under `(id, name)`. Each call opens a fresh cursor.
    fn all(&self, id: u64, name: &str) -> Result<Values>;

    /// Every id holding `value` under `name`, strictly descending.
    fn reverse(&self, name: &str, value: &str) -> Result<Ids>;

    /// Ids under `name` whose value is an id that holds `value` under
    /// `join`, strictly descending.
    ///
    /// With messages pointing at their bout through `bout.number` and bouts
    /// listing participants under `participant`,
    /// `reverse_join("bout.number", "participant", urn)` yields the
    /// messages of every bout `urn` takes part in.
    fn reverse_join(&self, name: &str, join: &str, value: &str) -> Result<Ids> {
        let mut streams = Vec::new();
        for joiner in self.reverse(join, value)? {
            streams.push(self.reverse(name, &joiner?.to_string())?);
        }
        Ok(Box::new(MergeDescending::new(streams)))
    }

    /// Removes every value under `(id, name)`, forward and reverse.
    ///
    /// Fails with [`InfinityError::Fatal`](crate::InfinityError::Fatal) if
    /// there was nothing to remove.
    fn clear(&self, id: u64, name: &str) -> Result<()>;

    /// Attribute names this store has created storage for.
    fn names(&self) -> Vec<String>;

    /// Flushes and releases backend resources. Further calls may fail.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry of per-attribute storage
// ---------------------------------------------------------------------------

/// Names whose storage exists, with create-on-miss under one mutex.
#[derive(Default)]
pub(crate) struct Registry {
    known: Mutex<HashSet<String>>,
}

impl Registry {
    pub(crate) fn with_names(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: Mutex::new(names.into_iter().collect()),
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.known.lock().contains(name)
    }

    /// Runs `create` the first time `name` is seen. The lock is held while
    /// creating, so concurrent writers never race on the same name.
    pub(crate) fn ensure(&self, name: &str, create: impl FnOnce() -> Result<()>) -> Result<()> {
        let mut known = self.known.lock();
        if known.contains(name) {
            return Ok(());
        }
        create()?;
        known.insert(name.to_string());
        Ok(())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.known.lock().iter().cloned().collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Descending k-way merge
// ---------------------------------------------------------------------------

struct Head {
    id: u64,
    stream: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Head {}
impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// Merges descending id streams into one descending stream without
/// duplicates. Streams are pulled one item at a time.
pub(crate) struct MergeDescending {
    streams: Vec<Ids>,
    heap: BinaryHeap<Head>,
    primed: bool,
    last: Option<u64>,
    failed: bool,
}

impl MergeDescending {
    pub(crate) fn new(streams: Vec<Ids>) -> Self {
        Self {
            streams,
            heap: BinaryHeap::new(),
            primed: false,
            last: None,
            failed: false,
        }
    }

    fn pull(&mut self, stream: usize) -> Result<()> {
        if let Some(next) = self.streams[stream].next() {
            self.heap.push(Head { id: next?, stream });
        }
        Ok(())
    }
}

impl Iterator for MergeDescending {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Result<u64>> {
        if self.failed {
            return None;
        }
        if !self.primed {
            self.primed = true;
            for stream in 0..self.streams.len() {
                if let Err(e) = self.pull(stream) {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        while let Some(head) = self.heap.pop() {
            if let Err(e) = self.pull(head.stream) {
                self.failed = true;
                return Some(Err(e));
            }
            if self.last == Some(head.id) {
                continue;
            }
            self.last = Some(head.id);
            return Some(Ok(head.id));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Behaviour shared by every backend
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;

    fn stream(ids: &[u64]) -> Ids {
        Box::new(ids.to_vec().into_iter().map(Ok))
    }

    #[test]
    fn merge_interleaves_and_dedupes() {
        let merged: Vec<u64> = MergeDescending::new(vec![
            stream(&[9, 5, 2]),
            stream(&[8, 5, 1]),
            stream(&[]),
            stream(&[10]),
        ])
        .collect::<Result<_>>()
        .unwrap();
        assert_eq!(merged, vec![10, 9, 8, 5, 2, 1]);
    }

    #[test]
    fn registry_creates_once() {
        let registry = Registry::default();
        let mut created = 0;
        for _ in 0..3 {
            registry
                .ensure("text", || {
                    created += 1;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(created, 1);
        assert!(registry.contains("text"));
        assert_eq!(registry.names(), vec!["text".to_string()]);
    }
}
