//! Triples on redb.
//!
//! Every attribute gets two tables with unit values:
//!
//! - `fwd:{name}` keyed by `(id, value)`, for forward lookups;
//! - `rev:{name}` keyed by `(value, id)`, for reverse lookups.
//!
//! Both tables are written in the same transaction, so they never disagree.
//! Lazy sequences read in pages from one pinned read transaction, leased
//! from the cursor pool so an abandoned sequence cannot pin old pages
//! forever.

use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, TableHandle,
};
use tracing::{debug, warn};

use super::cursors::{Cursors, Lease};
use super::{Ids, Registry, Triples, Values};
use crate::{InfinityError, Result};

const PAGE: usize = 256;

fn forward(table: &str) -> TableDefinition<'_, (u64, &'static str), ()> {
    TableDefinition::new(table)
}

fn backward(table: &str) -> TableDefinition<'_, (&'static str, u64), ()> {
    TableDefinition::new(table)
}

fn forward_name(name: &str) -> String {
    format!("fwd:{name}")
}

fn backward_name(name: &str) -> String {
    format!("rev:{name}")
}

/// Where paged cursors get their read transactions from.
#[derive(Clone)]
struct Source {
    db: Arc<Database>,
    cursors: Arc<Cursors<ReadTransaction>>,
}

impl Source {
    fn lease(&self) -> Result<Lease<ReadTransaction>> {
        Ok(self.cursors.lease(self.db.begin_read()?))
    }

    fn pinned(&self) -> Result<Pinned> {
        Pinned::new(Source {
            db: Arc::clone(&self.db),
            cursors: Arc::clone(&self.cursors),
        })
    }
}

/// A leased read transaction that is renewed if the pool reclaims it.
///
/// A renewed transaction sees a newer snapshot. Cursors resume strictly
/// after the last key they returned, so their order holds across renewals.
struct Pinned {
    source: Source,
    lease: Lease<ReadTransaction>,
}

impl Pinned {
    fn new(source: Source) -> Result<Self> {
        let lease = source.lease()?;
        Ok(Self { source, lease })
    }

    fn read<R>(&mut self, table: &str, f: impl Fn(&ReadTransaction) -> Result<R>) -> Result<R> {
        if let Some(out) = self.lease.with(&f) {
            return out;
        }
        warn!(table, "cursor reclaimed while idle, resuming on a fresh snapshot");
        self.lease = self.source.lease()?;
        self.lease.with(&f).unwrap_or_else(|| {
            Err(InfinityError::Storage(format!(
                "cursor on '{table}' reclaimed twice in a row"
            )))
        })
    }
}

/// Rejects the reserved ids 0 and MAX, which would also overflow the
/// `id + 1` range bounds below.
fn check_id(id: u64) -> Result<()> {
    if id == 0 || id == u64::MAX {
        return Err(InfinityError::InvalidArgument(format!(
            "number {id} is reserved"
        )));
    }
    Ok(())
}

/// Embedded triples store.
pub struct RedbTriples {
    db: Arc<Database>,
    registry: Registry,
    cursors: Arc<Cursors<ReadTransaction>>,
}

impl RedbTriples {
    /// Opens or creates the store file at `path`.
    pub fn open(path: impl AsRef<Path>, cursor_ttl: Duration) -> Result<Self> {
        let db = Database::create(path.as_ref())?;
        Self::init(db, cursor_ttl)
    }

    /// A store that lives only as long as this value. Used by tests and
    /// throwaway indexes.
    pub fn open_in_memory(cursor_ttl: Duration) -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, cursor_ttl)
    }

    fn init(db: Database, cursor_ttl: Duration) -> Result<Self> {
        let names = {
            let read_txn = db.begin_read()?;
            let names = read_txn
                .list_tables()?
                .filter_map(|table| table.name().strip_prefix("fwd:").map(str::to_string))
                .collect::<Vec<_>>();
            names
        };
        debug!(attributes = names.len(), "opened redb triples");
        Ok(Self {
            db: Arc::new(db),
            registry: Registry::with_names(names),
            cursors: Cursors::new(cursor_ttl),
        })
    }

    /// Open cursor leases, for diagnostics.
    pub fn open_cursors(&self) -> usize {
        self.cursors.active()
    }

    fn ensure(&self, name: &str) -> Result<()> {
        self.registry.ensure(name, || {
            let write_txn = self.db.begin_write()?;
            write_txn.open_table(forward(&forward_name(name)))?;
            write_txn.open_table(backward(&backward_name(name)))?;
            write_txn.commit()?;
            Ok(())
        })
    }

    fn pinned(&self) -> Result<Pinned> {
        Pinned::new(Source {
            db: Arc::clone(&self.db),
            cursors: Arc::clone(&self.cursors),
        })
    }
}

impl Triples for RedbTriples {
    fn put(&self, id: u64, name: &str, value: &str) -> Result<()> {
        check_id(id)?;
        self.ensure(name)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut fwd = write_txn.open_table(forward(&forward_name(name)))?;
            fwd.insert((id, value), ())?;
            let mut rev = write_txn.open_table(backward(&backward_name(name)))?;
            rev.insert((value, id), ())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn has(&self, id: u64, name: &str, value: &str) -> Result<bool> {
        check_id(id)?;
        if !self.registry.contains(name) {
            return Ok(false);
        }
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(forward(&forward_name(name))) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get((id, value))?.is_some())
    }

    fn get(&self, id: u64, name: &str) -> Result<String> {
        match self.all(id, name)?.next() {
            Some(value) => value,
            None => Err(InfinityError::Missing(format!(
                "number {id} not found in '{name}'"
            ))),
        }
    }

    fn all(&self, id: u64, name: &str) -> Result<Values> {
        check_id(id)?;
        if !self.registry.contains(name) {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(ValueCursor {
            pinned: Some(self.pinned()?),
            table: forward_name(name),
            id,
            after: None,
            page: VecDeque::new(),
        }))
    }

    fn reverse(&self, name: &str, value: &str) -> Result<Ids> {
        if !self.registry.contains(name) {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(IdCursor {
            pinned: Some(self.pinned()?),
            table: backward_name(name),
            value: value.to_string(),
            ceiling: u64::MAX,
            page: VecDeque::new(),
        }))
    }

    fn clear(&self, id: u64, name: &str) -> Result<()> {
        check_id(id)?;
        if !self.registry.contains(name) {
            return Err(InfinityError::Fatal(format!(
                "failed to delete {id} in '{name}': no such attribute"
            )));
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut fwd = write_txn.open_table(forward(&forward_name(name)))?;
            let mut values = Vec::new();
            for entry in fwd.range((id, "")..(id + 1, ""))? {
                let (key, _) = entry?;
                values.push(key.value().1.to_string());
            }
            if values.is_empty() {
                return Err(InfinityError::Fatal(format!(
                    "failed to delete {id} in '{name}': nothing stored"
                )));
            }
            let mut rev = write_txn.open_table(backward(&backward_name(name)))?;
            for value in &values {
                fwd.remove((id, value.as_str()))?;
                if rev.remove((value.as_str(), id))?.is_none() {
                    return Err(InfinityError::Fatal(format!(
                        "failed to delete {id} in '{name}': reverse entry for '{value}' is missing"
                    )));
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.registry.names()
    }
}

// ---------------------------------------------------------------------------
// Paged cursors
// ---------------------------------------------------------------------------

struct IdCursor {
    /// `None` once the last page has been read.
    pinned: Option<Pinned>,
    table: String,
    value: String,
    /// Exclusive upper bound of the next page.
    ceiling: u64,
    page: VecDeque<u64>,
}

impl IdCursor {
    fn refill(&mut self) -> Result<()> {
        let Some(pinned) = &mut self.pinned else {
            return Ok(());
        };
        let (table, value, ceiling) = (&self.table, self.value.as_str(), self.ceiling);
        let ids = pinned.read(table, |txn| -> Result<Vec<u64>> {
            let rev = match txn.open_table(backward(table)) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut ids = Vec::with_capacity(PAGE);
            for entry in rev.range((value, 0u64)..(value, ceiling))?.rev().take(PAGE) {
                let (key, _) = entry?;
                ids.push(key.value().1);
            }
            Ok(ids)
        })?;
        if ids.len() < PAGE {
            self.pinned = None;
        }
        if let Some(last) = ids.last() {
            self.ceiling = *last;
        }
        self.page.extend(ids);
        Ok(())
    }
}

impl Iterator for IdCursor {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Result<u64>> {
        if self.page.is_empty() {
            if let Err(e) = self.refill() {
                self.pinned = None;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

struct ValueCursor {
    /// `None` once the last page has been read.
    pinned: Option<Pinned>,
    table: String,
    id: u64,
    /// Last value returned; the next page starts after it.
    after: Option<String>,
    page: VecDeque<String>,
}

impl ValueCursor {
    fn refill(&mut self) -> Result<()> {
        let Some(pinned) = &mut self.pinned else {
            return Ok(());
        };
        let (table, id) = (&self.table, self.id);
        let after = self.after.as_deref();
        let values = pinned.read(table, |txn| -> Result<Vec<String>> {
            let fwd = match txn.open_table(forward(table)) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let lower = match after {
                Some(after) => Bound::Excluded((id, after)),
                None => Bound::Included((id, "")),
            };
            let mut values = Vec::new();
            for entry in fwd.range((lower, Bound::Excluded((id + 1, ""))))?.take(PAGE) {
                let (key, _) = entry?;
                values.push(key.value().1.to_string());
            }
            Ok(values)
        })?;
        if values.len() < PAGE {
            self.pinned = None;
        }
        if let Some(last) = values.last() {
            self.after = Some(last.clone());
        }
        self.page.extend(values);
        Ok(())
    }
}

impl Iterator for ValueCursor {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        if self.page.is_empty() {
            if let Err(e) = self.refill() {
                self.pinned = None;
                return Some(Err(e));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triples::contract;
    use tempfile::NamedTempFile;

    const TTL: Duration = Duration::from_secs(10);

    fn open_temp_store() -> (RedbTriples, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let store = RedbTriples::open(file.path(), TTL).unwrap();
        (store, file)
    }

    #[test]
    fn honours_the_triples_contract() {
        contract::run_all(|| Arc::new(RedbTriples::open_in_memory(TTL).unwrap()));
    }

    #[test]
    fn reuses_files_on_disc_after_close() {
        let (store, file) = open_temp_store();
        store.put(1, "text", "persisted").unwrap();
        drop(store);

        let store = RedbTriples::open(file.path(), TTL).unwrap();
        assert_eq!(store.get(1, "text").unwrap(), "persisted");
        assert_eq!(store.names(), vec!["text".to_string()]);
    }

    #[test]
    fn exhausted_sequences_release_their_cursor() {
        let store = RedbTriples::open_in_memory(TTL).unwrap();
        store.put(1, "text", "a").unwrap();
        let found: Vec<u64> = store
            .reverse("text", "a")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found, vec![1]);
        assert_eq!(store.open_cursors(), 0);
    }

    #[test]
    fn abandoned_sequences_resume_after_their_cursor_is_reclaimed() {
        let store = RedbTriples::open_in_memory(Duration::from_millis(5)).unwrap();
        for id in 1..=600u64 {
            store.put(id, "text", "a").unwrap();
        }
        let mut parked = store.reverse("text", "a").unwrap();
        assert_eq!(parked.next().unwrap().unwrap(), 600);
        assert_eq!(store.open_cursors(), 1);
        std::thread::sleep(Duration::from_millis(20));
        // any new sequence sweeps the pool
        let _fresh = store.reverse("text", "a").unwrap();
        assert_eq!(store.open_cursors(), 1, "only the fresh lease remains");
        let rest: Vec<u64> = parked.by_ref().map(|id| id.unwrap()).collect();
        assert_eq!(rest.len(), 599, "nothing is lost across the reclaim");
        assert_eq!(rest.first(), Some(&599));
        assert!(rest.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn value_sequences_resume_after_their_cursor_is_reclaimed() {
        let store = RedbTriples::open_in_memory(Duration::from_millis(5)).unwrap();
        for n in 0..300u32 {
            store.put(1, "tag", &format!("v{n:03}")).unwrap();
        }
        let mut parked = store.all(1, "tag").unwrap();
        assert_eq!(parked.next().unwrap().unwrap(), "v000");
        std::thread::sleep(Duration::from_millis(20));
        let _fresh = store.all(1, "tag").unwrap();
        let rest: Vec<String> = parked.map(|v| v.unwrap()).collect();
        assert_eq!(rest.len(), 299);
        assert_eq!(rest.last().map(String::as_str), Some("v299"));
    }

    #[test]
    fn sequences_see_a_stable_snapshot() {
        let store = RedbTriples::open_in_memory(TTL).unwrap();
        store.put(1, "text", "a").unwrap();
        let seq = store.reverse("text", "a").unwrap();
        store.put(2, "text", "a").unwrap();
        let found: Vec<u64> = seq.collect::<Result<_>>().unwrap();
        assert_eq!(found, vec![1], "pinned before the second put");
    }
}
