//! Triples on SQLite.
//!
//! One table per attribute with a composite primary key `(id, value)` and
//! a covering `(value, id)` index for reverse lookups. Tables are created
//! on first write. Lazy sequences use keyset pagination, so no statement
//! outlives a single page and nothing needs reclaiming.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use super::{Ids, Registry, Triples, Values};
use crate::retry::Retry;
use crate::{InfinityError, Result};

const PAGE: i64 = 256;
const TABLE_PREFIX: &str = "triples:";

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 1000;";

fn table(name: &str) -> String {
    format!("\"{TABLE_PREFIX}{}\"", name.replace('"', "\"\""))
}

fn schema(name: &str) -> String {
    let table = table(name);
    let index = format!("\"{TABLE_PREFIX}{}:reverse\"", name.replace('"', "\"\""));
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (id, value)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS {index} ON {table} (value, id);"
    )
}

fn sql_id(id: u64) -> Result<i64> {
    if id == 0 {
        return Err(InfinityError::InvalidArgument("number 0 is reserved".into()));
    }
    i64::try_from(id)
        .ok()
        .filter(|id| *id < i64::MAX)
        .ok_or_else(|| {
            InfinityError::InvalidArgument(format!(
                "number {id} is too large for the sqlite backend"
            ))
        })
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

struct Shared {
    conn: Mutex<Connection>,
    retry: Retry,
}

impl Shared {
    /// Runs `op` on the connection, retrying busy/locked failures.
    fn run<T>(&self, what: &str, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        self.retry
            .run(what, || op(&self.conn.lock()), is_transient)
            .map_err(InfinityError::from)
    }
}

/// Relational triples store.
pub struct SqlTriples {
    shared: Arc<Shared>,
    registry: Registry,
}

impl SqlTriples {
    pub fn open(path: impl AsRef<Path>, retry: Retry) -> Result<Self> {
        Self::init(Connection::open(path.as_ref())?, retry)
    }

    pub fn open_in_memory(retry: Retry) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, retry)
    }

    fn init(conn: Connection, retry: Retry) -> Result<Self> {
        conn.execute_batch(PRAGMAS)?;
        let names = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'triples:%'",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = Vec::new();
            for row in rows {
                if let Some(name) = row?.strip_prefix(TABLE_PREFIX) {
                    names.push(name.to_string());
                }
            }
            names
        };
        debug!(attributes = names.len(), "opened sqlite triples");
        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                retry,
            }),
            registry: Registry::with_names(names),
        })
    }

    fn ensure(&self, name: &str) -> Result<()> {
        self.registry.ensure(name, || {
            let ddl = schema(name);
            self.shared.run("create table", |conn| conn.execute_batch(&ddl))
        })
    }
}

impl Triples for SqlTriples {
    fn put(&self, id: u64, name: &str, value: &str) -> Result<()> {
        let id = sql_id(id)?;
        self.ensure(name)?;
        let sql = format!("INSERT OR IGNORE INTO {} (id, value) VALUES (?1, ?2)", table(name));
        self.shared
            .run("put", |conn| conn.execute(&sql, params![id, value]))?;
        Ok(())
    }

    fn has(&self, id: u64, name: &str, value: &str) -> Result<bool> {
        let id = sql_id(id)?;
        if !self.registry.contains(name) {
            return Ok(false);
        }
        let sql = format!("SELECT 1 FROM {} WHERE id = ?1 AND value = ?2", table(name));
        let found = self.shared.run("has", |conn| {
            conn.query_row(&sql, params![id, value], |_| Ok(()))
                .optional()
        })?;
        Ok(found.is_some())
    }

    fn get(&self, id: u64, name: &str) -> Result<String> {
        let missing = || InfinityError::Missing(format!("number {id} not found in '{name}'"));
        let key = sql_id(id)?;
        if !self.registry.contains(name) {
            return Err(missing());
        }
        let sql = format!(
            "SELECT value FROM {} WHERE id = ?1 ORDER BY value LIMIT 1",
            table(name)
        );
        self.shared
            .run("get", |conn| {
                conn.query_row(&sql, params![key], |row| row.get::<_, String>(0))
                    .optional()
            })?
            .ok_or_else(missing)
    }

    fn all(&self, id: u64, name: &str) -> Result<Values> {
        let id = sql_id(id)?;
        if !self.registry.contains(name) {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(ValuePages {
            shared: Arc::clone(&self.shared),
            sql: format!(
                "SELECT value FROM {} WHERE id = ?1 AND value > ?2 ORDER BY value LIMIT {PAGE}",
                table(name)
            ),
            id,
            after: String::new(),
            page: VecDeque::new(),
            done: false,
        }))
    }

    fn reverse(&self, name: &str, value: &str) -> Result<Ids> {
        if !self.registry.contains(name) {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(IdPages {
            shared: Arc::clone(&self.shared),
            sql: format!(
                "SELECT id FROM {} WHERE value = ?1 AND id < ?2 ORDER BY id DESC LIMIT {PAGE}",
                table(name)
            ),
            value: value.to_string(),
            ceiling: i64::MAX,
            page: VecDeque::new(),
            done: false,
        }))
    }

    fn clear(&self, id: u64, name: &str) -> Result<()> {
        let key = sql_id(id)?;
        if !self.registry.contains(name) {
            return Err(InfinityError::Fatal(format!(
                "failed to delete {id} in '{name}': no such attribute"
            )));
        }
        let sql = format!("DELETE FROM {} WHERE id = ?1", table(name));
        let removed = self
            .shared
            .run("clear", |conn| conn.execute(&sql, params![key]))?;
        if removed == 0 {
            return Err(InfinityError::Fatal(format!(
                "failed to delete {id} in '{name}': nothing stored"
            )));
        }
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.registry.names()
    }

    fn close(&self) -> Result<()> {
        self.shared
            .run("checkpoint", |conn| conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);"))
    }
}

struct IdPages {
    shared: Arc<Shared>,
    sql: String,
    value: String,
    ceiling: i64,
    page: VecDeque<u64>,
    done: bool,
}

impl Iterator for IdPages {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Result<u64>> {
        if self.page.is_empty() && !self.done {
            let (sql, value, ceiling) = (&self.sql, self.value.as_str(), self.ceiling);
            let fetched = self.shared.run("reverse", |conn| {
                let mut stmt = conn.prepare_cached(sql)?;
                let rows = stmt.query_map(params![value, ceiling], |row| row.get::<_, i64>(0))?;
                rows.collect::<rusqlite::Result<Vec<i64>>>()
            });
            match fetched {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(ids) => {
                    self.done = (ids.len() as i64) < PAGE;
                    if let Some(last) = ids.last() {
                        self.ceiling = *last;
                    }
                    self.page.extend(ids.into_iter().map(|id| id as u64));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

struct ValuePages {
    shared: Arc<Shared>,
    sql: String,
    id: i64,
    after: String,
    page: VecDeque<String>,
    done: bool,
}

impl Iterator for ValuePages {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Result<String>> {
        if self.page.is_empty() && !self.done {
            let (sql, id, after) = (&self.sql, self.id, self.after.as_str());
            let fetched = self.shared.run("all", |conn| {
                let mut stmt = conn.prepare_cached(sql)?;
                let rows = stmt.query_map(params![id, after], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()
            });
            match fetched {
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Ok(values) => {
                    self.done = (values.len() as i64) < PAGE;
                    if let Some(last) = values.last() {
                        self.after = last.clone();
                    }
                    self.page.extend(values);
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triples::contract;

    #[test]
    fn honours_the_triples_contract() {
        contract::run_all(|| Arc::new(SqlTriples::open_in_memory(Retry::default()).unwrap()));
    }

    #[test]
    fn rejects_numbers_beyond_sql_integer_range() {
        let store = SqlTriples::open_in_memory(Retry::default()).unwrap();
        let err = store.put(u64::MAX - 1, "text", "x").unwrap_err();
        assert!(matches!(err, InfinityError::InvalidArgument(_)), "got {err:?}");
    }

    #[test]
    fn attribute_names_are_quoted() {
        let store = SqlTriples::open_in_memory(Retry::default()).unwrap();
        store.put(1, "weird \"name\"; DROP", "v").unwrap();
        assert_eq!(store.get(1, "weird \"name\"; DROP").unwrap(), "v");
    }

    #[test]
    fn reuses_tables_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triples.sqlite");
        {
            let store = SqlTriples::open(&path, Retry::default()).unwrap();
            store.put(3, "bout.title", "lunch").unwrap();
            store.close().unwrap();
        }
        let store = SqlTriples::open(&path, Retry::default()).unwrap();
        assert_eq!(store.names(), vec!["bout.title".to_string()]);
        assert!(store.has(3, "bout.title", "lunch").unwrap());
    }
}
