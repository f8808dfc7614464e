//! Infinity: message search and attribute indexing engine.
//!
//! Messages posted into bouts arrive as [`Notice`]s. Each notice is stashed
//! on disk, applied by a pool of workers to the attribute store and the
//! in-memory index, and becomes visible to queries once [`Infinity::eta`]
//! for its dependency keys drops to zero.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use infinity::{Config, Infinity};
//!
//! let inf = Infinity::open(Config::new("/var/lib/infinity")).unwrap();
//! let keys = vec!["urn:test:jeff".to_string()];
//! while inf.eta(&keys) != 0 {
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! let found: Vec<u64> = inf.messages("(and (matches 'lunch') (limit 10))").unwrap().collect();
//! inf.close().unwrap();
//! ```

mod codec;
pub mod config;
pub mod directory;
pub mod index;
pub mod ingest;
pub mod lattice;
pub mod numbers;
pub mod query;
pub mod retry;
pub mod schema;
pub mod triples;

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

pub use config::{Backend, Config};
pub use directory::{AuditReport, Directory};
pub use index::Index;
pub use ingest::{Bout, Message, Notice};
pub use lattice::Lattice;
pub use numbers::Numbers;
pub use query::{Evaluator, FuzzyScorer, Messages, Predicate, Query, Scorer};
pub use triples::Triples;

use ingest::{Apply, Indexer, Mux, Stash};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InfinityError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("syntax error in '{query}': {reason}")]
    Syntax { query: String, reason: String },
    #[error("{0}")]
    Missing(String),
    #[error("'{path}' is locked: {holder}")]
    Locked { path: String, holder: String },
    #[error("corrupted data: {0}")]
    Corrupted(String),
    #[error("audit of '{attribute}' found {problems} problem(s)")]
    Audit { attribute: String, problems: usize },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("engine is closed")]
    Closed,
}

impl From<redb::DatabaseError> for InfinityError {
    fn from(e: redb::DatabaseError) -> Self {
        InfinityError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for InfinityError {
    fn from(e: redb::TransactionError) -> Self {
        InfinityError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for InfinityError {
    fn from(e: redb::TableError) -> Self {
        InfinityError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for InfinityError {
    fn from(e: redb::StorageError) -> Self {
        InfinityError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for InfinityError {
    fn from(e: redb::CommitError) -> Self {
        InfinityError::Storage(e.to_string())
    }
}
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for InfinityError {
    fn from(e: rusqlite::Error) -> Self {
        InfinityError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InfinityError>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

const INDEX_DIR: &str = "index";
const STASH_DIR: &str = "stash";

/// How long `close` waits for queued notices.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Infinity {
    config: Config,
    directory: Directory,
    triples: Arc<dyn Triples>,
    index: Arc<Index>,
    stash: Arc<Stash>,
    mux: Mux,
    evaluator: Evaluator,
}

impl Infinity {
    /// Opens the engine under `config.root`.
    ///
    /// Leftover drafts are promoted and audited, the index is loaded from
    /// the baselines, and stashed notices are applied before this returns.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let directory = Directory::open(config.root.join(INDEX_DIR))?;
        match directory.baseline() {
            Ok(0) => {}
            Ok(promoted) => info!(promoted, "leftover drafts promoted"),
            Err(InfinityError::Audit { attribute, problems }) => {
                warn!(attribute = %attribute, problems, "leftover draft failed its audit, keeping the baseline")
            }
            Err(e) => return Err(e),
        }
        let report = directory.audit();
        if !report.is_clean() {
            warn!(problems = report.count(), "index audit found problems");
        }
        let triples = open_triples(&config)?;
        let index = Arc::new(Index::load(&directory)?);
        let stash = Arc::new(Stash::open(config.root.join(STASH_DIR))?);
        let indexer = Arc::new(Indexer::new(Arc::clone(&index), Arc::clone(&triples)));
        replay(&stash, indexer.as_ref(), &config)?;
        let mux = Mux::start(indexer, Arc::clone(&stash), config.workers, config.retry())?;
        let evaluator = Evaluator::new(
            Arc::clone(&index),
            Arc::clone(&triples),
            Arc::new(FuzzyScorer::default()),
        );
        info!(root = %config.root.display(), backend = ?config.backend, "infinity opened");
        Ok(Self {
            config,
            directory,
            triples,
            index,
            stash,
            mux,
            evaluator,
        })
    }

    /// Replaces the word matcher used by `matches`.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.evaluator = Evaluator::new(Arc::clone(&self.index), Arc::clone(&self.triples), scorer);
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Accepts a notice for asynchronous indexing and returns the keys to
    /// poll [`Infinity::eta`] with.
    pub fn see(&self, notice: Notice) -> Result<BTreeSet<String>> {
        if notice.deps().is_empty() {
            return Err(InfinityError::InvalidArgument(format!(
                "{} notice has no dependencies",
                notice.kind()
            )));
        }
        self.stash.add(&notice)?;
        self.mux.submit(notice)
    }

    /// Estimated milliseconds until every notice touching `keys` is
    /// indexed. Zero means caught up.
    pub fn eta<S: AsRef<str>>(&self, keys: impl IntoIterator<Item = S>) -> u64 {
        let keys: Vec<S> = keys.into_iter().collect();
        self.mux.eta(keys.iter().map(AsRef::as_ref))
    }

    /// Message numbers matching `query`, highest first.
    pub fn messages(&self, query: &str) -> Result<Messages> {
        self.evaluator.messages(&Query::parse(query)?)
    }

    /// Distinct bout numbers of the messages matching `query`, in the order
    /// their newest message appears.
    pub fn bouts(&self, query: &str) -> Result<impl Iterator<Item = u64>> {
        let index = Arc::clone(&self.index);
        let mut seen = HashSet::new();
        Ok(self.messages(query)?.filter_map(move |id| {
            let bout = index.value_of(schema::BOUT, id)?.parse::<u64>().ok()?;
            seen.insert(bout).then_some(bout)
        }))
    }

    /// Writes the index to drafts, promotes them if configured to, and
    /// forgets stashed notices that are now persisted.
    pub fn flush(&self) -> Result<()> {
        let done = self.stash.done();
        self.index.save(&self.directory)?;
        if self.config.baseline_on_flush {
            self.directory.baseline()?;
        }
        self.stash.purge(&done)?;
        Ok(())
    }

    pub fn audit(&self) -> AuditReport {
        self.directory.audit()
    }

    /// Drains queued notices, flushes and releases every resource.
    pub fn close(self) -> Result<()> {
        self.mux.close(CLOSE_TIMEOUT)?;
        self.flush()?;
        self.triples.close()?;
        info!(root = %self.config.root.display(), "infinity closed");
        Ok(())
    }
}

fn open_triples(config: &Config) -> Result<Arc<dyn Triples>> {
    match config.backend {
        Backend::Redb => Ok(Arc::new(triples::RedbTriples::open(
            config.root.join("triples.redb"),
            config.cursor_ttl(),
        )?)),
        #[cfg(feature = "sqlite")]
        Backend::Sqlite => Ok(Arc::new(triples::SqlTriples::open(
            config.root.join("triples.sqlite"),
            config.retry(),
        )?)),
        #[cfg(not(feature = "sqlite"))]
        Backend::Sqlite => Err(InfinityError::InvalidArgument(
            "built without the sqlite backend".into(),
        )),
    }
}

/// Applies every stashed notice synchronously.
fn replay(stash: &Stash, applier: &dyn Apply, config: &Config) -> Result<()> {
    let pending = stash.pending()?;
    if pending.is_empty() {
        return Ok(());
    }
    let retry = config.retry();
    let mut replayed = 0;
    for notice in &pending {
        match retry.run(
            notice.kind(),
            || applier.apply(notice),
            |e| matches!(e, InfinityError::Storage(_) | InfinityError::Io(_)),
        ) {
            Ok(()) => {
                stash.remove(notice)?;
                replayed += 1;
            }
            Err(e) => warn!(kind = notice.kind(), error = %e, "stashed notice failed to replay"),
        }
    }
    info!(replayed, failed = pending.len() - replayed, "stash replayed");
    Ok(())
}
