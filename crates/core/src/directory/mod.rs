//! Durable on-disk layout of the index.
//!
//! ```text
//! <root>/lock.txt                 process lock
//! <root>/<attribute>/lock.txt     attribute lock
//! <root>/<attribute>/version.txt  name of the current baseline, e.g. 000003
//! <root>/<attribute>/000003/      baseline: catalog.json, data.bin, reverse.bin
//! <root>/<attribute>/draft/       backlog.json, n-000001.bin ..., reverse.bin
//! ```
//!
//! A baseline is immutable. Writes land in the draft; [`Directory::baseline`]
//! merges the draft over the current baseline into the next numbered
//! folder, audits it, and only then switches `version.txt`. Readers load
//! from the baseline, so they see nothing of a draft until it is promoted.
//! Older baselines stay on disk until [`Directory::prune`].

pub mod audit;
mod lock;
mod reverse;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use audit::{AuditReport, ReversiveAuditor};
pub use lock::Lock;
pub use reverse::Reverse;

use crate::numbers::Numbers;
use crate::{InfinityError, Result};

const VERSION: &str = "version.txt";
const DRAFT: &str = "draft";
const BACKLOG: &str = "backlog.json";
pub(crate) const CATALOG: &str = "catalog.json";
pub(crate) const DATA: &str = "data.bin";
pub(crate) const REVERSE: &str = "reverse.bin";

/// Where each value's numbers live inside `data.bin`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Catalog {
    pub(crate) values: BTreeMap<String, Extent>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct Extent {
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

/// Draft files by value.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Backlog {
    files: BTreeMap<String, String>,
    next: u64,
}

/// Checks that `name` can be used as an attribute directory.
pub fn validate_attribute(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.len() > 128
        || name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control());
    if bad {
        return Err(InfinityError::InvalidArgument(format!(
            "invalid attribute name '{name}'"
        )));
    }
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn version_name(version: u64) -> String {
    format!("{version:06}")
}

pub(crate) fn read_catalog(folder: &Path) -> Result<Catalog> {
    match fs::read(folder.join(CATALOG)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| InfinityError::Corrupted(format!("{}: {e}", folder.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Catalog::default()),
        Err(e) => Err(e.into()),
    }
}

/// Loads the numbers at `extent` of the folder's `data.bin`.
pub(crate) fn read_numbers(folder: &Path, extent: Extent, numbers: &Numbers) -> Result<()> {
    let mut file = File::open(folder.join(DATA))?;
    file.seek(SeekFrom::Start(extent.offset))?;
    let mut bytes = Vec::new();
    file.take(extent.length).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != extent.length {
        return Err(InfinityError::Corrupted(format!(
            "{}: extent at {} is truncated",
            folder.display(),
            extent.offset
        )));
    }
    numbers.load(&mut bytes.as_slice())
}

fn read_reverse(folder: &Path, reverse: &Reverse) -> Result<()> {
    match File::open(folder.join(REVERSE)) {
        Ok(file) => reverse.load(&mut std::io::BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            reverse.clear();
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// One attribute
// ---------------------------------------------------------------------------

struct AttributeDir {
    name: String,
    path: PathBuf,
    _lock: Lock,
    /// Serialises draft writes and promotion of this attribute.
    writer: Mutex<()>,
}

impl AttributeDir {
    fn current_version(&self) -> Result<Option<u64>> {
        match fs::read_to_string(self.path.join(VERSION)) {
            Ok(text) => text.trim().parse::<u64>().map(Some).map_err(|_| {
                InfinityError::Corrupted(format!(
                    "bad version marker '{}' in '{}'",
                    text.trim(),
                    self.name
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn version_path(&self, version: u64) -> PathBuf {
        self.path.join(version_name(version))
    }

    fn baseline(&self) -> Result<Option<PathBuf>> {
        Ok(self.current_version()?.map(|v| self.version_path(v)))
    }

    fn draft(&self) -> PathBuf {
        self.path.join(DRAFT)
    }

    fn backlog(&self) -> Result<Backlog> {
        match fs::read(self.draft().join(BACKLOG)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Backlog::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Version folders on disk, ascending.
    fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(version) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Merges the draft over the current baseline into a new audited
    /// baseline. Returns the new version, or `None` without a draft.
    fn promote(&self) -> Result<Option<u64>> {
        let _writer = self.writer.lock();
        let draft = self.draft();
        if !draft.is_dir() {
            return Ok(None);
        }
        let backlog = self.backlog()?;
        let base = self.baseline()?;
        let base_catalog = match &base {
            Some(folder) => read_catalog(folder)?,
            None => Catalog::default(),
        };
        let version = self.current_version()?.unwrap_or(0) + 1;
        let target = self.version_path(version);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;

        let keys: BTreeSet<&String> = base_catalog
            .values
            .keys()
            .chain(backlog.files.keys())
            .collect();
        let mut data = Vec::new();
        let mut catalog = Catalog::default();
        for value in keys {
            let numbers = Numbers::new();
            let stored = base.as_ref().zip(base_catalog.values.get(value));
            match (backlog.files.get(value), stored) {
                (Some(file), _) => {
                    numbers.load(&mut std::io::BufReader::new(File::open(draft.join(file))?))?
                }
                (None, Some((folder, extent))) => read_numbers(folder, *extent, &numbers)?,
                (None, None) => continue,
            }
            if numbers.is_empty() {
                continue;
            }
            let offset = data.len() as u64;
            numbers.save(&mut data)?;
            catalog.values.insert(
                value.clone(),
                Extent {
                    offset,
                    length: data.len() as u64 - offset,
                },
            );
        }
        write_atomic(&target.join(DATA), &data)?;
        write_atomic(&target.join(CATALOG), &serde_json::to_vec(&catalog)?)?;
        let reverse = if draft.join(REVERSE).exists() {
            Some(draft.join(REVERSE))
        } else {
            base.as_ref()
                .map(|folder| folder.join(REVERSE))
                .filter(|path| path.exists())
        };
        if let Some(source) = reverse {
            fs::copy(source, target.join(REVERSE))?;
        }

        let mut report = AuditReport::default();
        ReversiveAuditor::audit_folder(&self.name, &target, &mut report);
        if !report.is_clean() {
            for problem in &report.problems {
                warn!(attribute = %self.name, %problem, "draft failed audit");
            }
            fs::remove_dir_all(&target)?;
            return Err(InfinityError::Audit {
                attribute: self.name.clone(),
                problems: report.count(),
            });
        }

        write_atomic(&self.path.join(VERSION), version_name(version).as_bytes())?;
        fs::remove_dir_all(&draft)?;
        info!(
            attribute = %self.name,
            version,
            values = catalog.values.len(),
            "baseline promoted"
        );
        Ok(Some(version))
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// The locked root of one index deployment.
pub struct Directory {
    root: PathBuf,
    attributes: Mutex<HashMap<String, Arc<AttributeDir>>>,
    // Declared last so attribute locks are released first.
    _lock: Lock,
}

impl Directory {
    /// Locks `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let lock = Lock::acquire(&root)?;
        info!(root = %root.display(), "directory opened");
        Ok(Self {
            root,
            attributes: Mutex::new(HashMap::new()),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn attribute(&self, name: &str) -> Result<Arc<AttributeDir>> {
        validate_attribute(name)?;
        let mut attributes = self.attributes.lock();
        if let Some(dir) = attributes.get(name) {
            return Ok(Arc::clone(dir));
        }
        let path = self.root.join(name);
        let dir = Arc::new(AttributeDir {
            name: name.to_string(),
            _lock: Lock::acquire(&path)?,
            path,
            writer: Mutex::new(()),
        });
        attributes.insert(name.to_string(), Arc::clone(&dir));
        Ok(dir)
    }

    /// Stores the numbers of `value` in the draft of `attribute`.
    pub fn save_numbers(&self, attribute: &str, value: &str, numbers: &Numbers) -> Result<()> {
        let dir = self.attribute(attribute)?;
        let _writer = dir.writer.lock();
        let draft = dir.draft();
        fs::create_dir_all(&draft)?;
        let mut backlog = dir.backlog()?;
        let file = match backlog.files.get(value) {
            Some(file) => file.clone(),
            None => {
                backlog.next += 1;
                format!("n-{:06}.bin", backlog.next)
            }
        };
        let mut bytes = Vec::new();
        numbers.save(&mut bytes)?;
        write_atomic(&draft.join(&file), &bytes)?;
        backlog.files.insert(value.to_string(), file);
        write_atomic(&draft.join(BACKLOG), &serde_json::to_vec(&backlog)?)?;
        debug!(attribute, value, size = bytes.len(), "numbers saved to draft");
        Ok(())
    }

    /// Replaces `numbers` with the baseline numbers of `value`, or empties
    /// it if the baseline has none.
    pub fn load_numbers(&self, attribute: &str, value: &str, numbers: &Numbers) -> Result<()> {
        let dir = self.attribute(attribute)?;
        let Some(folder) = dir.baseline()? else {
            numbers.clear();
            return Ok(());
        };
        match read_catalog(&folder)?.values.get(value) {
            Some(extent) => read_numbers(&folder, *extent, numbers),
            None => {
                numbers.clear();
                Ok(())
            }
        }
    }

    /// Stores the reverse map of `attribute` in its draft.
    pub fn save_reverse(&self, attribute: &str, reverse: &Reverse) -> Result<()> {
        let dir = self.attribute(attribute)?;
        let _writer = dir.writer.lock();
        let draft = dir.draft();
        fs::create_dir_all(&draft)?;
        let mut bytes = Vec::new();
        reverse.save(&mut bytes)?;
        write_atomic(&draft.join(REVERSE), &bytes)
    }

    /// Replaces `reverse` with the baseline reverse map of `attribute`.
    pub fn load_reverse(&self, attribute: &str, reverse: &Reverse) -> Result<()> {
        let dir = self.attribute(attribute)?;
        match dir.baseline()? {
            Some(folder) => read_reverse(&folder, reverse),
            None => {
                reverse.clear();
                Ok(())
            }
        }
    }

    /// Values catalogued in the baseline of `attribute`. An unreadable
    /// catalog yields no values.
    pub fn values(&self, attribute: &str) -> Result<Vec<String>> {
        let dir = self.attribute(attribute)?;
        let Some(folder) = dir.baseline()? else {
            return Ok(Vec::new());
        };
        match read_catalog(&folder) {
            Ok(catalog) => Ok(catalog.values.into_keys().collect()),
            Err(e) => {
                warn!(attribute, error = %e, "catalog is unreadable, ignoring it");
                Ok(Vec::new())
            }
        }
    }

    /// Attribute names with a directory under the root, sorted.
    pub fn attributes(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            match entry.file_name().to_str() {
                Some(name) if is_dir && validate_attribute(name).is_ok() => {
                    names.push(name.to_string())
                }
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }

    /// Baseline folder of `attribute`, if it has one.
    pub fn baseline_folder(&self, attribute: &str) -> Result<Option<PathBuf>> {
        self.attribute(attribute)?.baseline()
    }

    /// Promotes every pending draft. Returns how many were promoted.
    ///
    /// Stops at the first draft that fails its audit; that draft stays in
    /// place and the error names the attribute.
    pub fn baseline(&self) -> Result<usize> {
        let mut promoted = 0;
        for name in self.attributes()? {
            if self.attribute(&name)?.promote()?.is_some() {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Switches `attribute` back to its previous baseline. Returns the
    /// version now current.
    pub fn rollback(&self, attribute: &str) -> Result<u64> {
        let dir = self.attribute(attribute)?;
        let _writer = dir.writer.lock();
        let current = dir.current_version()?.ok_or_else(|| {
            InfinityError::InvalidArgument(format!("'{attribute}' has no baseline"))
        })?;
        let previous = dir
            .versions()?
            .into_iter()
            .filter(|v| *v < current)
            .max()
            .ok_or_else(|| {
                InfinityError::InvalidArgument(format!(
                    "'{attribute}' has no baseline older than {}",
                    version_name(current)
                ))
            })?;
        write_atomic(&dir.path.join(VERSION), version_name(previous).as_bytes())?;
        info!(attribute, from = current, to = previous, "baseline rolled back");
        Ok(previous)
    }

    /// Deletes every baseline folder that is not current. Returns how many
    /// were deleted.
    pub fn prune(&self) -> Result<usize> {
        let mut pruned = 0;
        for name in self.attributes()? {
            let dir = self.attribute(&name)?;
            let _writer = dir.writer.lock();
            let current = dir.current_version()?;
            for version in dir.versions()? {
                if Some(version) != current {
                    fs::remove_dir_all(dir.version_path(version))?;
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            info!(pruned, "old baselines pruned");
        }
        Ok(pruned)
    }

    /// Deletes every attribute, baselines and drafts alike.
    pub fn clear(&self) -> Result<()> {
        let names = self.attributes()?;
        self.attributes.lock().clear();
        for name in &names {
            fs::remove_dir_all(self.root.join(name))?;
        }
        info!(attributes = names.len(), "directory cleared");
        Ok(())
    }

    /// Runs the reverse/forward consistency audit over all baselines.
    pub fn audit(&self) -> AuditReport {
        ReversiveAuditor::audit(self)
    }
}
