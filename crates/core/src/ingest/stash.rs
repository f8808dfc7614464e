//! Crash-safe log of notices that are not yet reflected in a baseline.
//!
//! Each notice is one JSON file named after its content hash. A notice is
//! marked done once applied, and done files are deleted only at the next
//! flush, after the index has been written. A crash in between leaves the
//! file behind and the notice is replayed on the next open.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::notice::Notice;
use crate::directory::write_atomic;
use crate::{InfinityError, Result};

const PREFIX: &str = "ntc-";
const SUFFIX: &str = ".json";

pub struct Stash {
    dir: PathBuf,
    done: Mutex<HashSet<String>>,
}

impl Stash {
    /// Opens the stash in `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() && !dir.is_dir() {
            return Err(InfinityError::InvalidArgument(format!(
                "stash location '{}' is not a directory",
                dir.display()
            )));
        }
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            done: Mutex::new(HashSet::new()),
        })
    }

    fn file(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{PREFIX}{key}{SUFFIX}"))
    }

    /// Persists `notice` and returns its key.
    pub fn add(&self, notice: &Notice) -> Result<String> {
        let key = notice.key()?;
        write_atomic(&self.file(&key), &notice.to_json()?)?;
        self.done.lock().remove(&key);
        debug!(key = %key, kind = notice.kind(), "notice stashed");
        Ok(key)
    }

    /// Marks `notice` as applied. Its file stays until [`Stash::purge`].
    pub fn remove(&self, notice: &Notice) -> Result<()> {
        let key = notice.key()?;
        self.done.lock().insert(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<(SystemTime, String)>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name
                .to_str()
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|n| n.strip_suffix(SUFFIX))
            else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            keys.push((modified, key.to_string()));
        }
        keys.sort();
        Ok(keys)
    }

    /// Notices not yet marked done, oldest first. Unreadable files are moved
    /// aside with a `.broken` suffix and skipped.
    pub fn pending(&self) -> Result<Vec<Notice>> {
        let done = self.done.lock().clone();
        let mut notices = Vec::new();
        for (_, key) in self.keys()? {
            if done.contains(&key) {
                continue;
            }
            let path = self.file(&key);
            match fs::read(&path).map_err(InfinityError::from).and_then(|b| Notice::from_json(&b)) {
                Ok(notice) => notices.push(notice),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "moving unreadable notice aside");
                    set_aside(&path)?;
                }
            }
        }
        Ok(notices)
    }

    /// Keys of the notices marked done so far.
    pub fn done(&self) -> Vec<String> {
        self.done.lock().iter().cloned().collect()
    }

    /// Deletes the files of `keys` that are still marked done. Returns how
    /// many were deleted.
    pub fn purge(&self, keys: &[String]) -> Result<usize> {
        let mut done = self.done.lock();
        let mut purged = 0;
        for key in keys {
            if !done.contains(key) {
                continue;
            }
            match fs::remove_file(self.file(key)) {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            done.remove(key);
        }
        if purged > 0 {
            info!(purged, "stash purged");
        }
        Ok(purged)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn set_aside(path: &Path) -> Result<()> {
    let mut broken = path.as_os_str().to_owned();
    broken.push(".broken");
    fs::rename(path, PathBuf::from(broken))?;
    Ok(())
}
