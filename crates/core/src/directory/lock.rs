//! Exclusive marker file guarding a directory.
//!
//! The marker holds an advisory OS lock for as long as the [`Lock`] lives.
//! The OS drops that lock when the holding process dies, so a marker left
//! behind by a crash has no live holder and is taken over on the next
//! acquisition.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::{InfinityError, Result};

pub const MARKER: &str = "lock.txt";

/// Attempts at locking a marker that a releasing holder deletes under us.
const ATTEMPTS: usize = 3;

/// Held for as long as the value lives; dropping it deletes the marker.
#[derive(Debug)]
pub struct Lock {
    marker: PathBuf,
    file: File,
}

impl Lock {
    /// Creates `dir` if needed and claims it.
    ///
    /// Fails with [`InfinityError::Locked`] while another holder is alive,
    /// whether in another process or in this one.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let marker = dir.join(MARKER);
        for _ in 0..ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&marker)?;
            if file.try_lock_exclusive().is_err() {
                let holder = fs::read_to_string(&marker).unwrap_or_default();
                return Err(InfinityError::Locked {
                    path: dir.display().to_string(),
                    holder: holder.trim().to_string(),
                });
            }
            // The previous holder deleted the marker between our open and
            // our lock; the file we hold is gone from the directory.
            if !marker.exists() {
                continue;
            }
            let mut stale = String::new();
            file.read_to_string(&mut stale)?;
            if !stale.trim().is_empty() {
                warn!(path = %marker.display(), stale = %stale.trim(), "taking over a dirty lock");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            writeln!(
                file,
                "locked by pid {} at {}",
                std::process::id(),
                Utc::now().to_rfc3339()
            )?;
            file.sync_all()?;
            debug!(path = %marker.display(), "lock acquired");
            return Ok(Self { marker, file });
        }
        Err(InfinityError::Locked {
            path: dir.display().to_string(),
            holder: "marker keeps disappearing".into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.marker
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        // Delete while still holding the lock, then let it go.
        match fs::remove_file(&self.marker) {
            Ok(()) => debug!(path = %self.marker.display(), "lock released"),
            Err(e) => warn!(path = %self.marker.display(), error = %e, "failed to release lock"),
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.marker.display(), error = %e, "failed to unlock marker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Lock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());

        let err = Lock::acquire(dir.path()).unwrap_err();
        match err {
            InfinityError::Locked { holder, .. } => {
                assert!(holder.contains(&std::process::id().to_string()), "{holder}")
            }
            other => panic!("expected Locked, got {other:?}"),
        }

        drop(lock);
        assert!(!dir.path().join(MARKER).exists(), "marker must be deleted");
        Lock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn marker_left_by_a_dead_process_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MARKER),
            "locked by pid 999999 at 2020-01-01T00:00:00Z\n",
        )
        .unwrap();
        let lock = Lock::acquire(dir.path()).unwrap();
        let holder = fs::read_to_string(lock.path()).unwrap();
        assert!(holder.contains(&std::process::id().to_string()), "{holder}");
        assert!(!holder.contains("999999"), "stale holder overwritten: {holder}");
        assert!(Lock::acquire(dir.path()).is_err(), "now held for real");
    }

    #[test]
    fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let _lock = Lock::acquire(&nested).unwrap();
        assert!(nested.join(MARKER).exists());
    }
}
