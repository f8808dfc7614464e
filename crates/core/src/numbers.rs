//! Compact sorted set of message numbers.
//!
//! Message numbers are allocated in ascending order, so a set usually
//! consists of a few long runs of consecutive numbers. The set is stored as
//! a sorted vector of inclusive runs: membership and successor queries are a
//! binary search over runs, and appending the next number in sequence only
//! widens the last run.
//!
//! The on-disk form is a delta encoding of the same runs, so a dense set of
//! a million numbers costs a handful of bytes.

use std::io::{Read, Write};

use parking_lot::RwLock;

use crate::codec::{expect_magic, require_varint, write_varint};
use crate::lattice::Lattice;
use crate::{InfinityError, Result};

/// Reserved identifier, never stored.
pub const MAX: u64 = u64::MAX;

const MAGIC: &[u8; 4] = b"NUM1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    low: u64,
    high: u64,
}

/// A thread-safe sorted set of identifiers.
///
/// Readers never observe a half-applied `add` or `remove`: every mutation
/// happens under the write lock.
#[derive(Debug, Default)]
pub struct Numbers {
    runs: RwLock<Vec<Run>>,
}

fn validate(id: u64) -> Result<()> {
    match id {
        0 => Err(InfinityError::InvalidArgument(
            "number 0 is reserved and can't be stored".into(),
        )),
        MAX => Err(InfinityError::InvalidArgument(format!(
            "number {MAX} is reserved and can't be stored"
        ))),
        _ => Ok(()),
    }
}

impl Numbers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id`. Returns `false` if it was already present.
    pub fn add(&self, id: u64) -> Result<bool> {
        validate(id)?;
        let mut runs = self.runs.write();
        let idx = runs.partition_point(|run| run.high < id);
        if idx < runs.len() && runs[idx].low <= id {
            return Ok(false);
        }
        let joins_left = idx > 0 && runs[idx - 1].high + 1 == id;
        let joins_right = idx < runs.len() && runs[idx].low == id + 1;
        match (joins_left, joins_right) {
            (true, true) => {
                runs[idx - 1].high = runs[idx].high;
                runs.remove(idx);
            }
            (true, false) => runs[idx - 1].high = id,
            (false, true) => runs[idx].low = id,
            (false, false) => runs.insert(idx, Run { low: id, high: id }),
        }
        Ok(true)
    }

    /// Removes `id`. Returns `false` if it was not present.
    pub fn remove(&self, id: u64) -> Result<bool> {
        validate(id)?;
        let mut runs = self.runs.write();
        let idx = runs.partition_point(|run| run.high < id);
        if idx == runs.len() || runs[idx].low > id {
            return Ok(false);
        }
        let run = runs[idx];
        if run.low == run.high {
            runs.remove(idx);
        } else if id == run.low {
            runs[idx].low += 1;
        } else if id == run.high {
            runs[idx].high -= 1;
        } else {
            runs[idx].high = id - 1;
            runs.insert(
                idx + 1,
                Run {
                    low: id + 1,
                    high: run.high,
                },
            );
        }
        Ok(true)
    }

    /// Greatest stored identifier strictly below `ceiling`.
    pub fn next(&self, ceiling: u64) -> Option<u64> {
        if ceiling <= 1 {
            return None;
        }
        let target = ceiling - 1;
        let runs = self.runs.read();
        let idx = runs.partition_point(|run| run.low <= target);
        if idx == 0 {
            return None;
        }
        Some(runs[idx - 1].high.min(target))
    }

    pub fn clear(&self) {
        self.runs.write().clear();
    }

    pub fn contains(&self, id: u64) -> bool {
        let runs = self.runs.read();
        let idx = runs.partition_point(|run| run.high < id);
        idx < runs.len() && runs[idx].low <= id
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    pub fn len(&self) -> u64 {
        self.runs
            .read()
            .iter()
            .map(|run| run.high - run.low + 1)
            .sum()
    }

    /// In-memory footprint in bytes.
    pub fn sizeof(&self) -> u64 {
        (self.runs.read().len() * std::mem::size_of::<Run>()) as u64
    }

    /// Snapshot of the members, highest first.
    pub fn iter(&self) -> impl Iterator<Item = u64> {
        let runs = self.runs.read().clone();
        runs.into_iter()
            .rev()
            .flat_map(|run| (run.low..=run.high).rev())
    }

    /// Skip digest of the current members.
    pub fn lattice(&self) -> Lattice {
        let runs = self.runs.read();
        let capacity = runs.last().map(|run| run.high).unwrap_or(0);
        let mut lattice = Lattice::new(capacity);
        for run in runs.iter() {
            lattice.set_range(run.low, run.high);
        }
        lattice
    }

    /// Writes the set: header, run count, then for every run the gap from
    /// the previous run's end and the run length.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        let runs = self.runs.read();
        out.write_all(MAGIC)?;
        write_varint(out, runs.len() as u64)?;
        let mut previous = 0u64;
        for run in runs.iter() {
            write_varint(out, run.low - previous)?;
            write_varint(out, run.high - run.low)?;
            previous = run.high;
        }
        Ok(())
    }

    /// Replaces the contents with a set written by [`Numbers::save`].
    ///
    /// The stream is fully validated before anything is replaced, so a
    /// corrupted stream leaves the set unchanged.
    pub fn load<R: Read>(&self, input: &mut R) -> Result<()> {
        expect_magic(input, MAGIC)?;
        let count = require_varint(input)?;
        let mut loaded = Vec::with_capacity(count.min(1 << 16) as usize);
        let mut previous = 0u64;
        for _ in 0..count {
            let gap = require_varint(input)?;
            let length = require_varint(input)?;
            if gap == 0 || (!loaded.is_empty() && gap < 2) {
                return Err(InfinityError::Corrupted(format!(
                    "invalid order of numbers after {previous}"
                )));
            }
            let low = previous
                .checked_add(gap)
                .ok_or_else(|| InfinityError::Corrupted("number overflow".into()))?;
            let high = low
                .checked_add(length)
                .filter(|high| *high < MAX)
                .ok_or_else(|| InfinityError::Corrupted("number overflow".into()))?;
            loaded.push(Run { low, high });
            previous = high;
        }
        *self.runs.write() = loaded;
        Ok(())
    }
}

impl Clone for Numbers {
    fn clone(&self) -> Self {
        Self {
            runs: RwLock::new(self.runs.read().clone()),
        }
    }
}

impl FromIterator<u64> for Numbers {
    /// Builds a set, silently skipping the reserved identifiers.
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        let numbers = Numbers::new();
        for id in iter {
            if validate(id).is_ok() {
                let _ = numbers.add(id);
            }
        }
        numbers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::sync::Arc;

    fn restored(numbers: &Numbers) -> Numbers {
        let mut buf = Vec::new();
        numbers.save(&mut buf).unwrap();
        let back = Numbers::new();
        back.load(&mut Cursor::new(buf)).unwrap();
        back
    }

    #[test]
    fn rejects_reserved_numbers() {
        let numbers = Numbers::new();
        for id in [0, MAX] {
            assert!(matches!(
                numbers.add(id),
                Err(InfinityError::InvalidArgument(_))
            ));
            assert!(matches!(
                numbers.remove(id),
                Err(InfinityError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn next_on_empty_set_is_none() {
        let numbers = Numbers::new();
        for ceiling in [0, 1, 2, 1_000, MAX] {
            assert_eq!(numbers.next(ceiling), None);
        }
    }

    #[test]
    fn adds_and_removes_odd_samples() {
        let numbers = Numbers::new();
        for id in [9, 7, 5, 3, 1] {
            assert!(numbers.add(id).unwrap());
        }
        assert_eq!(numbers.next(8), Some(7));
        assert_eq!(numbers.next(7), Some(5));
        for id in [9, 7, 5, 3, 1] {
            assert!(numbers.remove(id).unwrap());
        }
        assert!(numbers.is_empty());
        for id in [9, 7, 5, 3, 1] {
            assert_eq!(numbers.next(id + 1), None, "{id} must be gone");
        }
    }

    #[test]
    fn consecutive_numbers_collapse_into_runs() {
        let numbers = Numbers::new();
        for id in 1..=1_000 {
            numbers.add(id).unwrap();
        }
        assert_eq!(numbers.sizeof(), std::mem::size_of::<Run>() as u64);
        assert_eq!(numbers.len(), 1_000);
        assert_eq!(numbers.next(501), Some(500));
        assert_eq!(numbers.next(MAX), Some(1_000));
    }

    #[test]
    fn reverse_order_insertion_builds_the_same_runs() {
        let ascending = Numbers::new();
        let descending = Numbers::new();
        for id in [4u64, 5, 6, 7, 8, 9] {
            ascending.add(id).unwrap();
        }
        for id in [9u64, 8, 7, 6, 5, 4] {
            descending.add(id).unwrap();
        }
        assert_eq!(ascending.iter().collect::<Vec<_>>(), vec![9, 8, 7, 6, 5, 4]);
        assert_eq!(ascending.sizeof(), descending.sizeof());
    }

    #[test]
    fn removing_from_the_middle_splits_a_run() {
        let numbers: Numbers = [19u64, 18, 17, 16, 5, 4, 3, 2].into_iter().collect();
        numbers.remove(17).unwrap();
        assert_eq!(numbers.next(18), Some(16));
        assert_eq!(numbers.next(17), Some(16));
        assert_eq!(numbers.next(16), Some(5));
        assert_eq!(
            numbers.iter().collect::<Vec<_>>(),
            vec![19, 18, 16, 5, 4, 3, 2]
        );
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let numbers = Numbers::new();
        assert!(numbers.add(42).unwrap());
        assert!(!numbers.add(42).unwrap(), "second add is a no-op");
        assert!(numbers.remove(42).unwrap());
        assert!(!numbers.remove(42).unwrap(), "second remove is a no-op");
        assert_ne!(numbers.next(43), Some(42));
    }

    #[test]
    fn saves_and_restores_fifty_thousand_in_a_row() {
        let numbers = Numbers::new();
        for id in 1..=50_000 {
            numbers.add(id).unwrap();
        }
        let back = restored(&numbers);
        assert_eq!(back.len(), 50_000);
        assert_eq!(back.next(25_001), Some(25_000));
    }

    #[test]
    fn load_rejects_corrupted_streams() {
        let numbers: Numbers = [3u64, 7].into_iter().collect();
        let mut buf = Vec::new();
        numbers.save(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let target: Numbers = [100u64].into_iter().collect();
        let err = target.load(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, InfinityError::Corrupted(_)), "got {err:?}");
        assert!(target.contains(100), "failed load must not clobber");

        let mut zero_gap = Vec::new();
        zero_gap.extend_from_slice(MAGIC);
        zero_gap.extend_from_slice(&[1, 0, 0]);
        assert!(Numbers::new().load(&mut Cursor::new(zero_gap)).is_err());
    }

    #[test]
    fn lattice_covers_every_member() {
        let numbers: Numbers = [1u64, 2, 3, 700, 90_000].into_iter().collect();
        let lattice = numbers.lattice();
        for id in numbers.iter() {
            assert!(lattice.maybe(id));
        }
        assert!(!lattice.maybe(5_000));
    }

    #[test]
    fn concurrent_readers_see_consistent_state() {
        let numbers = Arc::new(Numbers::new());
        let writer = {
            let numbers = Arc::clone(&numbers);
            std::thread::spawn(move || {
                for id in 1..=10_000u64 {
                    numbers.add(id * 2).unwrap();
                }
            })
        };
        let reader = {
            let numbers = Arc::clone(&numbers);
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    if let Some(found) = numbers.next(MAX) {
                        assert_eq!(found % 2, 0);
                    }
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(numbers.len(), 10_000);
    }

    proptest! {
        #[test]
        fn round_trip_preserves_next_answers(
            ops in proptest::collection::vec((any::<bool>(), 1u64..400), 0..300),
        ) {
            let numbers = Numbers::new();
            for (add, id) in ops {
                if add {
                    numbers.add(id).unwrap();
                } else {
                    numbers.remove(id).unwrap();
                }
            }
            let back = restored(&numbers);
            for ceiling in 0..=401u64 {
                prop_assert_eq!(numbers.next(ceiling), back.next(ceiling));
            }
        }
    }
}
