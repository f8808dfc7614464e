//! Leases on long-lived read resources.
//!
//! A lazy result sequence may be abandoned by its consumer without being
//! dropped (kept in a struct, parked behind a slow client). Every resource
//! such a sequence holds is leased from a [`Cursors`] pool. Dropping the
//! lease releases it immediately; a lease idle for longer than the pool's
//! ttl is reclaimed by the next sweep, and the holder sees it as gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

struct Slot<T> {
    resource: Option<T>,
    touched: Instant,
}

pub struct Cursors<T> {
    ttl: Duration,
    leases: Mutex<Leases<T>>,
}

struct Leases<T> {
    next: u64,
    open: HashMap<u64, Arc<Mutex<Slot<T>>>>,
}

impl<T> Cursors<T> {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            leases: Mutex::new(Leases {
                next: 0,
                open: HashMap::new(),
            }),
        })
    }

    /// Registers `resource`, sweeping expired leases first.
    pub fn lease(self: &Arc<Self>, resource: T) -> Lease<T> {
        self.sweep();
        let slot = Arc::new(Mutex::new(Slot {
            resource: Some(resource),
            touched: Instant::now(),
        }));
        let mut leases = self.leases.lock();
        let id = leases.next;
        leases.next += 1;
        leases.open.insert(id, Arc::clone(&slot));
        Lease {
            id,
            slot,
            pool: Arc::clone(self),
        }
    }

    /// Reclaims every lease idle for longer than the ttl. Returns how many
    /// were reclaimed.
    pub fn sweep(&self) -> usize {
        let mut leases = self.leases.lock();
        let ttl = self.ttl;
        let before = leases.open.len();
        leases.open.retain(|id, slot| {
            let mut slot = slot.lock();
            if slot.touched.elapsed() > ttl {
                warn!(lease = id, ?ttl, "reclaiming idle cursor");
                slot.resource = None;
                false
            } else {
                true
            }
        });
        before - leases.open.len()
    }

    /// Leases currently holding a resource.
    pub fn active(&self) -> usize {
        self.leases.lock().open.len()
    }
}

/// Exclusive handle on a pooled resource.
pub struct Lease<T> {
    id: u64,
    slot: Arc<Mutex<Slot<T>>>,
    pool: Arc<Cursors<T>>,
}

impl<T> Lease<T> {
    /// Runs `f` on the resource, or returns `None` if it was reclaimed.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let mut slot = self.slot.lock();
        slot.touched = Instant::now();
        slot.resource.as_ref().map(f)
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.pool.leases.lock().open.remove(&self.id);
        self.slot.lock().resource = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_a_lease_releases_it() {
        let pool = Cursors::new(Duration::from_secs(60));
        let lease = pool.lease(String::from("txn"));
        assert_eq!(pool.active(), 1);
        assert_eq!(lease.with(|s| s.len()), Some(3));
        drop(lease);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn idle_leases_are_reclaimed_by_sweep() {
        let pool = Cursors::new(Duration::from_millis(5));
        let lease = pool.lease(7u32);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.sweep(), 1);
        assert_eq!(lease.with(|v| *v), None, "reclaimed resource is gone");
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn new_leases_trigger_a_sweep() {
        let pool = Cursors::new(Duration::from_millis(5));
        let stale = pool.lease(1u32);
        std::thread::sleep(Duration::from_millis(20));
        let fresh = pool.lease(2u32);
        assert_eq!(pool.active(), 1);
        assert_eq!(stale.with(|v| *v), None);
        assert_eq!(fresh.with(|v| *v), Some(2));
    }
}
