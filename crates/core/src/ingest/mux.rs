//! Worker pool applying notices in the background.
//!
//! Every submitted notice counts against each of its dependency keys until
//! a worker has applied it. The estimated time to completion for a set of
//! keys is the largest such count times the recent mean processing time,
//! spread over the workers. Zero means every notice touching those keys
//! has been applied.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::indexer::Apply;
use super::notice::Notice;
use super::stash::Stash;
use crate::retry::Retry;
use crate::{InfinityError, Result};

/// Processing times kept for the rolling mean.
const WINDOW: usize = 100;

const POLL: Duration = Duration::from_millis(100);

struct Task {
    notice: Notice,
    deps: BTreeSet<String>,
}

struct Shared {
    applier: Arc<dyn Apply>,
    stash: Arc<Stash>,
    retry: Retry,
    threads: usize,
    running: AtomicBool,
    waiting: Mutex<HashMap<String, usize>>,
    durations: Mutex<VecDeque<Duration>>,
}

impl Shared {
    fn enqueue(&self, deps: &BTreeSet<String>) {
        let mut waiting = self.waiting.lock();
        for dep in deps {
            *waiting.entry(dep.clone()).or_insert(0) += 1;
        }
    }

    fn dequeue(&self, deps: &BTreeSet<String>) {
        let mut waiting = self.waiting.lock();
        for dep in deps {
            if let Some(count) = waiting.get_mut(dep) {
                *count -= 1;
                if *count == 0 {
                    waiting.remove(dep);
                }
            }
        }
    }

    fn mean(&self) -> Duration {
        let durations = self.durations.lock();
        if durations.is_empty() {
            return Duration::from_millis(1);
        }
        durations.iter().sum::<Duration>() / durations.len() as u32
    }

    fn process(&self, task: Task) {
        let started = Instant::now();
        let applied = self.retry.run(
            task.notice.kind(),
            || self.applier.apply(&task.notice),
            |e| matches!(e, InfinityError::Storage(_) | InfinityError::Io(_)),
        );
        match applied {
            Ok(()) => {
                if let Err(e) = self.stash.remove(&task.notice) {
                    warn!(error = %e, "failed to mark notice done");
                }
                let elapsed = started.elapsed();
                let mut durations = self.durations.lock();
                if durations.len() == WINDOW {
                    durations.pop_front();
                }
                durations.push_back(elapsed);
                debug!(kind = task.notice.kind(), elapsed_us = elapsed.as_micros() as u64, "notice processed");
            }
            // The stash keeps the notice, so it is retried on the next open.
            Err(e) => error!(kind = task.notice.kind(), error = %e, "notice dropped after retries"),
        }
        self.dequeue(&task.deps);
    }

    fn work(&self, receiver: Receiver<Task>) {
        while self.running.load(Ordering::Acquire) {
            match receiver.recv_timeout(POLL) {
                Ok(task) => self.process(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

pub struct Mux {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Mux {
    /// Starts `threads` workers applying notices with `applier`.
    pub fn start(
        applier: Arc<dyn Apply>,
        stash: Arc<Stash>,
        threads: usize,
        retry: Retry,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(InfinityError::InvalidArgument(
                "at least one worker is required".into(),
            ));
        }
        let shared = Arc::new(Shared {
            applier,
            stash,
            retry,
            threads,
            running: AtomicBool::new(true),
            waiting: Mutex::new(HashMap::new()),
            durations: Mutex::new(VecDeque::with_capacity(WINDOW)),
        });
        let (sender, receiver) = unbounded();
        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let shared = Arc::clone(&shared);
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("infinity-mux-{n}"))
                .spawn(move || shared.work(receiver))?;
            workers.push(handle);
        }
        info!(threads, "mux started");
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queues `notice` and returns its dependency keys.
    pub fn submit(&self, notice: Notice) -> Result<BTreeSet<String>> {
        let deps = notice.deps();
        if deps.is_empty() {
            return Err(InfinityError::InvalidArgument(format!(
                "{} notice has no dependencies",
                notice.kind()
            )));
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(InfinityError::Closed);
        };
        self.shared.enqueue(&deps);
        let task = Task {
            notice,
            deps: deps.clone(),
        };
        if sender.send(task).is_err() {
            self.shared.dequeue(&deps);
            return Err(InfinityError::Closed);
        }
        Ok(deps)
    }

    /// Estimated milliseconds until every notice touching `keys` is
    /// applied.
    pub fn eta<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> u64 {
        let pending = {
            let waiting = self.shared.waiting.lock();
            keys.into_iter()
                .filter_map(|key| waiting.get(key).copied())
                .max()
                .unwrap_or(0)
        };
        if pending == 0 {
            return 0;
        }
        let total = self.shared.mean() * pending as u32 / self.shared.threads as u32;
        (total.as_millis() as u64).max(1)
    }

    /// Notices queued or in flight, counted once per dependency key.
    pub fn backlog(&self) -> usize {
        self.shared.waiting.lock().values().sum()
    }

    /// Stops accepting notices, lets the workers drain the queue and waits
    /// up to `timeout` for them. Workers still busy after that are told to
    /// stop after their current notice.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        drop(self.sender.lock().take());
        let deadline = Instant::now() + timeout;
        let mut workers = std::mem::take(&mut *self.workers.lock());
        while workers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        self.shared.running.store(false, Ordering::Release);
        let stuck = workers.iter().filter(|w| !w.is_finished()).count();
        if stuck > 0 {
            warn!(stuck, "mux workers still busy at close, leaving them to the stash");
        }
        for worker in workers.drain(..).filter(|w| w.is_finished()) {
            if worker.join().is_err() {
                error!("mux worker panicked");
            }
        }
        info!("mux closed");
        Ok(())
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        drop(self.sender.lock().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::notice::samples::{bout, posted};
    use std::sync::atomic::AtomicUsize;

    struct Slow {
        applied: AtomicUsize,
        delay: Duration,
    }

    impl Apply for Slow {
        fn apply(&self, _notice: &Notice) -> Result<()> {
            thread::sleep(self.delay);
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl Apply for Failing {
        fn apply(&self, _notice: &Notice) -> Result<()> {
            Err(InfinityError::Storage("disk on fire".into()))
        }
    }

    fn quick() -> Retry {
        Retry {
            attempts: 2,
            initial: Duration::from_millis(1),
            cap: Duration::from_millis(1),
        }
    }

    fn wait_for(mux: &Mux, keys: &[&str]) {
        let mut total = 0;
        while mux.eta(keys.iter().copied()) != 0 {
            thread::sleep(Duration::from_millis(1));
            total += 1;
            assert!(total < 5_000, "time out");
        }
    }

    #[test]
    fn eta_reaches_zero_once_notices_are_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let stash = Arc::new(Stash::open(tmp.path()).unwrap());
        let slow = Arc::new(Slow {
            applied: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
        });
        let mux = Mux::start(slow.clone(), Arc::clone(&stash), 2, quick()).unwrap();
        let mut keys = BTreeSet::new();
        for n in 1..=6 {
            let notice = posted(n, bout(55, &["urn:test:jeff"]), "urn:test:walter", "hi");
            stash.add(&notice).unwrap();
            keys = mux.submit(notice).unwrap();
        }
        assert!(keys.contains("urn:test:jeff"));
        assert!(mux.eta(["urn:test:jeff"]) > 0, "work is pending");
        assert_eq!(mux.eta(["urn:test:nobody"]), 0);

        wait_for(&mux, &["urn:test:jeff", "urn:test:walter"]);
        assert_eq!(slow.applied.load(Ordering::SeqCst), 6);
        assert!(stash.pending().unwrap().is_empty(), "applied notices are done");
        mux.close(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn failed_notices_stay_in_the_stash() {
        let tmp = tempfile::tempdir().unwrap();
        let stash = Arc::new(Stash::open(tmp.path()).unwrap());
        let mux = Mux::start(Arc::new(Failing), Arc::clone(&stash), 1, quick()).unwrap();
        let notice = posted(1, bout(55, &["urn:test:jeff"]), "urn:test:jeff", "hi");
        stash.add(&notice).unwrap();
        mux.submit(notice.clone()).unwrap();
        wait_for(&mux, &["urn:test:jeff"]);
        assert_eq!(stash.pending().unwrap(), vec![notice]);
        mux.close(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn close_drains_the_queue_and_refuses_new_work() {
        let tmp = tempfile::tempdir().unwrap();
        let stash = Arc::new(Stash::open(tmp.path()).unwrap());
        let slow = Arc::new(Slow {
            applied: AtomicUsize::new(0),
            delay: Duration::from_millis(5),
        });
        let mux = Mux::start(slow.clone(), stash, 3, quick()).unwrap();
        for n in 1..=10 {
            mux.submit(posted(n, bout(55, &["urn:test:jeff"]), "urn:test:jeff", "hi"))
                .unwrap();
        }
        mux.close(Duration::from_secs(10)).unwrap();
        assert_eq!(slow.applied.load(Ordering::SeqCst), 10);
        assert!(matches!(
            mux.submit(posted(11, bout(55, &["urn:test:jeff"]), "urn:test:jeff", "hi")),
            Err(InfinityError::Closed)
        ));
    }

    #[test]
    fn notices_without_dependencies_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let stash = Arc::new(Stash::open(tmp.path()).unwrap());
        let mux = Mux::start(Arc::new(Failing), stash, 1, quick()).unwrap();
        let err = mux
            .submit(posted(1, bout(55, &[]), "", "hi"))
            .unwrap_err();
        assert!(matches!(err, InfinityError::InvalidArgument(_)), "got {err:?}");
        assert!(Mux::start(Arc::new(Failing), Arc::new(Stash::open(tmp.path()).unwrap()), 0, quick()).is_err());
    }
}
