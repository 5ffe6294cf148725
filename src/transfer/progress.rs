//! Aggregate progress tracking shared by every blob of a session

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, Ordering};

/// Progress callback: `(completed, total)` in bytes
pub type ProgressFn = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Shared byte counter for one upload or download session.
///
/// `completed` moves backwards when a failed attempt is rolled back, so the
/// callback sees a non-monotonic sequence. Once the session succeeds the last
/// reported value equals `total`.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

struct Inner {
    total: i64,
    completed: AtomicI64,
    callback: Option<ProgressFn>,
}

impl ProgressTracker {
    pub fn new(total: u64, callback: Option<ProgressFn>) -> Self {
        Self {
            inner: Arc::new(Inner {
                total: total as i64,
                completed: AtomicI64::new(0),
                callback,
            }),
        }
    }

    /// Adjust the completed count; negative deltas roll back
    pub fn add(&self, delta: i64) {
        let completed = self.inner.completed.fetch_add(delta, Ordering::SeqCst) + delta;
        if let Some(callback) = &self.inner.callback {
            callback(completed, self.inner.total);
        }
    }

    pub fn completed(&self) -> i64 {
        self.inner.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> i64 {
        self.inner.total
    }

    /// Ledger for one attempt of one blob
    pub fn attempt(&self) -> AttemptProgress {
        AttemptProgress::with_parent(self.clone(), None)
    }
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("completed", &self.completed())
            .field("total", &self.total())
            .finish()
    }
}

/// Bytes credited to the session by a single transfer attempt.
///
/// Clones share the same ledger, so a counting body handed to the HTTP client
/// and the retry loop that owns the attempt see the same amount. A rolled back
/// ledger is sealed: a body the client keeps draining after its response
/// arrived can no longer move the session counter.
#[derive(Clone, Debug)]
pub struct AttemptProgress {
    tracker: ProgressTracker,
    ledger: Arc<Mutex<Ledger>>,
    parent: Option<Arc<Mutex<Ledger>>>,
}

#[derive(Debug, Default)]
struct Ledger {
    credited: i64,
    sealed: bool,
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(|e| e.into_inner())
}

impl AttemptProgress {
    fn with_parent(tracker: ProgressTracker, parent: Option<Arc<Mutex<Ledger>>>) -> Self {
        Self {
            tracker,
            ledger: Arc::new(Mutex::new(Ledger::default())),
            parent,
        }
    }

    /// Ledger for one send within this attempt. Its bytes also count toward
    /// this ledger, so rolling back the attempt covers the live send, and
    /// sealing the attempt silences every send it spawned.
    pub fn send(&self) -> AttemptProgress {
        Self::with_parent(self.tracker.clone(), Some(self.ledger.clone()))
    }

    pub fn add(&self, n: u64) {
        let mut parent = self.parent.as_deref().map(lock);
        let mut own = lock(&self.ledger);
        if own.sealed || parent.as_ref().is_some_and(|p| p.sealed) {
            return;
        }
        own.credited += n as i64;
        if let Some(parent) = parent.as_mut() {
            parent.credited += n as i64;
        }
        self.tracker.add(n as i64);
    }

    pub fn credited(&self) -> i64 {
        lock(&self.ledger).credited
    }

    pub fn is_sealed(&self) -> bool {
        lock(&self.ledger).sealed
    }

    /// Undo everything this ledger credited and ignore later additions;
    /// returns the amount removed
    pub fn rollback(&self) -> i64 {
        let mut parent = self.parent.as_deref().map(lock);
        let mut own = lock(&self.ledger);
        own.sealed = true;
        let credited = std::mem::take(&mut own.credited);
        // A sealed parent already removed these bytes with its own
        if parent.as_ref().is_some_and(|p| p.sealed) {
            return 0;
        }
        if let Some(parent) = parent.as_mut() {
            parent.credited -= credited;
        }
        if credited != 0 {
            self.tracker.add(-credited);
        }
        credited
    }
}
