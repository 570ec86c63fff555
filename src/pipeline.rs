//! The write pipeline: turns incoming write requests into log packs, drives
//! them through pack/ack/data stages, and enforces back-pressure and the
//! freeze/melt control surface.
//!
//! The three-stage pipeline: absorb into an in-memory pack, then commit
//! (write header + payload, FLUSH), then make the result visible. The four
//! work pools and the sleepable freeze gate generalise a "don't let a new
//! writer start while one epoch is being sealed" guard into named worker
//! pools backed by `crossbeam_channel`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lock::sleepable::SleepableLock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One named worker pool: a bounded job queue drained by a fixed number of
/// threads. `normal` carries the pack/ack/data stages for ordinary writes;
/// `non_reentrant` serialises operations that must not overlap a normal
/// write (clear_log, resize); `unbounded` runs tasks that may block for a
/// while (snapshot sync); `misc` is everything else (control-surface
/// queries).
struct WorkPool {
    // `Option` so `Drop` can close the channel (by taking and dropping the
    // sender) before joining workers; a plain field would only be dropped
    // *after* `Drop::drop` returns, deadlocking the join below.
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkPool {
    fn new(name: &'static str, n_threads: usize, queue_depth: usize) -> Self {
        let (tx, rx) = bounded::<Job>(queue_depth);
        let workers = (0..n_threads)
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("walb-{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .as_ref()
            .expect("pool not yet shut down")
            .send(job)
            .map_err(|_| Error::Busy)
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

/// The freeze state machine:
/// `Melted` accepts writes; `Frozen` rejects new writes indefinitely;
/// `FrozenWithTimeout` rejects writes until `deadline_ms`, after which the
/// pipeline melts itself automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    Melted,
    Frozen,
    FrozenWithTimeout { deadline_ms: u64 },
}

impl FreezeState {
    pub fn is_frozen(&self, now_ms: u64) -> bool {
        match self {
            FreezeState::Melted => false,
            FreezeState::Frozen => true,
            FreezeState::FrozenWithTimeout { deadline_ms } => now_ms < *deadline_ms,
        }
    }
}

/// Sentinel for "the queue is not currently over its high watermark".
const NOT_BLOCKED: u64 = u64::MAX;

struct Backpressure {
    pending_bytes: AtomicU64,
    /// Timestamp (per the injected `Clock`) at which the queue first went
    /// over the high watermark since it last cleared, or `NOT_BLOCKED`.
    over_since_ms: AtomicU64,
    max_bytes: u64,
    min_bytes: u64,
}

impl Backpressure {
    fn new(max_mb: u64, min_mb: u64) -> Self {
        Self {
            pending_bytes: AtomicU64::new(0),
            over_since_ms: AtomicU64::new(NOT_BLOCKED),
            max_bytes: max_mb * 1024 * 1024,
            min_bytes: min_mb * 1024 * 1024,
        }
    }

    fn over_high_watermark(&self) -> bool {
        self.pending_bytes.load(Ordering::Acquire) > self.max_bytes
    }

    fn at_or_below_low_watermark(&self) -> bool {
        self.pending_bytes.load(Ordering::Acquire) <= self.min_bytes
    }

    fn add(&self, n: u64) {
        self.pending_bytes.fetch_add(n, Ordering::AcqRel);
    }

    fn sub(&self, n: u64) {
        self.pending_bytes.fetch_sub(n, Ordering::AcqRel);
        if self.at_or_below_low_watermark() {
            self.over_since_ms.store(NOT_BLOCKED, Ordering::Release);
        }
    }

    /// Records `now` as the start of a blocked period if one isn't already
    /// tracked, and returns how long (in ms) the queue has been blocked.
    fn note_blocked(&self, now_ms: u64) -> u64 {
        let _ = self
            .over_since_ms
            .compare_exchange(NOT_BLOCKED, now_ms, Ordering::AcqRel, Ordering::Acquire);
        now_ms.saturating_sub(self.over_since_ms.load(Ordering::Acquire))
    }

    fn clear_blocked(&self) {
        self.over_since_ms.store(NOT_BLOCKED, Ordering::Release);
    }
}

pub struct IoCore {
    normal: WorkPool,
    non_reentrant: WorkPool,
    unbounded: WorkPool,
    misc: WorkPool,
    freeze: SleepableLock<FreezeState>,
    backpressure: Backpressure,
    queue_stop_timeout_ms: u64,
    read_only: Arc<AtomicBool>,
}

impl IoCore {
    pub fn new(
        n_io_bulk: usize,
        max_pending_mb: u64,
        min_pending_mb: u64,
        queue_stop_timeout_ms: u64,
        read_only: Arc<AtomicBool>,
    ) -> Self {
        Self {
            normal: WorkPool::new("normal", n_io_bulk.max(1), 4096),
            non_reentrant: WorkPool::new("non-reentrant", 1, 64),
            unbounded: WorkPool::new("unbounded", 2, 4096),
            misc: WorkPool::new("misc", 2, 1024),
            freeze: SleepableLock::new(FreezeState::Melted),
            backpressure: Backpressure::new(max_pending_mb, min_pending_mb),
            queue_stop_timeout_ms,
            read_only,
        }
    }

    pub fn freeze_state(&self, clock: &dyn Clock) -> FreezeState {
        let state = *self.freeze.lock();
        if let FreezeState::FrozenWithTimeout { deadline_ms } = state {
            if clock.now_millis() >= deadline_ms {
                *self.freeze.lock() = FreezeState::Melted;
                return FreezeState::Melted;
            }
        }
        state
    }

    pub fn is_frozen(&self, clock: &dyn Clock) -> bool {
        self.freeze_state(clock).is_frozen(clock.now_millis())
    }

    pub fn freeze(&self) {
        *self.freeze.lock() = FreezeState::Frozen;
    }

    pub fn freeze_with_timeout(&self, clock: &dyn Clock, timeout_ms: u64) {
        *self.freeze.lock() = FreezeState::FrozenWithTimeout {
            deadline_ms: clock.now_millis() + timeout_ms,
        };
    }

    pub fn melt(&self) {
        let mut guard = self.freeze.lock();
        *guard = FreezeState::Melted;
        guard.wakeup();
    }

    /// The freeze/back-pressure/read-only gate shared by `check_admission`
    /// and `admit_write`. Has no side effect beyond the blocked-timer and
    /// read-only latch bookkeeping that must happen regardless of whether
    /// the caller is about to reserve resources or just probing.
    fn check_gate(&self, clock: &dyn Clock) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }

        if self.is_frozen(clock) || self.backpressure.over_high_watermark() {
            let blocked_for = self.backpressure.note_blocked(clock.now_millis());
            if blocked_for >= self.queue_stop_timeout_ms {
                self.read_only.store(true, Ordering::Release);
                log::error!("admit_write: queue_stop_timeout_ms elapsed, engine now read-only");
                return Err(Error::ReadOnly);
            }
            return Err(Error::Busy);
        }
        self.backpressure.clear_blocked();
        Ok(())
    }

    /// Probes the same gate `admit_write` will apply, without reserving any
    /// bytes or submitting a job. Callers that must reserve LSIDs or other
    /// resources before building a job should check this first, so a
    /// `Busy`/`ReadOnly` result doesn't leave those reservations stranded.
    pub fn check_admission(&self, clock: &dyn Clock) -> Result<()> {
        self.check_gate(clock)
    }

    /// Admits a write of `n_bytes` into the pipeline, or reports why it
    /// can't be admitted yet (back-pressure).
    ///
    /// While the engine is frozen or the queue is over its high watermark,
    /// this returns `Error::Busy` so the caller can retry after a pause; it
    /// does not block internally (a blocking engine call instead retries
    /// this in a loop with real sleeps between attempts — see
    /// `engine::Engine::write`). Once the queue has stayed blocked for
    /// `queue_stop_timeout_ms`, the engine latches read-only and every
    /// subsequent call (through this one and onward) fails with
    /// `Error::ReadOnly` instead.
    ///
    /// On success, submits `job` to the normal pool and returns once it has
    /// been *accepted* (not completed); `job` must call `release(n_bytes)`
    /// on this `IoCore` when the write's data has actually reached the log
    /// device.
    pub fn admit_write(&self, clock: &dyn Clock, n_bytes: u64, job: Job) -> Result<()> {
        self.check_gate(clock)?;
        self.backpressure.add(n_bytes);
        self.normal.submit(job)
    }

    /// Called by a completed write's job once its bytes are no longer
    /// pending, dropping the in-flight count back toward the low watermark.
    pub fn release(&self, n_bytes: u64) {
        self.backpressure.sub(n_bytes);
    }

    pub fn is_under_low_watermark(&self) -> bool {
        self.backpressure.at_or_below_low_watermark()
    }

    pub fn spawn_non_reentrant(&self, job: Job) -> Result<()> {
        self.non_reentrant.submit(job)
    }

    pub fn spawn_unbounded(&self, job: Job) -> Result<()> {
        self.unbounded.submit(job)
    }

    pub fn spawn_misc(&self, job: Job) -> Result<()> {
        self.misc.submit(job)
    }
}
