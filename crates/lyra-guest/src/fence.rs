//! Fence tracking.
//!
//! Three guest-local counters per engine: `next_fence` (allocator),
//! `last_submitted_fence`, `completed_fence`. All advance monotonically —
//! every update is `new = max(old, candidate)` — and a strict increase of
//! the completed counter wakes every parked waiter.
//!
//! Completion can be observed through several independent, racing channels:
//! the device-written fence page, a privileged counter query, a
//! transport-blocking wait. Each is modeled as a probe; the tracker tries
//! them in a fixed preference order (cheapest first) and tolerates any
//! subset being unavailable at runtime. All observations funnel into the
//! same monotonic counter, so a stale or slow channel can never regress
//! state, only fail to advance it.
//!
//! Synchronization here is deliberately decoupled from the submission mutex:
//! callers polling or waiting on fences must not contend with the thread
//! that is encoding commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use lyra_mem::MemoryBus;
use lyra_protocol::ring::FencePage;

use crate::error::TransportError;
use crate::transport::{BlockingWait, FenceQuery};

/// Result of a completion wait.
///
/// `NotReady` (the bounded wait expired) is always distinct from `Failed`
/// (the transport itself reported a hard failure). A timeout is recoverable;
/// the caller decides whether to retry, give up, or shed work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FenceWaitResult {
    Complete,
    NotReady,
    Failed(TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeCost {
    /// A shared-memory read; fine to issue on every poll.
    Passive,
    /// A privileged query; rate-limited regardless of poll frequency.
    Privileged,
}

#[derive(Debug)]
pub enum ProbePoll {
    Observed(u64),
    /// Nothing to report this round (source not ready or self-disabled).
    Unavailable,
    Failed(TransportError),
}

/// One completion-signal source.
pub trait CompletionProbe: Send {
    fn cost(&self) -> ProbeCost;
    fn poll(&mut self) -> ProbePoll;
}

/// Reads the device-written fence page.
///
/// The page lives in memory the device writes; it is validated before
/// trust. Until the device has stamped a valid header the probe just
/// reports unavailable (a fresh page is zeroed); if a previously valid page
/// turns invalid, the probe disables itself — that memory can no longer be
/// believed.
pub struct FencePageProbe<M: MemoryBus + Send> {
    mem: M,
    gpa: u64,
    seen_valid: bool,
    disabled: bool,
}

impl<M: MemoryBus + Send> FencePageProbe<M> {
    pub fn new(mem: M, gpa: u64) -> Self {
        Self {
            mem,
            gpa,
            seen_valid: false,
            disabled: false,
        }
    }
}

impl<M: MemoryBus + Send> CompletionProbe for FencePageProbe<M> {
    fn cost(&self) -> ProbeCost {
        ProbeCost::Passive
    }

    fn poll(&mut self) -> ProbePoll {
        if self.disabled {
            return ProbePoll::Unavailable;
        }
        let mut buf = [0u8; FencePage::SIZE_BYTES];
        self.mem.read_physical(self.gpa, &mut buf);
        let page = match FencePage::decode(&buf) {
            Ok(page) => page,
            Err(_) => return ProbePoll::Unavailable,
        };
        if page.validate().is_err() {
            if self.seen_valid {
                warn!(gpa = self.gpa, "fence page went invalid; disabling probe");
                self.disabled = true;
            }
            return ProbePoll::Unavailable;
        }
        self.seen_valid = true;
        ProbePoll::Observed(page.completed_fence)
    }
}

/// Polls the privileged device fence query.
pub struct DeviceQueryProbe {
    query: Box<dyn FenceQuery>,
    disabled: bool,
}

impl DeviceQueryProbe {
    pub fn new(query: Box<dyn FenceQuery>) -> Self {
        Self {
            query,
            disabled: false,
        }
    }
}

impl CompletionProbe for DeviceQueryProbe {
    fn cost(&self) -> ProbeCost {
        ProbeCost::Privileged
    }

    fn poll(&mut self) -> ProbePoll {
        if self.disabled {
            return ProbePoll::Unavailable;
        }
        match self.query.query_fence_counters() {
            Ok(counters) => ProbePoll::Observed(counters.completed),
            Err(e) => {
                // A query transport that failed once is not retried; the
                // remaining probes keep completion flowing.
                self.disabled = true;
                ProbePoll::Failed(e)
            }
        }
    }
}

struct ProbeSet {
    probes: Vec<Box<dyn CompletionProbe>>,
    last_privileged_poll: Option<Instant>,
    throttle: Duration,
}

impl ProbeSet {
    /// Poll every probe in preference order, observing what they report.
    /// Privileged probes are skipped while inside the throttle window.
    /// Returns the first hard failure, after the full pass.
    fn poll(&mut self, observe: impl Fn(u64)) -> Result<(), TransportError> {
        let now = Instant::now();
        let allow_privileged = match self.last_privileged_poll {
            Some(at) => now.duration_since(at) >= self.throttle,
            None => true,
        };

        let mut failure = None;
        for probe in &mut self.probes {
            if probe.cost() == ProbeCost::Privileged {
                if !allow_privileged {
                    continue;
                }
                self.last_privileged_poll = Some(now);
            }
            match probe.poll() {
                ProbePoll::Observed(v) => observe(v),
                ProbePoll::Unavailable => {}
                ProbePoll::Failed(e) => {
                    warn!(error = %e, "completion probe failed");
                    failure.get_or_insert(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct FenceTracker {
    next_fence: AtomicU64,
    last_submitted: AtomicU64,
    completed: AtomicU64,
    wake: Mutex<()>,
    wake_cv: Condvar,
    probes: Mutex<ProbeSet>,
    /// Transport-blocking waits are serialized through here; a contended
    /// waiter falls back to polling instead of queueing.
    blocker: Mutex<Option<Box<dyn FenceQuery>>>,
}

impl std::fmt::Debug for FenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceTracker")
            .field("next_fence", &self.next_fence.load(Ordering::Relaxed))
            .field(
                "last_submitted",
                &self.last_submitted.load(Ordering::Relaxed),
            )
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}

impl FenceTracker {
    pub fn new(throttle: Duration) -> Self {
        Self {
            next_fence: AtomicU64::new(1),
            last_submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
            probes: Mutex::new(ProbeSet {
                probes: Vec::new(),
                last_privileged_poll: None,
                throttle,
            }),
            blocker: Mutex::new(None),
        }
    }

    /// Register a completion probe. Registration order is preference order;
    /// put the cheapest source first.
    pub fn add_probe(&self, probe: Box<dyn CompletionProbe>) {
        self.probes.lock().unwrap().probes.push(probe);
    }

    /// Install the transport used for blocking waits.
    pub fn set_blocking_waiter(&self, query: Box<dyn FenceQuery>) {
        *self.blocker.lock().unwrap() = Some(query);
    }

    /// Allocate the fence value for the next submission.
    pub fn reserve_fence(&self) -> u64 {
        self.next_fence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn note_submitted(&self, fence: u64) {
        self.last_submitted.fetch_max(fence, Ordering::AcqRel);
    }

    pub fn last_submitted(&self) -> u64 {
        self.last_submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Fold in a completion observation from any source. Advances, never
    /// regresses; a strict advance wakes all waiters.
    pub fn observe_completed(&self, observed: u64) {
        let prev = self.completed.fetch_max(observed, Ordering::AcqRel);
        if observed > prev {
            // Take the lock so a waiter between its check and its park
            // cannot miss the notification.
            let _guard = self.wake.lock().unwrap();
            self.wake_cv.notify_all();
        }
    }

    /// One probe pass: cheapest sources always, privileged sources at most
    /// once per throttle window.
    pub fn poll_probes(&self) -> Result<(), TransportError> {
        let mut set = self.probes.lock().unwrap();
        set.poll(|v| self.observe_completed(v))
    }

    /// Wait for `fence` to complete.
    ///
    /// `timeout == 0` never blocks: it answers from the cached counter and
    /// the cheap probes (plus the throttled query). A bounded wait first
    /// tries the transport's blocking primitive, then falls back to a
    /// poll-and-park loop until the deadline.
    pub fn wait(&self, fence: u64, timeout: Duration) -> FenceWaitResult {
        // Fence 0 predates all work and is trivially complete.
        if fence == 0 || self.completed() >= fence {
            return FenceWaitResult::Complete;
        }

        if timeout.is_zero() {
            let poll = self.poll_probes();
            if self.completed() >= fence {
                return FenceWaitResult::Complete;
            }
            return match poll {
                Ok(()) => FenceWaitResult::NotReady,
                Err(e) => FenceWaitResult::Failed(e),
            };
        }

        let deadline = Instant::now() + timeout;

        if let Some(result) = self.try_blocking_wait(fence, timeout) {
            match result {
                Ok(BlockingWait::Completed) => {
                    self.observe_completed(fence);
                    return FenceWaitResult::Complete;
                }
                Ok(BlockingWait::TimedOut) => {
                    // Fall through: one final poll below decides.
                }
                Ok(BlockingWait::Unsupported) => {}
                Err(_) => {
                    // The blocking primitive is gone; polling still works.
                }
            }
        }

        loop {
            let poll = self.poll_probes();
            if self.completed() >= fence {
                return FenceWaitResult::Complete;
            }
            if let Err(e) = poll {
                return FenceWaitResult::Failed(e);
            }
            let now = Instant::now();
            if now >= deadline {
                return FenceWaitResult::NotReady;
            }
            // Park briefly; an observe_completed from any thread wakes us
            // early, and the short cap keeps the probes ticking even when
            // nobody else is observing.
            let nap = (deadline - now).min(Duration::from_millis(1));
            let guard = self.wake.lock().unwrap();
            if self.completed() >= fence {
                return FenceWaitResult::Complete;
            }
            let _ = self.wake_cv.wait_timeout(guard, nap).unwrap();
        }
    }

    fn try_blocking_wait(
        &self,
        fence: u64,
        timeout: Duration,
    ) -> Option<Result<BlockingWait, TransportError>> {
        // Contended means someone else is already blocked on the transport;
        // polling is the better use of this thread.
        let mut guard = self.blocker.try_lock().ok()?;
        let waiter = guard.as_mut()?;
        let result = waiter.wait_fence_blocking(fence, timeout);
        if result.is_err() {
            warn!("blocking fence wait transport failed; dropping it");
            *guard = None;
        }
        Some(result)
    }
}
