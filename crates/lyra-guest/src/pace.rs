//! Present pacing.
//!
//! Bounds the number of in-flight presents to the configured frame latency.
//! When the bound is reached, the pacer waits (bounded) for the oldest
//! present fence to retire; a caller that asked not to wait gets
//! [`PaceOutcome::WouldBlock`] instead. If the bounded wait expires — a
//! wedged device — the oldest fence is dropped so presentation keeps making
//! forward progress; pacing accuracy is traded for liveness, never the
//! other way around.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::fence::{FenceTracker, FenceWaitResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaceOutcome {
    /// Under the latency bound; go ahead and present.
    Ready,
    /// At the bound and the caller asked not to wait.
    WouldBlock,
}

#[derive(Debug)]
pub struct PresentPacer {
    inflight: VecDeque<u64>,
    max_latency: usize,
    max_wait: Duration,
}

impl PresentPacer {
    pub fn new(max_latency: u32, max_wait: Duration) -> Self {
        Self {
            inflight: VecDeque::new(),
            max_latency: max_latency.clamp(1, 16) as usize,
            max_wait,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Register a submitted present fence.
    pub fn note_present(&mut self, fence: u64) {
        self.inflight.push_back(fence);
    }

    /// Drop every fence the device has already completed.
    pub fn retire_completed(&mut self, fences: &FenceTracker) {
        let completed = fences.completed();
        while self
            .inflight
            .front()
            .is_some_and(|&oldest| oldest <= completed)
        {
            self.inflight.pop_front();
        }
    }

    /// Gate one present against the latency bound.
    pub fn throttle(&mut self, fences: &FenceTracker, dont_wait: bool) -> PaceOutcome {
        let _ = fences.poll_probes();
        self.retire_completed(fences);

        if self.inflight.len() < self.max_latency {
            return PaceOutcome::Ready;
        }
        if dont_wait {
            return PaceOutcome::WouldBlock;
        }

        let deadline = Instant::now() + self.max_wait;
        while self.inflight.len() >= self.max_latency {
            let now = Instant::now();
            if now >= deadline {
                // Forward progress beats throttling accuracy under a hang.
                let dropped = self.inflight.pop_front();
                warn!(?dropped, "present pacing wait expired; dropping oldest fence");
                break;
            }
            let oldest = *self.inflight.front().expect("len checked above");
            let budget = deadline - now;
            match fences.wait(oldest, budget) {
                FenceWaitResult::Complete | FenceWaitResult::NotReady => {}
                FenceWaitResult::Failed(_) => {
                    // Completion reporting is gone; do not stall presents on
                    // it.
                    self.inflight.pop_front();
                    break;
                }
            }
            self.retire_completed(fences);
        }
        PaceOutcome::Ready
    }
}
