//! Device-facing control surface.
//!
//! Two small traits decouple the engine from the platform binding:
//! [`Doorbell`] is the submission side (a register write after `tail`
//! advances), [`FenceQuery`] is the completion side (a privileged counter
//! query, optionally a kernel-blocking wait). They are separate objects on
//! purpose — the fence path must never contend with the submission path.
//!
//! Some host runtimes submit through a callback instead of (or in addition
//! to) the ring. Which path a submission takes is an explicit, ordered
//! [`SubmitPathPolicy`] rather than inferred behavior: paths are tried in a
//! fixed preference order, an unavailable or failing path falls through to
//! the next, and if no path accepts, the submission fails — the engine
//! never pretends a rejected submission completed.

use std::time::Duration;

use lyra_protocol::ring::SubmitDesc;

use crate::error::TransportError;

/// Submission-side control: notify the device that `tail` advanced.
pub trait Doorbell: Send {
    fn ring_doorbell(&mut self) -> Result<(), TransportError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FenceCounters {
    pub last_submitted: u64,
    pub completed: u64,
}

/// Outcome of a transport-level blocking fence wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockingWait {
    Completed,
    TimedOut,
    /// The transport has no blocking primitive; callers fall back to
    /// polling.
    Unsupported,
}

/// Completion-side control: privileged fence queries.
pub trait FenceQuery: Send {
    /// Read the device's fence counters. Expensive — callers throttle it.
    fn query_fence_counters(&mut self) -> Result<FenceCounters, TransportError>;

    /// Block until `fence` completes or `timeout` elapses, if the transport
    /// has a primitive for it (cheapest for the waiter: no guest-side
    /// polling).
    fn wait_fence_blocking(
        &mut self,
        _fence: u64,
        _timeout: Duration,
    ) -> Result<BlockingWait, TransportError> {
        Ok(BlockingWait::Unsupported)
    }
}

/// A finalized submission handed to a callback path: the descriptor plus the
/// stream bytes it points at.
pub type SubmitCallback =
    Box<dyn FnMut(&SubmitDesc, &[u8]) -> Result<(), TransportError> + Send>;

/// Optional descriptor-free submission paths offered by the host runtime.
#[derive(Default)]
pub struct SubmitCallbacks {
    /// Preferred for present-flagged submissions.
    pub present: Option<SubmitCallback>,
    /// General-purpose submission callback.
    pub render: Option<SubmitCallback>,
}

impl std::fmt::Debug for SubmitCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitCallbacks")
            .field("present", &self.present.is_some())
            .field("render", &self.render.is_some())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitPath {
    PresentCallback,
    RenderCallback,
    Ring,
}

/// Ordered submit-path preference.
#[derive(Clone, Debug)]
pub struct SubmitPathPolicy {
    order: Vec<SubmitPath>,
}

impl Default for SubmitPathPolicy {
    fn default() -> Self {
        Self {
            order: vec![
                SubmitPath::PresentCallback,
                SubmitPath::RenderCallback,
                SubmitPath::Ring,
            ],
        }
    }
}

impl SubmitPathPolicy {
    pub fn new(order: Vec<SubmitPath>) -> Self {
        Self { order }
    }

    /// Paths to try for one submission, in order. The present callback only
    /// applies to present-flagged submissions.
    pub fn paths(&self, present: bool) -> impl Iterator<Item = SubmitPath> + '_ {
        self.order
            .iter()
            .copied()
            .filter(move |p| present || *p != SubmitPath::PresentCallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_prefers_present_then_render_then_ring() {
        let policy = SubmitPathPolicy::default();
        assert_eq!(
            policy.paths(true).collect::<Vec<_>>(),
            vec![
                SubmitPath::PresentCallback,
                SubmitPath::RenderCallback,
                SubmitPath::Ring
            ]
        );
    }

    #[test]
    fn non_present_submissions_skip_the_present_callback() {
        let policy = SubmitPathPolicy::default();
        assert_eq!(
            policy.paths(false).collect::<Vec<_>>(),
            vec![SubmitPath::RenderCallback, SubmitPath::Ring]
        );
    }

    #[test]
    fn custom_order_is_honored() {
        let policy = SubmitPathPolicy::new(vec![SubmitPath::Ring]);
        assert_eq!(
            policy.paths(true).collect::<Vec<_>>(),
            vec![SubmitPath::Ring]
        );
    }
}
