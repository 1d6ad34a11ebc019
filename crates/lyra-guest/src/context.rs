//! Device context: process-lifetime setup and the public surface.
//!
//! A context is created once per device (per engine) and owns everything
//! the transport shares with it: the submission ring, the fence page, and a
//! pool of staging regions — one command region and one table region per
//! ring slot. Command emission, resource tracking, and submission for one
//! context are serialized behind a single mutex; fence waits go straight to
//! the shared [`FenceTracker`] and never take it.
//!
//! Teardown is dropping the context: the shared memory ranges belong to
//! whoever mapped them, and the guest-local state needs no device
//! cooperation to die. A wedged device is handled before that point by
//! [`DeviceContext::recover_from_timeout`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lyra_mem::MemoryBus;
use lyra_protocol::cmd::CmdBody;
use lyra_protocol::ring::{FencePage, RingHeader, SubmitDesc};

use crate::alloc_table::{AccessKind, AllocTracker, ResourceBinding};
use crate::config::DeviceConfig;
use crate::error::SubmitError;
use crate::fence::{DeviceQueryProbe, FencePageProbe, FenceTracker, FenceWaitResult};
use crate::log::SubmissionRecord;
use crate::ring::{RingError, RingProducer};
use crate::submit::{
    CoordinatorState, PresentOutcome, SubmissionCoordinator, SubmitKind,
};
use crate::transport::{Doorbell, FenceQuery, SubmitCallbacks, SubmitPathPolicy};

const PAGE_SIZE: u64 = 4096;

const fn page_align(v: u64) -> u64 {
    (v + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

/// Placement of every shared structure a context owns, relative to one base
/// GPA.
#[derive(Clone, Debug)]
pub struct DeviceLayout {
    pub ring_gpa: u64,
    pub ring_size_bytes: u32,
    pub fence_page_gpa: u64,
    cmd_region_base: u64,
    cmd_region_bytes: u64,
    table_region_base: u64,
    table_region_bytes: u64,
    region_count: u32,
    total_bytes: u64,
}

impl DeviceLayout {
    pub fn compute(base_gpa: u64, config: &DeviceConfig) -> Self {
        let ring_size_bytes = RingHeader::required_size_bytes(
            config.ring_entry_count,
            SubmitDesc::SIZE_BYTES as u32,
        );
        let fence_page_gpa = page_align(base_gpa + ring_size_bytes);

        let cmd_region_base = page_align(fence_page_gpa + PAGE_SIZE);
        let cmd_region_bytes = page_align(config.cmd_buffer_bytes as u64);
        let region_count = config.ring_entry_count;

        let table_region_base =
            cmd_region_base + region_count as u64 * cmd_region_bytes;
        let table_region_bytes = page_align(
            AllocTracker::max_table_size_bytes(config.effective_alloc_slots()) as u64,
        );

        let end = table_region_base + region_count as u64 * table_region_bytes;
        Self {
            ring_gpa: base_gpa,
            ring_size_bytes: ring_size_bytes as u32,
            fence_page_gpa,
            cmd_region_base,
            cmd_region_bytes,
            table_region_base,
            table_region_bytes,
            region_count,
            total_bytes: end - base_gpa,
        }
    }

    pub fn region_count(&self) -> u32 {
        self.region_count
    }

    pub fn cmd_region_gpa(&self, region: u32) -> u64 {
        self.cmd_region_base + (region % self.region_count) as u64 * self.cmd_region_bytes
    }

    pub fn table_region_gpa(&self, region: u32) -> u64 {
        self.table_region_base + (region % self.region_count) as u64 * self.table_region_bytes
    }

    /// Bytes of shared memory the whole context occupies from its base.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

pub struct DeviceContext<M: MemoryBus + Send> {
    inner: Mutex<SubmissionCoordinator<M>>,
    fences: Arc<FenceTracker>,
    layout: DeviceLayout,
}

impl<M: MemoryBus + Clone + Send + 'static> DeviceContext<M> {
    /// Set up a context at `base_gpa`: write a fresh ring header, zero the
    /// fence page, and wire the fence-page probe.
    ///
    /// `mem` is a cheap-clone handle to the shared region; the fence probe
    /// keeps its own clone so waiters never touch the submission mutex.
    pub fn create(
        mem: M,
        doorbell: Box<dyn Doorbell>,
        config: DeviceConfig,
        base_gpa: u64,
    ) -> Result<Self, SubmitError> {
        config.validate()?;
        let layout = DeviceLayout::compute(base_gpa, &config);

        let fences = Arc::new(FenceTracker::new(config.fence_query_throttle));
        fences.add_probe(Box::new(FencePageProbe::new(
            mem.clone(),
            layout.fence_page_gpa,
        )));

        let mut setup_mem = mem.clone();
        let ring = RingProducer::create(&mut setup_mem, layout.ring_gpa, config.ring_entry_count)
            .map_err(|e| match e {
                RingError::Wire(w) => SubmitError::Protocol(w),
                RingError::Full { .. } => SubmitError::RingCorrupt { head: 0, tail: 0 },
                RingError::CorruptCounters { head, tail } => {
                    SubmitError::RingCorrupt { head, tail }
                }
            })?;
        // The fence page starts zeroed; the device stamps its header when it
        // attaches. The probe treats a never-valid page as absent.
        setup_mem.write_physical(
            layout.fence_page_gpa,
            &[0u8; FencePage::SIZE_BYTES],
        );

        let coordinator = SubmissionCoordinator::new(
            mem,
            doorbell,
            ring,
            layout.clone(),
            Arc::clone(&fences),
            &config,
        );

        Ok(Self {
            inner: Mutex::new(coordinator),
            fences,
            layout,
        })
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    /// Install the host runtime's submission callbacks.
    pub fn set_submit_callbacks(&self, callbacks: SubmitCallbacks) {
        self.inner.lock().unwrap().set_callbacks(callbacks);
    }

    /// Override the submit-path preference order.
    pub fn set_submit_path_policy(&self, policy: SubmitPathPolicy) {
        self.inner.lock().unwrap().set_policy(policy);
    }

    /// Attach the privileged fence query as a completion probe, optionally
    /// with a second transport handle used for blocking waits.
    pub fn attach_fence_query(
        &self,
        query: Box<dyn FenceQuery>,
        blocking: Option<Box<dyn FenceQuery>>,
    ) {
        self.fences.add_probe(Box::new(DeviceQueryProbe::new(query)));
        if let Some(blocking) = blocking {
            self.fences.set_blocking_waiter(blocking);
        }
    }

    /* ------------------------------ Emission ------------------------------ */

    pub fn append_fixed<T: CmdBody>(&self, op: u32, body: &T) -> Result<(), SubmitError> {
        self.inner.lock().unwrap().append_fixed(op, body)
    }

    pub fn append_with_payload<T: CmdBody>(
        &self,
        op: u32,
        body: &T,
        payload: &[u8],
    ) -> Result<(), SubmitError> {
        self.inner
            .lock()
            .unwrap()
            .append_with_payload(op, body, payload)
    }

    pub fn track(
        &self,
        binding: ResourceBinding,
        access: AccessKind,
    ) -> Result<u32, SubmitError> {
        self.inner.lock().unwrap().track(binding, access)
    }

    pub fn track_for_op(
        &self,
        refs: &[(ResourceBinding, AccessKind)],
    ) -> Result<Vec<u32>, SubmitError> {
        self.inner.lock().unwrap().track_for_op(refs)
    }

    /* ----------------------------- Submission ----------------------------- */

    pub fn submit(&self, kind: SubmitKind) -> Result<u64, SubmitError> {
        self.inner.lock().unwrap().submit(kind)
    }

    pub fn flush(&self) -> Result<u64, SubmitError> {
        self.inner.lock().unwrap().flush()
    }

    pub fn submit_present(&self, dont_wait: bool) -> Result<PresentOutcome, SubmitError> {
        self.inner.lock().unwrap().submit_present(dont_wait)
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.inner.lock().unwrap().state()
    }

    pub fn submission_log(&self) -> Vec<SubmissionRecord> {
        self.inner.lock().unwrap().log_snapshot()
    }

    /* ------------------------------- Fences ------------------------------- */

    pub fn fences(&self) -> Arc<FenceTracker> {
        Arc::clone(&self.fences)
    }

    /// Wait for a fence. Runs entirely against the fence tracker — a
    /// waiting thread never contends with a thread that is encoding.
    pub fn wait(&self, fence: u64, timeout: Duration) -> FenceWaitResult {
        self.fences.wait(fence, timeout)
    }

    /* ------------------------------ Recovery ------------------------------ */

    /// Reset after a device hang: discard unconsumed ring entries and
    /// force-complete all in-flight fences so no waiter stalls on work that
    /// will never finish.
    pub fn recover_from_timeout(&self) {
        self.inner.lock().unwrap().recover_from_timeout();
    }
}
