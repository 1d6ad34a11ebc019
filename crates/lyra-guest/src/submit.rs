//! Submission coordination.
//!
//! One coordinator owns the encoder, the allocation tracker, the ring
//! producer, and the staging regions for one device context, and moves
//! through `Idle → Encoding → Finalizing → Submitted → Retired` per
//! submission. Everything here runs under the context's submission mutex;
//! ring-slot writes and allocation-table writes must appear atomic to the
//! consumer.
//!
//! Capacity conditions are resolved here, invisibly to callers: an append
//! that does not fit flushes the current submission and retries exactly
//! once; a multi-resource operation pre-scans its identity set and flushes
//! at most once up front. Infinite overflow retries are a bug, not a
//! strategy.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use lyra_mem::MemoryBus;
use lyra_protocol::cmd::{opcode, CmdBody};
use lyra_protocol::ring::{SubmitDesc, SubmitFlags};

use crate::alloc_table::{AccessKind, AllocTracker, ResourceBinding, TrackOutcome};
use crate::config::DeviceConfig;
use crate::context::DeviceLayout;
use crate::encoder::CmdStreamEncoder;
use crate::error::{SubmitError, TransportError};
use crate::fence::{FenceTracker, FenceWaitResult};
use crate::log::{SubmissionLog, SubmissionRecord};
use crate::pace::{PaceOutcome, PresentPacer};
use crate::ring::{RingError, RingProducer};
use crate::transport::{Doorbell, SubmitCallbacks, SubmitPath, SubmitPathPolicy};

use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitKind {
    Render,
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No packets appended this round.
    Idle,
    /// At least one packet appended.
    Encoding,
    /// Stream being stamped and staged.
    Finalizing,
    /// Handed to the transport, acceptance pending.
    Submitted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { fence: u64 },
    /// Frame latency bound reached and the caller asked not to wait.
    WouldBlock,
}

pub struct SubmissionCoordinator<M: MemoryBus> {
    mem: M,
    doorbell: Box<dyn Doorbell>,
    callbacks: SubmitCallbacks,
    policy: SubmitPathPolicy,
    encoder: CmdStreamEncoder,
    tracker: AllocTracker,
    ring: RingProducer,
    layout: DeviceLayout,
    fences: Arc<FenceTracker>,
    pacer: PresentPacer,
    log: SubmissionLog,
    state: CoordinatorState,
    /// Free-running count of accepted submissions; selects the staging
    /// region (`index % region_count`) independently of which path carried
    /// the submission.
    submission_index: u64,
    /// Fence reserved for the in-progress round. A failed hand-off keeps
    /// it, so the retry signals the same value and fences stay dense in
    /// submission order.
    pending_fence: Option<u64>,
    /// Fence of the submission that last used each staging region. A region
    /// is reused only after that fence completes — the device may still be
    /// reading it until then.
    region_fences: Vec<u64>,
    context_id: u32,
    engine_id: u32,
    no_irq: bool,
    busy_wait_budget: Duration,
}

impl<M: MemoryBus> SubmissionCoordinator<M> {
    pub(crate) fn new(
        mem: M,
        doorbell: Box<dyn Doorbell>,
        ring: RingProducer,
        layout: DeviceLayout,
        fences: Arc<FenceTracker>,
        config: &DeviceConfig,
    ) -> Self {
        let region_count = ring.entry_count() as usize;
        Self {
            mem,
            doorbell,
            callbacks: SubmitCallbacks::default(),
            policy: SubmitPathPolicy::default(),
            encoder: CmdStreamEncoder::with_capacity(config.cmd_buffer_bytes as usize),
            tracker: AllocTracker::new(config.effective_alloc_slots()),
            ring,
            layout,
            fences,
            pacer: PresentPacer::new(config.clamped_frame_latency(), config.busy_wait_budget),
            log: SubmissionLog::new(),
            state: CoordinatorState::Idle,
            submission_index: 0,
            pending_fence: None,
            region_fences: vec![0; region_count],
            context_id: config.context_id,
            engine_id: config.engine_id,
            no_irq: config.poll_completions,
            busy_wait_budget: config.busy_wait_budget,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn set_callbacks(&mut self, callbacks: SubmitCallbacks) {
        self.callbacks = callbacks;
    }

    pub fn set_policy(&mut self, policy: SubmitPathPolicy) {
        self.policy = policy;
    }

    pub fn log_snapshot(&self) -> Vec<SubmissionRecord> {
        self.log.recent()
    }

    /* ----------------------------- Encoding ------------------------------ */

    fn usable_stream_bytes(&self) -> usize {
        self.encoder.capacity() - lyra_protocol::cmd::CmdStreamHeader::SIZE_BYTES
    }

    /// Make room for one packet: flush-and-retry, at most once.
    fn ensure_cmd_space(&mut self, packet_bytes: usize) -> Result<(), SubmitError> {
        if self.encoder.bytes_remaining() >= packet_bytes {
            return Ok(());
        }
        if !self.encoder.is_empty() {
            self.submit(SubmitKind::Render)?;
        }
        if self.encoder.bytes_remaining() >= packet_bytes {
            return Ok(());
        }
        Err(SubmitError::PacketTooLarge {
            packet_bytes,
            capacity_bytes: self.usable_stream_bytes(),
        })
    }

    pub fn append_fixed<T: CmdBody>(&mut self, op: u32, body: &T) -> Result<(), SubmitError> {
        let size = CmdStreamEncoder::packet_size_bytes(T::SIZE_BYTES, 0);
        self.ensure_cmd_space(size)?;
        match self.encoder.append_fixed(op, body) {
            Ok(()) => {
                self.state = CoordinatorState::Encoding;
                Ok(())
            }
            Err(_) => Err(SubmitError::PacketTooLarge {
                packet_bytes: size,
                capacity_bytes: self.usable_stream_bytes(),
            }),
        }
    }

    pub fn append_with_payload<T: CmdBody>(
        &mut self,
        op: u32,
        body: &T,
        payload: &[u8],
    ) -> Result<(), SubmitError> {
        let size = CmdStreamEncoder::packet_size_bytes(T::SIZE_BYTES, payload.len());
        self.ensure_cmd_space(size)?;
        match self.encoder.append_with_payload(op, body, payload) {
            Ok(()) => {
                self.state = CoordinatorState::Encoding;
                Ok(())
            }
            Err(_) => Err(SubmitError::PacketTooLarge {
                packet_bytes: size,
                capacity_bytes: self.usable_stream_bytes(),
            }),
        }
    }

    /* ----------------------- Allocation references ----------------------- */

    /// Track a single resource reference, splitting the submission at most
    /// once if the table is full.
    pub fn track(
        &mut self,
        binding: ResourceBinding,
        access: AccessKind,
    ) -> Result<u32, SubmitError> {
        match self.tracker.track(&binding, access)? {
            TrackOutcome::Slot(slot) => Ok(slot),
            TrackOutcome::NeedFlush => {
                self.submit(SubmitKind::Render)?;
                match self.tracker.track(&binding, access)? {
                    TrackOutcome::Slot(slot) => Ok(slot),
                    TrackOutcome::NeedFlush => Err(SubmitError::TooManyResources {
                        distinct: 1,
                        capacity: self.tracker.capacity(),
                    }),
                }
            }
        }
    }

    /// Track every reference of one logical operation.
    ///
    /// The whole identity set is pre-scanned first: either it fits the
    /// remaining capacity, or the current submission is flushed exactly once
    /// and the set goes into the fresh table. Tracking one-at-a-time and
    /// reacting to `NeedFlush` mid-sequence would strand the
    /// already-tracked identities in a submission that retires without the
    /// rest, so it is not offered.
    pub fn track_for_op(
        &mut self,
        refs: &[(ResourceBinding, AccessKind)],
    ) -> Result<Vec<u32>, SubmitError> {
        let bindings: Vec<ResourceBinding> = refs.iter().map(|(b, _)| *b).collect();
        if !self.tracker.fits(&bindings) {
            let distinct = AllocTracker::distinct_count(&bindings);
            if distinct > self.tracker.capacity() {
                return Err(SubmitError::TooManyResources {
                    distinct,
                    capacity: self.tracker.capacity(),
                });
            }
            self.submit(SubmitKind::Render)?;
        }

        let mut slots = Vec::with_capacity(refs.len());
        for (binding, access) in refs {
            match self.tracker.track(binding, *access)? {
                TrackOutcome::Slot(slot) => slots.push(slot),
                TrackOutcome::NeedFlush => {
                    return Err(SubmitError::TooManyResources {
                        distinct: AllocTracker::distinct_count(&bindings),
                        capacity: self.tracker.capacity(),
                    })
                }
            }
        }
        Ok(slots)
    }

    pub fn tracked_alloc_count(&self) -> u32 {
        self.tracker.len()
    }

    /* ----------------------------- Submission ----------------------------- */

    /// Flush the current stream, stamping an explicit flush marker when it
    /// fits. A flush of an empty stream is a no-op: polling callers must
    /// never force empty transport round trips.
    pub fn flush(&mut self) -> Result<u64, SubmitError> {
        if !self.encoder.is_empty() {
            let marker = CmdStreamEncoder::packet_size_bytes(0, 0);
            if self.encoder.bytes_remaining() >= marker {
                let _ = self.encoder.append_fixed(opcode::FLUSH, &());
            }
            // Too full for the marker: the submission boundary is already a
            // flush point.
        }
        self.submit(SubmitKind::Render)
    }

    /// Submit the current stream and return its fence.
    ///
    /// With nothing encoded and nothing tracked this is a no-op that still
    /// lets fence observers make progress and reports the last submitted
    /// fence. A round that tracked allocations but encoded no packets is
    /// submitted anyway (header-only stream plus its table) — a flush must
    /// never strand tracked identities.
    pub fn submit(&mut self, kind: SubmitKind) -> Result<u64, SubmitError> {
        if self.encoder.is_empty() && self.tracker.is_empty() {
            let _ = self.fences.poll_probes();
            return Ok(self.fences.last_submitted());
        }

        self.state = CoordinatorState::Finalizing;
        match self.submit_filled(kind) {
            Ok(fence) => {
                // Acceptance retires the round: recycle buffers for reuse.
                self.encoder.rewind();
                self.tracker.reset();
                self.state = CoordinatorState::Idle;
                Ok(fence)
            }
            Err(e) => {
                // The stream and table are intact; the caller may retry.
                self.state = CoordinatorState::Encoding;
                Err(e)
            }
        }
    }

    fn submit_filled(&mut self, kind: SubmitKind) -> Result<u64, SubmitError> {
        let region = (self.submission_index % self.region_fences.len() as u64) as u32;
        self.wait_region_retired(region)?;

        let cmd_gpa = self.layout.cmd_region_gpa(region);
        let cmd_size_bytes = {
            let stream = self.encoder.finalize();
            let len = stream.len() as u32;
            self.mem.write_physical(cmd_gpa, stream);
            len
        };

        let (alloc_table_gpa, alloc_table_size_bytes) = if self.tracker.is_empty() {
            (0, 0)
        } else {
            let gpa = self.layout.table_region_gpa(region);
            let len = self.tracker.snapshot_to(&mut self.mem, gpa);
            (gpa, len)
        };

        let fence = match self.pending_fence {
            Some(reserved) => reserved,
            None => {
                let reserved = self.fences.reserve_fence();
                self.pending_fence = Some(reserved);
                reserved
            }
        };
        let mut flags = match kind {
            SubmitKind::Render => SubmitFlags::empty(),
            SubmitKind::Present => SubmitFlags::PRESENT,
        };
        if self.no_irq {
            flags |= SubmitFlags::NO_IRQ;
        }
        let desc = SubmitDesc {
            desc_size_bytes: SubmitDesc::SIZE_BYTES as u32,
            flags: flags.bits(),
            context_id: self.context_id,
            engine_id: self.engine_id,
            cmd_gpa,
            cmd_size_bytes,
            alloc_table_gpa,
            alloc_table_size_bytes,
            signal_fence: fence,
        };

        self.hand_off(&desc, kind)?;
        self.state = CoordinatorState::Submitted;
        self.pending_fence = None;

        self.fences.note_submitted(fence);
        self.region_fences[region as usize] = fence;
        self.submission_index += 1;
        self.log.record(SubmissionRecord {
            fence,
            kind,
            cmd_bytes: cmd_size_bytes,
            alloc_entries: self.tracker.len(),
            at: Instant::now(),
        });
        debug!(
            fence,
            ?kind,
            cmd_bytes = cmd_size_bytes,
            alloc_entries = self.tracker.len(),
            "submission accepted"
        );
        Ok(fence)
    }

    /// Hand one finalized submission to the first accepting path.
    fn hand_off(&mut self, desc: &SubmitDesc, kind: SubmitKind) -> Result<(), SubmitError> {
        let present = kind == SubmitKind::Present;
        let paths: Vec<SubmitPath> = self.policy.paths(present).collect();

        let mut last_err: Option<TransportError> = None;
        for path in paths {
            match path {
                SubmitPath::PresentCallback => {
                    if let Some(cb) = self.callbacks.present.as_mut() {
                        match cb(desc, self.encoder.finalize()) {
                            Ok(()) => return Ok(()),
                            Err(e) => {
                                warn!(error = %e, "present callback rejected submission");
                                last_err = Some(e);
                            }
                        }
                    }
                }
                SubmitPath::RenderCallback => {
                    if let Some(cb) = self.callbacks.render.as_mut() {
                        match cb(desc, self.encoder.finalize()) {
                            Ok(()) => return Ok(()),
                            Err(e) => {
                                warn!(error = %e, "render callback rejected submission");
                                last_err = Some(e);
                            }
                        }
                    }
                }
                SubmitPath::Ring => {
                    self.push_with_busy_wait(desc)?;
                    self.doorbell.ring_doorbell()?;
                    return Ok(());
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::NoSubmitPath).into())
    }

    /// Produce into the ring, waiting (bounded) for the device to drain a
    /// full ring. A device that makes no progress within the budget is
    /// reported busy — never an unbounded stall.
    fn push_with_busy_wait(&mut self, desc: &SubmitDesc) -> Result<u32, SubmitError> {
        let deadline = Instant::now() + self.busy_wait_budget;
        loop {
            match self.ring.push(&mut self.mem, desc) {
                Ok(slot) => return Ok(slot),
                Err(RingError::Full { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::DeviceBusy {
                            waited_ms: self.busy_wait_budget.as_millis() as u64,
                        }
                        .into());
                    }
                    let _ = self.fences.poll_probes();
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(RingError::CorruptCounters { head, tail }) => {
                    return Err(SubmitError::RingCorrupt { head, tail });
                }
                Err(RingError::Wire(e)) => return Err(SubmitError::Protocol(e)),
            }
        }
    }

    /// Block (bounded) until the fence that last used `region` completes.
    fn wait_region_retired(&mut self, region: u32) -> Result<(), SubmitError> {
        let prev = self.region_fences[region as usize];
        if prev == 0 {
            return Ok(());
        }
        match self.fences.wait(prev, self.busy_wait_budget) {
            FenceWaitResult::Complete => Ok(()),
            FenceWaitResult::NotReady => Err(TransportError::DeviceBusy {
                waited_ms: self.busy_wait_budget.as_millis() as u64,
            }
            .into()),
            FenceWaitResult::Failed(e) => Err(e.into()),
        }
    }

    /* ------------------------------ Present ------------------------------- */

    /// Submit the current stream as a present, paced against the frame
    /// latency bound.
    pub fn submit_present(&mut self, dont_wait: bool) -> Result<PresentOutcome, SubmitError> {
        if self.encoder.is_empty() && self.tracker.is_empty() {
            let _ = self.fences.poll_probes();
            return Ok(PresentOutcome::Presented {
                fence: self.fences.last_submitted(),
            });
        }
        match self.pacer.throttle(&self.fences, dont_wait) {
            PaceOutcome::WouldBlock => Ok(PresentOutcome::WouldBlock),
            PaceOutcome::Ready => {
                let fence = self.submit(SubmitKind::Present)?;
                self.pacer.note_present(fence);
                Ok(PresentOutcome::Presented { fence })
            }
        }
    }

    /* ------------------------------ Recovery ------------------------------ */

    /// Hang recovery: discard unconsumed ring entries, force-complete every
    /// in-flight fence, and reset the encoding state. The device is assumed
    /// stopped; the fences are completed so no waiter hangs on work that
    /// will never finish.
    pub fn recover_from_timeout(&mut self) {
        warn!(
            last_submitted = self.fences.last_submitted(),
            completed = self.fences.completed(),
            "recovering from device timeout"
        );
        self.ring.reset_after_timeout(&mut self.mem);
        self.fences.observe_completed(self.fences.last_submitted());
        self.region_fences.fill(0);
        self.pending_fence = None;
        self.encoder.rewind();
        self.tracker.reset();
        self.state = CoordinatorState::Idle;
    }
}
