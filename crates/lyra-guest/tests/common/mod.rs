//! Mock device-side consumer.
//!
//! Drives the exact consumer half of the transport protocol against shared
//! memory: validates the ring header, walks `head` to `tail`, validates
//! every descriptor, parses the command stream and allocation table each
//! one references, advances `head`, and stamps completions into the fence
//! page. Tests inspect what it consumed.

// Each test binary uses its own subset of this harness.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lyra_guest::error::TransportError;
use lyra_guest::transport::{BlockingWait, Doorbell, FenceCounters, FenceQuery};
use lyra_mem::{MemoryBus, SharedMemory};
use lyra_protocol::abi::ABI_VERSION;
use lyra_protocol::cmd::CmdStreamIter;
use lyra_protocol::ring::{
    AllocTable, FencePage, RingHeader, SubmitDesc, FENCE_PAGE_MAGIC, RING_HEAD_OFFSET,
};

#[derive(Clone, Debug)]
pub struct ConsumedSubmission {
    pub slot: u32,
    pub fence: u64,
    pub flags: u32,
    pub opcodes: Vec<u32>,
    /// Body bytes per packet (padding included).
    pub bodies: Vec<Vec<u8>>,
    pub alloc_ids: Vec<u32>,
}

struct Inner {
    mem: SharedMemory,
    ring_gpa: u64,
    fence_page_gpa: u64,
    stalled: bool,
    auto_complete: bool,
    completed: u64,
    last_seen_fence: u64,
    submissions: Vec<ConsumedSubmission>,
}

impl Inner {
    fn stamp_fence_page(&mut self) {
        let mut buf = [0u8; FencePage::SIZE_BYTES];
        FencePage {
            magic: FENCE_PAGE_MAGIC,
            abi_version: ABI_VERSION,
            completed_fence: self.completed,
        }
        .encode(&mut buf)
        .unwrap();
        self.mem.write_physical(self.fence_page_gpa, &buf);
    }

    fn process(&mut self) {
        if self.stalled {
            return;
        }
        let mut hdr_buf = [0u8; RingHeader::SIZE_BYTES];
        self.mem.read_physical(self.ring_gpa, &mut hdr_buf);
        let header = RingHeader::decode(&hdr_buf).unwrap();
        header.validate().expect("producer wrote a valid ring header");

        let mut head = header.head;
        while head != header.tail {
            let slot = header.slot_index(head);
            let slot_gpa = self.ring_gpa
                + RingHeader::SIZE_BYTES as u64
                + slot as u64 * header.entry_stride_bytes as u64;

            let mut desc_buf = [0u8; SubmitDesc::SIZE_BYTES];
            self.mem.read_physical(slot_gpa, &mut desc_buf);
            let desc = SubmitDesc::decode(&desc_buf).unwrap();
            desc.validate(header.entry_stride_bytes)
                .expect("producer wrote a valid descriptor");

            let mut stream = vec![0u8; desc.cmd_size_bytes as usize];
            self.mem.read_physical(desc.cmd_gpa, &mut stream);
            let mut opcodes = Vec::new();
            let mut bodies = Vec::new();
            for packet in CmdStreamIter::new(&stream).expect("valid stream header") {
                let packet = packet.expect("valid packet framing");
                opcodes.push(packet.opcode);
                bodies.push(packet.body().to_vec());
            }

            let alloc_ids = if desc.alloc_table_size_bytes != 0 {
                let mut table = vec![0u8; desc.alloc_table_size_bytes as usize];
                self.mem.read_physical(desc.alloc_table_gpa, &mut table);
                AllocTable::decode(&table)
                    .expect("valid allocation table")
                    .entries
                    .iter()
                    .map(|e| e.alloc_id)
                    .collect()
            } else {
                Vec::new()
            };

            self.submissions.push(ConsumedSubmission {
                slot,
                fence: desc.signal_fence,
                flags: desc.flags,
                opcodes,
                bodies,
                alloc_ids,
            });
            self.last_seen_fence = self.last_seen_fence.max(desc.signal_fence);
            if self.auto_complete {
                self.completed = self.completed.max(desc.signal_fence);
            }

            head = head.wrapping_add(1);
            self.mem
                .write_u32(self.ring_gpa + RING_HEAD_OFFSET as u64, head);
        }
        if self.auto_complete {
            self.stamp_fence_page();
        }
    }
}

/// Cheap-clone handle; doorbell and fence-query impls share the state.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Mutex<Inner>>,
}

impl MockDevice {
    pub fn new(mem: SharedMemory, ring_gpa: u64, fence_page_gpa: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                mem,
                ring_gpa,
                fence_page_gpa,
                stalled: false,
                auto_complete: true,
                completed: 0,
                last_seen_fence: 0,
                submissions: Vec::new(),
            })),
        }
    }

    /// Stop consuming; doorbells are ignored until resumed.
    pub fn set_stalled(&self, stalled: bool) {
        self.inner.lock().unwrap().stalled = stalled;
    }

    /// Consume descriptors without completing their fences; completion then
    /// comes from [`MockDevice::complete_up_to`].
    pub fn set_auto_complete(&self, auto: bool) {
        self.inner.lock().unwrap().auto_complete = auto;
    }

    pub fn pump(&self) {
        self.inner.lock().unwrap().process();
    }

    pub fn complete_up_to(&self, fence: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.completed = inner.completed.max(fence);
        inner.stamp_fence_page();
    }

    /// Advance the completed counter without writing the fence page; only
    /// the query path can observe it.
    pub fn complete_silently(&self, fence: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.completed = inner.completed.max(fence);
    }

    pub fn completed(&self) -> u64 {
        self.inner.lock().unwrap().completed
    }

    pub fn submissions(&self) -> Vec<ConsumedSubmission> {
        self.inner.lock().unwrap().submissions.clone()
    }
}

impl Doorbell for MockDevice {
    fn ring_doorbell(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().process();
        Ok(())
    }
}

impl FenceQuery for MockDevice {
    fn query_fence_counters(&mut self) -> Result<FenceCounters, TransportError> {
        let inner = self.inner.lock().unwrap();
        Ok(FenceCounters {
            last_submitted: inner.last_seen_fence,
            completed: inner.completed,
        })
    }

    fn wait_fence_blocking(
        &mut self,
        fence: u64,
        _timeout: Duration,
    ) -> Result<BlockingWait, TransportError> {
        let inner = self.inner.lock().unwrap();
        Ok(if inner.completed >= fence {
            BlockingWait::Completed
        } else {
            BlockingWait::TimedOut
        })
    }
}

/// A doorbell wired to nothing; for tests that pump the device explicitly.
pub struct SilentDoorbell;

impl Doorbell for SilentDoorbell {
    fn ring_doorbell(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
