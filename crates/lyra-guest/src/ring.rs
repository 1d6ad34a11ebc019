//! Ring producer.
//!
//! The guest owns `tail`; the device owns `head`. Both are free-running
//! 32-bit counters — never masked in storage — and the occupied slot for
//! index `i` is `i & (entry_count - 1)`. The produce order is fixed by the
//! protocol: write the descriptor into the slot, issue a release barrier,
//! advance `tail`, then ring the doorbell. Signaling before the descriptor
//! is fully written is a protocol violation the device may observe as
//! corrupt data.

use std::sync::atomic::{fence, Ordering};

use thiserror::Error;

use lyra_mem::MemoryBus;
use lyra_protocol::ring::{
    RingHeader, SubmitDesc, WireError, RING_HEAD_OFFSET, RING_TAIL_OFFSET,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error(transparent)]
    Wire(#[from] WireError),
    /// `tail - head == entry_count`; the producer must let the device drain.
    #[error("ring is full ({entry_count} entries outstanding)")]
    Full { entry_count: u32 },
    /// `tail - head > entry_count` can only mean a corrupted header.
    #[error("ring counters are corrupt (head {head}, tail {tail})")]
    CorruptCounters { head: u32, tail: u32 },
}

#[derive(Debug)]
pub struct RingProducer {
    gpa: u64,
    entry_count: u32,
    entry_stride_bytes: u32,
    tail: u32,
}

impl RingProducer {
    /// Initialize a fresh ring at `gpa` and adopt it as producer.
    pub fn create(
        mem: &mut dyn MemoryBus,
        gpa: u64,
        entry_count: u32,
    ) -> Result<Self, RingError> {
        let header = RingHeader::for_entry_count(entry_count);
        header.validate()?;

        let mut buf = [0u8; RingHeader::SIZE_BYTES];
        header.encode(&mut buf)?;
        mem.write_physical(gpa, &buf);

        Ok(Self {
            gpa,
            entry_count: header.entry_count,
            entry_stride_bytes: header.entry_stride_bytes,
            tail: header.tail,
        })
    }

    /// Adopt an existing ring, validating the header before trusting it.
    pub fn open(
        mem: &mut dyn MemoryBus,
        gpa: u64,
        region_size_bytes: u32,
    ) -> Result<Self, RingError> {
        let mut buf = [0u8; RingHeader::SIZE_BYTES];
        mem.read_physical(gpa, &mut buf);
        let header = RingHeader::decode(&buf)?;
        header.validate_in_region(region_size_bytes)?;

        Ok(Self {
            gpa,
            entry_count: header.entry_count,
            entry_stride_bytes: header.entry_stride_bytes,
            tail: header.tail,
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Producer-side tail (free-running).
    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Consumer-side head, re-read from shared memory.
    pub fn head(&self, mem: &mut dyn MemoryBus) -> u32 {
        mem.read_u32(self.gpa + RING_HEAD_OFFSET as u64)
    }

    /// Slot the next produced entry will occupy.
    pub fn next_slot(&self) -> u32 {
        self.tail & (self.entry_count - 1)
    }

    pub fn slot_gpa(&self, slot: u32) -> u64 {
        self.gpa
            + RingHeader::SIZE_BYTES as u64
            + (slot & (self.entry_count - 1)) as u64 * self.entry_stride_bytes as u64
    }

    /// Entries the device has not yet consumed.
    pub fn in_flight(&self, mem: &mut dyn MemoryBus) -> Result<u32, RingError> {
        let head = self.head(mem);
        let used = self.tail.wrapping_sub(head);
        if used > self.entry_count {
            return Err(RingError::CorruptCounters {
                head,
                tail: self.tail,
            });
        }
        Ok(used)
    }

    pub fn has_space(&self, mem: &mut dyn MemoryBus) -> Result<bool, RingError> {
        Ok(self.in_flight(mem)? < self.entry_count)
    }

    /// Produce one descriptor. Returns the slot it landed in; the caller
    /// rings the doorbell afterwards.
    pub fn push(&mut self, mem: &mut dyn MemoryBus, desc: &SubmitDesc) -> Result<u32, RingError> {
        desc.validate(self.entry_stride_bytes)?;
        if self.in_flight(mem)? == self.entry_count {
            return Err(RingError::Full {
                entry_count: self.entry_count,
            });
        }

        let slot = self.next_slot();
        let mut buf = [0u8; SubmitDesc::SIZE_BYTES];
        desc.encode(&mut buf)?;
        mem.write_physical(self.slot_gpa(slot), &buf);

        // The descriptor must be globally visible before the consumer can
        // observe the advanced tail.
        fence(Ordering::Release);

        self.tail = self.tail.wrapping_add(1);
        mem.write_u32(self.gpa + RING_TAIL_OFFSET as u64, self.tail);
        Ok(slot)
    }

    /// Hang recovery: discard everything the device has not consumed by
    /// pulling `head` up to `tail`. Only valid once the device is known to
    /// be stopped or wedged — under normal operation `head` is
    /// consumer-owned.
    pub fn reset_after_timeout(&self, mem: &mut dyn MemoryBus) {
        mem.write_u32(self.gpa + RING_HEAD_OFFSET as u64, self.tail);
    }
}
