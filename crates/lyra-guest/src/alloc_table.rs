//! Per-submission allocation reference tracking.
//!
//! Commands reference memory by stable `alloc_id`, and every submission
//! carries a table resolving each referenced id to its current GPA and size.
//! The tracker deduplicates by identity — the same underlying allocation may
//! be reached through several aliasing handles within one submission (shared
//! resources opened by multiple processes), and it must occupy one slot, not
//! several.
//!
//! Capacity is bounded by the smaller of the device-advertised maximum and
//! the staging region the table is emitted into. When an insert would exceed
//! it, [`TrackOutcome::NeedFlush`] tells the caller to split the submission.
//! A multi-resource operation must check [`AllocTracker::fits`] for its
//! whole identity set *before* tracking anything: reacting to `NeedFlush`
//! halfway through a sequence would strand the already-tracked identities in
//! a submission that retires without the rest.

use std::collections::HashMap;

use lyra_protocol::ring::{AllocEntry, AllocFlags, AllocTableHeader};

use crate::error::SubmitError;
use lyra_mem::MemoryBus;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// One resource reference: the stable identity plus its current backing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceBinding {
    pub alloc_id: u32,
    pub gpa: u64,
    pub size_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Identity present (already or newly); this is its table slot.
    Slot(u32),
    /// Inserting would exceed capacity; flush the submission and retry
    /// against the fresh table.
    NeedFlush,
}

#[derive(Clone, Debug)]
struct Tracked {
    entry: AllocEntry,
}

#[derive(Debug)]
pub struct AllocTracker {
    capacity: u32,
    slots: Vec<Tracked>,
    by_id: HashMap<u32, u32>,
}

impl AllocTracker {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.len()
    }

    /// Wire size of the table as currently populated.
    pub fn table_size_bytes(&self) -> u32 {
        AllocTableHeader::SIZE_BYTES as u32 + self.len() * AllocEntry::SIZE_BYTES as u32
    }

    /// Wire size of a full-capacity table; staging regions are sized to it.
    pub fn max_table_size_bytes(capacity: u32) -> u32 {
        AllocTableHeader::SIZE_BYTES as u32 + capacity * AllocEntry::SIZE_BYTES as u32
    }

    pub fn reset(&mut self) {
        self.slots.clear();
        self.by_id.clear();
    }

    /// Track one reference. Re-tracking an identity returns its existing
    /// slot; a write access upgrades an entry that was read-only.
    pub fn track(
        &mut self,
        binding: &ResourceBinding,
        access: AccessKind,
    ) -> Result<TrackOutcome, SubmitError> {
        if binding.alloc_id == 0 {
            return Err(SubmitError::ReservedAllocId);
        }
        if binding.size_bytes == 0 {
            return Err(SubmitError::ZeroSizeAllocation);
        }

        if let Some(&slot) = self.by_id.get(&binding.alloc_id) {
            if access == AccessKind::Write {
                let flags = &mut self.slots[slot as usize].entry.flags;
                *flags &= !AllocFlags::READ_ONLY.bits();
            }
            return Ok(TrackOutcome::Slot(slot));
        }

        if self.len() >= self.capacity {
            return Ok(TrackOutcome::NeedFlush);
        }

        let slot = self.len();
        let flags = match access {
            AccessKind::Read => AllocFlags::READ_ONLY.bits(),
            AccessKind::Write => AllocFlags::empty().bits(),
        };
        self.slots.push(Tracked {
            entry: AllocEntry {
                alloc_id: binding.alloc_id,
                flags,
                gpa: binding.gpa,
                size_bytes: binding.size_bytes,
            },
        });
        self.by_id.insert(binding.alloc_id, slot);
        Ok(TrackOutcome::Slot(slot))
    }

    /// Pre-scan for one logical operation: do all of `bindings` fit without
    /// a mid-sequence flush? Duplicates within `bindings` and identities
    /// already tracked count once.
    pub fn fits(&self, bindings: &[ResourceBinding]) -> bool {
        let mut fresh = 0u32;
        let mut seen = std::collections::HashSet::new();
        for b in bindings {
            if self.by_id.contains_key(&b.alloc_id) {
                continue;
            }
            if seen.insert(b.alloc_id) {
                fresh += 1;
            }
        }
        fresh <= self.remaining()
    }

    /// Number of distinct identities in `bindings` (ignoring what is already
    /// tracked) — the minimum table capacity the operation needs.
    pub fn distinct_count(bindings: &[ResourceBinding]) -> u32 {
        let mut seen = std::collections::HashSet::new();
        bindings.iter().filter(|b| seen.insert(b.alloc_id)).count() as u32
    }

    /// Emit the wire table into the staging region at `gpa`; returns the
    /// byte length written.
    pub fn snapshot_to(&self, mem: &mut dyn MemoryBus, gpa: u64) -> u32 {
        let header = AllocTableHeader::for_entry_count(self.len());
        let mut buf = vec![0u8; header.size_bytes as usize];
        header.encode(&mut buf).expect("sized to the header");
        for (i, t) in self.slots.iter().enumerate() {
            let off = AllocTableHeader::SIZE_BYTES + i * AllocEntry::SIZE_BYTES;
            t.entry.encode(&mut buf[off..]).expect("sized to the table");
        }
        mem.write_physical(gpa, &buf);
        header.size_bytes
    }
}
