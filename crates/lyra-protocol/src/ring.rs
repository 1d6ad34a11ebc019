//! Submission-ring wire structures.
//!
//! A ring is one contiguous shared-memory region: a 64-byte [`RingHeader`]
//! followed by `entry_count` fixed-stride [`SubmitDesc`] slots. `head` and
//! `tail` are free-running 32-bit counters — they are never masked in
//! storage; the slot occupied by index `i` is `i & (entry_count - 1)`. Only
//! the producer writes `tail`; only the consumer writes `head`; the ring is
//! never more than `entry_count` entries full.
//!
//! The allocation table and fence page are sideband structures referenced by
//! GPA: the table lets command packets name memory by a small stable
//! `alloc_id` instead of a raw address, and the fence page gives the guest a
//! cheap read-only view of the device's completed-fence counter.

use std::collections::HashSet;

use bitflags::bitflags;
use thiserror::Error;

use crate::abi::{self, AbiError};

/// `"GNRA"` byte tag.
pub const RING_MAGIC: u32 = 0x41524E47;
/// `"COLA"` byte tag.
pub const ALLOC_TABLE_MAGIC: u32 = 0x414C4F43;
/// `"NREF"` byte tag.
pub const FENCE_PAGE_MAGIC: u32 = 0x4645524E;

/// The one engine every device exposes. Additional engines get their own
/// ring + fence counters; cross-engine ordering is not guaranteed.
pub const ENGINE_0: u32 = 0;

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },
    #[error("bad magic 0x{found:08x} (expected 0x{expected:08x})")]
    BadMagic { expected: u32, found: u32 },
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("bad entry count {found} (must be a nonzero power of two)")]
    BadEntryCount { found: u32 },
    #[error("bad entry stride {found} (minimum {min}, must be 4-byte aligned)")]
    BadStride { found: u32, min: u32 },
    #[error("bad size field {found} (minimum {min})")]
    BadSize { found: u32, min: u64 },
    #[error("declared size {declared} exceeds the {region} byte mapping")]
    SizeExceedsRegion { declared: u32, region: u32 },
    #[error("descriptor size {found} must equal {expected}")]
    BadDescSize { expected: u32, found: u32 },
    #[error("descriptor size {desc_size} exceeds ring entry stride {stride}")]
    DescExceedsStride { desc_size: u32, stride: u32 },
    #[error("gpa/size pair mismatch (gpa 0x{gpa:x}, size {size_bytes}): both must be zero or both nonzero")]
    RangeFieldsMismatch { gpa: u64, size_bytes: u64 },
    #[error("range 0x{gpa:x}+{size_bytes} overflows the address space")]
    RangeOverflow { gpa: u64, size_bytes: u64 },
}

/* ------------------------------- Ring header ------------------------------ */

pub const RING_MAGIC_OFFSET: usize = 0;
pub const RING_ABI_VERSION_OFFSET: usize = 4;
pub const RING_SIZE_BYTES_OFFSET: usize = 8;
pub const RING_ENTRY_COUNT_OFFSET: usize = 12;
pub const RING_ENTRY_STRIDE_BYTES_OFFSET: usize = 16;
pub const RING_FLAGS_OFFSET: usize = 20;
pub const RING_HEAD_OFFSET: usize = 24;
pub const RING_TAIL_OFFSET: usize = 28;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingHeader {
    pub magic: u32,
    pub abi_version: u32,
    /// Total ring size: header plus `entry_count * entry_stride_bytes`.
    pub size_bytes: u32,
    pub entry_count: u32,
    pub entry_stride_bytes: u32,
    pub flags: u32,
    /// Consumer-owned free-running counter.
    pub head: u32,
    /// Producer-owned free-running counter.
    pub tail: u32,
}

impl RingHeader {
    pub const SIZE_BYTES: usize = 64;

    /// Header for a fresh ring of `entry_count` standard-stride slots.
    pub fn for_entry_count(entry_count: u32) -> Self {
        let entry_stride_bytes = SubmitDesc::SIZE_BYTES as u32;
        Self {
            magic: RING_MAGIC,
            abi_version: abi::ABI_VERSION,
            size_bytes: Self::required_size_bytes(entry_count, entry_stride_bytes) as u32,
            entry_count,
            entry_stride_bytes,
            flags: 0,
            head: 0,
            tail: 0,
        }
    }

    pub fn required_size_bytes(entry_count: u32, entry_stride_bytes: u32) -> u64 {
        Self::SIZE_BYTES as u64 + entry_count as u64 * entry_stride_bytes as u64
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            magic: get_u32(buf, RING_MAGIC_OFFSET),
            abi_version: get_u32(buf, RING_ABI_VERSION_OFFSET),
            size_bytes: get_u32(buf, RING_SIZE_BYTES_OFFSET),
            entry_count: get_u32(buf, RING_ENTRY_COUNT_OFFSET),
            entry_stride_bytes: get_u32(buf, RING_ENTRY_STRIDE_BYTES_OFFSET),
            flags: get_u32(buf, RING_FLAGS_OFFSET),
            head: get_u32(buf, RING_HEAD_OFFSET),
            tail: get_u32(buf, RING_TAIL_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        buf[..Self::SIZE_BYTES].fill(0);
        put_u32(buf, RING_MAGIC_OFFSET, self.magic);
        put_u32(buf, RING_ABI_VERSION_OFFSET, self.abi_version);
        put_u32(buf, RING_SIZE_BYTES_OFFSET, self.size_bytes);
        put_u32(buf, RING_ENTRY_COUNT_OFFSET, self.entry_count);
        put_u32(buf, RING_ENTRY_STRIDE_BYTES_OFFSET, self.entry_stride_bytes);
        put_u32(buf, RING_FLAGS_OFFSET, self.flags);
        put_u32(buf, RING_HEAD_OFFSET, self.head);
        put_u32(buf, RING_TAIL_OFFSET, self.tail);
        Ok(())
    }

    /// Shape validation: magic, version, entry count, stride, declared size.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.magic != RING_MAGIC {
            return Err(WireError::BadMagic {
                expected: RING_MAGIC,
                found: self.magic,
            });
        }
        abi::validate_abi_version(self.abi_version)?;
        if self.entry_count == 0 || !self.entry_count.is_power_of_two() {
            return Err(WireError::BadEntryCount {
                found: self.entry_count,
            });
        }
        let min_stride = SubmitDesc::SIZE_BYTES as u32;
        if self.entry_stride_bytes < min_stride || self.entry_stride_bytes % 4 != 0 {
            return Err(WireError::BadStride {
                found: self.entry_stride_bytes,
                min: min_stride,
            });
        }
        let required = Self::required_size_bytes(self.entry_count, self.entry_stride_bytes);
        if (self.size_bytes as u64) < required {
            return Err(WireError::BadSize {
                found: self.size_bytes,
                min: required,
            });
        }
        Ok(())
    }

    /// Full validation against the mapped region the header was read from.
    ///
    /// The mapping may be larger than the declared size (page rounding,
    /// extension space); it must never be smaller.
    pub fn validate_in_region(&self, region_size_bytes: u32) -> Result<(), WireError> {
        self.validate()?;
        if self.size_bytes > region_size_bytes {
            return Err(WireError::SizeExceedsRegion {
                declared: self.size_bytes,
                region: region_size_bytes,
            });
        }
        Ok(())
    }

    /// Slot occupied by free-running index `index`.
    pub fn slot_index(&self, index: u32) -> u32 {
        // entry_count is validated as a power of two.
        index & (self.entry_count - 1)
    }
}

/* --------------------------- Submit descriptor ---------------------------- */

pub const SUBMIT_DESC_SIZE_BYTES_OFFSET: usize = 0;
pub const SUBMIT_DESC_FLAGS_OFFSET: usize = 4;
pub const SUBMIT_DESC_CONTEXT_ID_OFFSET: usize = 8;
pub const SUBMIT_DESC_ENGINE_ID_OFFSET: usize = 12;
pub const SUBMIT_DESC_CMD_GPA_OFFSET: usize = 16;
pub const SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET: usize = 24;
pub const SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET: usize = 32;
pub const SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET: usize = 40;
pub const SUBMIT_DESC_SIGNAL_FENCE_OFFSET: usize = 48;

bitflags! {
    /// Submission flags carried in [`SubmitDesc::flags`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        /// This submission ends in a present; the device may pace it against
        /// scanout.
        const PRESENT = 1 << 0;
        /// The device should not raise a completion interrupt for this
        /// submission; the guest will poll.
        const NO_IRQ = 1 << 1;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmitDesc {
    pub desc_size_bytes: u32,
    pub flags: u32,
    pub context_id: u32,
    pub engine_id: u32,
    pub cmd_gpa: u64,
    pub cmd_size_bytes: u32,
    pub alloc_table_gpa: u64,
    pub alloc_table_size_bytes: u32,
    /// Fence value the device must stamp as completed once this submission
    /// finishes.
    pub signal_fence: u64,
}

impl SubmitDesc {
    pub const SIZE_BYTES: usize = 64;

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            desc_size_bytes: get_u32(buf, SUBMIT_DESC_SIZE_BYTES_OFFSET),
            flags: get_u32(buf, SUBMIT_DESC_FLAGS_OFFSET),
            context_id: get_u32(buf, SUBMIT_DESC_CONTEXT_ID_OFFSET),
            engine_id: get_u32(buf, SUBMIT_DESC_ENGINE_ID_OFFSET),
            cmd_gpa: get_u64(buf, SUBMIT_DESC_CMD_GPA_OFFSET),
            cmd_size_bytes: get_u32(buf, SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET),
            alloc_table_gpa: get_u64(buf, SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET),
            alloc_table_size_bytes: get_u32(buf, SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET),
            signal_fence: get_u64(buf, SUBMIT_DESC_SIGNAL_FENCE_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        buf[..Self::SIZE_BYTES].fill(0);
        put_u32(buf, SUBMIT_DESC_SIZE_BYTES_OFFSET, self.desc_size_bytes);
        put_u32(buf, SUBMIT_DESC_FLAGS_OFFSET, self.flags);
        put_u32(buf, SUBMIT_DESC_CONTEXT_ID_OFFSET, self.context_id);
        put_u32(buf, SUBMIT_DESC_ENGINE_ID_OFFSET, self.engine_id);
        put_u64(buf, SUBMIT_DESC_CMD_GPA_OFFSET, self.cmd_gpa);
        put_u32(buf, SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET, self.cmd_size_bytes);
        put_u64(buf, SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET, self.alloc_table_gpa);
        put_u32(
            buf,
            SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET,
            self.alloc_table_size_bytes,
        );
        put_u64(buf, SUBMIT_DESC_SIGNAL_FENCE_OFFSET, self.signal_fence);
        Ok(())
    }

    /// Validate a descriptor against the ring stride it was read through.
    ///
    /// `desc_size_bytes` must equal the structure size exactly, both (gpa,
    /// size) pairs must be consistently zero or nonzero, and neither range
    /// may overflow the address space.
    pub fn validate(&self, ring_entry_stride_bytes: u32) -> Result<(), WireError> {
        if self.desc_size_bytes != Self::SIZE_BYTES as u32 {
            return Err(WireError::BadDescSize {
                expected: Self::SIZE_BYTES as u32,
                found: self.desc_size_bytes,
            });
        }
        if self.desc_size_bytes > ring_entry_stride_bytes {
            return Err(WireError::DescExceedsStride {
                desc_size: self.desc_size_bytes,
                stride: ring_entry_stride_bytes,
            });
        }
        validate_range_pair(self.cmd_gpa, self.cmd_size_bytes as u64)?;
        validate_range_pair(self.alloc_table_gpa, self.alloc_table_size_bytes as u64)?;
        Ok(())
    }
}

fn validate_range_pair(gpa: u64, size_bytes: u64) -> Result<(), WireError> {
    let present = gpa != 0 || size_bytes != 0;
    if present && (gpa == 0 || size_bytes == 0) {
        return Err(WireError::RangeFieldsMismatch { gpa, size_bytes });
    }
    if present && gpa.checked_add(size_bytes).is_none() {
        return Err(WireError::RangeOverflow { gpa, size_bytes });
    }
    Ok(())
}

/* ---------------------------- Allocation table ---------------------------- */

pub const ALLOC_TABLE_MAGIC_OFFSET: usize = 0;
pub const ALLOC_TABLE_ABI_VERSION_OFFSET: usize = 4;
pub const ALLOC_TABLE_SIZE_BYTES_OFFSET: usize = 8;
pub const ALLOC_TABLE_ENTRY_COUNT_OFFSET: usize = 12;
pub const ALLOC_TABLE_ENTRY_STRIDE_BYTES_OFFSET: usize = 16;

pub const ALLOC_ENTRY_ALLOC_ID_OFFSET: usize = 0;
pub const ALLOC_ENTRY_FLAGS_OFFSET: usize = 4;
pub const ALLOC_ENTRY_GPA_OFFSET: usize = 8;
pub const ALLOC_ENTRY_SIZE_BYTES_OFFSET: usize = 16;

bitflags! {
    /// Access flags carried in [`AllocEntry::flags`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// The submission only reads this allocation.
        const READ_ONLY = 1 << 0;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocTableHeader {
    pub magic: u32,
    pub abi_version: u32,
    pub size_bytes: u32,
    pub entry_count: u32,
    pub entry_stride_bytes: u32,
}

impl AllocTableHeader {
    pub const SIZE_BYTES: usize = 24;

    pub fn for_entry_count(entry_count: u32) -> Self {
        let entry_stride_bytes = AllocEntry::SIZE_BYTES as u32;
        Self {
            magic: ALLOC_TABLE_MAGIC,
            abi_version: abi::ABI_VERSION,
            size_bytes: Self::SIZE_BYTES as u32 + entry_count * entry_stride_bytes,
            entry_count,
            entry_stride_bytes,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            magic: get_u32(buf, ALLOC_TABLE_MAGIC_OFFSET),
            abi_version: get_u32(buf, ALLOC_TABLE_ABI_VERSION_OFFSET),
            size_bytes: get_u32(buf, ALLOC_TABLE_SIZE_BYTES_OFFSET),
            entry_count: get_u32(buf, ALLOC_TABLE_ENTRY_COUNT_OFFSET),
            entry_stride_bytes: get_u32(buf, ALLOC_TABLE_ENTRY_STRIDE_BYTES_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        buf[..Self::SIZE_BYTES].fill(0);
        put_u32(buf, ALLOC_TABLE_MAGIC_OFFSET, self.magic);
        put_u32(buf, ALLOC_TABLE_ABI_VERSION_OFFSET, self.abi_version);
        put_u32(buf, ALLOC_TABLE_SIZE_BYTES_OFFSET, self.size_bytes);
        put_u32(buf, ALLOC_TABLE_ENTRY_COUNT_OFFSET, self.entry_count);
        put_u32(
            buf,
            ALLOC_TABLE_ENTRY_STRIDE_BYTES_OFFSET,
            self.entry_stride_bytes,
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.magic != ALLOC_TABLE_MAGIC {
            return Err(WireError::BadMagic {
                expected: ALLOC_TABLE_MAGIC,
                found: self.magic,
            });
        }
        abi::validate_abi_version(self.abi_version)?;
        let min_stride = AllocEntry::SIZE_BYTES as u32;
        if self.entry_stride_bytes < min_stride || self.entry_stride_bytes % 4 != 0 {
            return Err(WireError::BadStride {
                found: self.entry_stride_bytes,
                min: min_stride,
            });
        }
        let required =
            Self::SIZE_BYTES as u64 + self.entry_count as u64 * self.entry_stride_bytes as u64;
        if (self.size_bytes as u64) < required {
            return Err(WireError::BadSize {
                found: self.size_bytes,
                min: required,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocEntry {
    /// Stable nonzero allocation identity. `alloc_id == 0` is reserved.
    pub alloc_id: u32,
    pub flags: u32,
    pub gpa: u64,
    pub size_bytes: u64,
}

impl AllocEntry {
    pub const SIZE_BYTES: usize = 24;

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            alloc_id: get_u32(buf, ALLOC_ENTRY_ALLOC_ID_OFFSET),
            flags: get_u32(buf, ALLOC_ENTRY_FLAGS_OFFSET),
            gpa: get_u64(buf, ALLOC_ENTRY_GPA_OFFSET),
            size_bytes: get_u64(buf, ALLOC_ENTRY_SIZE_BYTES_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        buf[..Self::SIZE_BYTES].fill(0);
        put_u32(buf, ALLOC_ENTRY_ALLOC_ID_OFFSET, self.alloc_id);
        put_u32(buf, ALLOC_ENTRY_FLAGS_OFFSET, self.flags);
        put_u64(buf, ALLOC_ENTRY_GPA_OFFSET, self.gpa);
        put_u64(buf, ALLOC_ENTRY_SIZE_BYTES_OFFSET, self.size_bytes);
        Ok(())
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocTableError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("alloc_id 0 is reserved")]
    ReservedAllocId,
    #[error("duplicate alloc_id {alloc_id}")]
    DuplicateAllocId { alloc_id: u32 },
    #[error("alloc_id {alloc_id} has zero size")]
    ZeroSize { alloc_id: u32 },
    #[error("alloc_id {alloc_id} range 0x{gpa:x}+{size_bytes} overflows")]
    RangeOverflow {
        alloc_id: u32,
        gpa: u64,
        size_bytes: u64,
    },
}

#[derive(Clone, Debug)]
pub struct AllocTable {
    pub header: AllocTableHeader,
    pub entries: Vec<AllocEntry>,
}

impl AllocTable {
    /// Decode and fully validate a table from its wire bytes.
    ///
    /// Entries past the declared stride are ignored (forward-compat: an
    /// extended stride carries extension bytes this revision does not know).
    pub fn decode(buf: &[u8]) -> Result<Self, AllocTableError> {
        let header = AllocTableHeader::decode(buf)?;
        header.validate()?;
        if (header.size_bytes as usize) > buf.len() {
            return Err(WireError::ShortBuffer {
                need: header.size_bytes as usize,
                have: buf.len(),
            }
            .into());
        }

        let stride = header.entry_stride_bytes as usize;
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for i in 0..header.entry_count as usize {
            let off = AllocTableHeader::SIZE_BYTES + i * stride;
            let entry = AllocEntry::decode(&buf[off..off + stride])?;
            if entry.alloc_id == 0 {
                return Err(AllocTableError::ReservedAllocId);
            }
            if !seen.insert(entry.alloc_id) {
                return Err(AllocTableError::DuplicateAllocId {
                    alloc_id: entry.alloc_id,
                });
            }
            if entry.size_bytes == 0 {
                return Err(AllocTableError::ZeroSize {
                    alloc_id: entry.alloc_id,
                });
            }
            if entry.gpa.checked_add(entry.size_bytes).is_none() {
                return Err(AllocTableError::RangeOverflow {
                    alloc_id: entry.alloc_id,
                    gpa: entry.gpa,
                    size_bytes: entry.size_bytes,
                });
            }
            entries.push(entry);
        }

        Ok(Self { header, entries })
    }

    pub fn lookup(&self, alloc_id: u32) -> Option<&AllocEntry> {
        self.entries.iter().find(|e| e.alloc_id == alloc_id)
    }
}

/* -------------------------------- Fence page ------------------------------ */

pub const FENCE_PAGE_MAGIC_OFFSET: usize = 0;
pub const FENCE_PAGE_ABI_VERSION_OFFSET: usize = 4;
pub const FENCE_PAGE_COMPLETED_FENCE_OFFSET: usize = 8;

/// Device-written completion mirror: one 4 KiB page, 56 defined bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FencePage {
    pub magic: u32,
    pub abi_version: u32,
    /// Monotonically non-decreasing; written only by the device.
    pub completed_fence: u64,
}

impl FencePage {
    pub const SIZE_BYTES: usize = 56;

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            magic: get_u32(buf, FENCE_PAGE_MAGIC_OFFSET),
            abi_version: get_u32(buf, FENCE_PAGE_ABI_VERSION_OFFSET),
            completed_fence: get_u64(buf, FENCE_PAGE_COMPLETED_FENCE_OFFSET),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), WireError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(WireError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        buf[..Self::SIZE_BYTES].fill(0);
        put_u32(buf, FENCE_PAGE_MAGIC_OFFSET, self.magic);
        put_u32(buf, FENCE_PAGE_ABI_VERSION_OFFSET, self.abi_version);
        put_u64(
            buf,
            FENCE_PAGE_COMPLETED_FENCE_OFFSET,
            self.completed_fence,
        );
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WireError> {
        if self.magic != FENCE_PAGE_MAGIC {
            return Err(WireError::BadMagic {
                expected: FENCE_PAGE_MAGIC,
                found: self.magic,
            });
        }
        abi::validate_abi_version(self.abi_version)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ABI_MAJOR, ABI_MINOR, ABI_VERSION};

    fn valid_ring_header() -> RingHeader {
        RingHeader::for_entry_count(8)
    }

    #[test]
    fn wire_layout_is_frozen() {
        assert_eq!(RingHeader::SIZE_BYTES, 64);
        assert_eq!(RING_MAGIC_OFFSET, 0);
        assert_eq!(RING_ABI_VERSION_OFFSET, 4);
        assert_eq!(RING_SIZE_BYTES_OFFSET, 8);
        assert_eq!(RING_ENTRY_COUNT_OFFSET, 12);
        assert_eq!(RING_ENTRY_STRIDE_BYTES_OFFSET, 16);
        assert_eq!(RING_FLAGS_OFFSET, 20);
        assert_eq!(RING_HEAD_OFFSET, 24);
        assert_eq!(RING_TAIL_OFFSET, 28);

        assert_eq!(SubmitDesc::SIZE_BYTES, 64);
        assert_eq!(SUBMIT_DESC_SIZE_BYTES_OFFSET, 0);
        assert_eq!(SUBMIT_DESC_FLAGS_OFFSET, 4);
        assert_eq!(SUBMIT_DESC_CONTEXT_ID_OFFSET, 8);
        assert_eq!(SUBMIT_DESC_ENGINE_ID_OFFSET, 12);
        assert_eq!(SUBMIT_DESC_CMD_GPA_OFFSET, 16);
        assert_eq!(SUBMIT_DESC_CMD_SIZE_BYTES_OFFSET, 24);
        assert_eq!(SUBMIT_DESC_ALLOC_TABLE_GPA_OFFSET, 32);
        assert_eq!(SUBMIT_DESC_ALLOC_TABLE_SIZE_BYTES_OFFSET, 40);
        assert_eq!(SUBMIT_DESC_SIGNAL_FENCE_OFFSET, 48);

        assert_eq!(AllocTableHeader::SIZE_BYTES, 24);
        assert_eq!(AllocEntry::SIZE_BYTES, 24);
        assert_eq!(ALLOC_ENTRY_ALLOC_ID_OFFSET, 0);
        assert_eq!(ALLOC_ENTRY_FLAGS_OFFSET, 4);
        assert_eq!(ALLOC_ENTRY_GPA_OFFSET, 8);
        assert_eq!(ALLOC_ENTRY_SIZE_BYTES_OFFSET, 16);

        assert_eq!(FencePage::SIZE_BYTES, 56);
        assert_eq!(FENCE_PAGE_COMPLETED_FENCE_OFFSET, 8);

        assert_eq!(RING_MAGIC, 0x41524E47);
        assert_eq!(ALLOC_TABLE_MAGIC, 0x414C4F43);
        assert_eq!(FENCE_PAGE_MAGIC, 0x4645524E);
        assert_eq!(ABI_VERSION, 0x0001_0000);
    }

    #[test]
    fn ring_header_round_trips() {
        let mut hdr = valid_ring_header();
        hdr.flags = 0xAABB_CCDD;
        hdr.head = 5;
        hdr.tail = 6;

        let mut buf = [0u8; RingHeader::SIZE_BYTES];
        hdr.encode(&mut buf).unwrap();
        assert_eq!(RingHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn ring_header_accepts_unknown_minor() {
        let mut hdr = valid_ring_header();
        hdr.abi_version = (ABI_MAJOR << 16) | (ABI_MINOR + 17);
        assert!(hdr.validate().is_ok());
    }

    #[test]
    fn ring_header_rejects_unknown_major() {
        let mut hdr = valid_ring_header();
        hdr.abi_version = ((ABI_MAJOR + 1) << 16) | ABI_MINOR;
        assert!(matches!(
            hdr.validate(),
            Err(WireError::Abi(AbiError::UnsupportedMajor { .. }))
        ));
    }

    #[test]
    fn ring_header_rejects_bad_magic() {
        let mut hdr = valid_ring_header();
        hdr.magic = 0;
        assert!(matches!(hdr.validate(), Err(WireError::BadMagic { .. })));
    }

    #[test]
    fn ring_header_rejects_bad_entry_count() {
        let mut hdr = valid_ring_header();
        hdr.entry_count = 0;
        assert!(matches!(
            hdr.validate(),
            Err(WireError::BadEntryCount { found: 0 })
        ));

        let mut hdr = valid_ring_header();
        hdr.entry_count = 3;
        hdr.size_bytes =
            RingHeader::required_size_bytes(hdr.entry_count, hdr.entry_stride_bytes) as u32;
        assert!(matches!(
            hdr.validate(),
            Err(WireError::BadEntryCount { found: 3 })
        ));
    }

    #[test]
    fn ring_header_rejects_bad_stride_and_size() {
        let mut hdr = valid_ring_header();
        hdr.entry_stride_bytes = SubmitDesc::SIZE_BYTES as u32 - 4;
        hdr.size_bytes =
            RingHeader::required_size_bytes(hdr.entry_count, hdr.entry_stride_bytes) as u32;
        assert!(matches!(hdr.validate(), Err(WireError::BadStride { .. })));

        let mut hdr = valid_ring_header();
        hdr.size_bytes -= 1;
        assert!(matches!(hdr.validate(), Err(WireError::BadSize { .. })));
    }

    #[test]
    fn ring_header_region_check_allows_larger_mapping() {
        let hdr = valid_ring_header();
        // Page rounding / extension space past the declared size is fine.
        assert!(hdr.validate_in_region(hdr.size_bytes + 4096).is_ok());
        assert!(matches!(
            hdr.validate_in_region(hdr.size_bytes - 1),
            Err(WireError::SizeExceedsRegion { .. })
        ));
    }

    #[test]
    fn slot_index_wraps_by_entry_count() {
        let hdr = valid_ring_header();
        assert_eq!(hdr.slot_index(0), 0);
        assert_eq!(hdr.slot_index(hdr.entry_count - 1), hdr.entry_count - 1);
        assert_eq!(hdr.slot_index(hdr.entry_count), 0);
        assert_eq!(hdr.slot_index(hdr.entry_count + 1), 1);
    }

    fn valid_desc() -> SubmitDesc {
        SubmitDesc {
            desc_size_bytes: SubmitDesc::SIZE_BYTES as u32,
            ..SubmitDesc::default()
        }
    }

    #[test]
    fn submit_desc_round_trips() {
        let desc = SubmitDesc {
            desc_size_bytes: SubmitDesc::SIZE_BYTES as u32,
            flags: SubmitFlags::PRESENT.bits(),
            context_id: 123,
            engine_id: 456,
            cmd_gpa: 0xDEAD_BEEF,
            cmd_size_bytes: 0x1000,
            alloc_table_gpa: 0xCAFE_BABE,
            alloc_table_size_bytes: 0x2000,
            signal_fence: 0x1122_3344_5566_7788,
        };
        let mut buf = [0u8; SubmitDesc::SIZE_BYTES];
        desc.encode(&mut buf).unwrap();
        assert_eq!(SubmitDesc::decode(&buf).unwrap(), desc);
    }

    #[test]
    fn submit_desc_rejects_wrong_size_field() {
        let mut desc = valid_desc();
        desc.desc_size_bytes = 0;
        assert!(matches!(
            desc.validate(SubmitDesc::SIZE_BYTES as u32),
            Err(WireError::BadDescSize { .. })
        ));

        let mut desc = valid_desc();
        desc.desc_size_bytes = SubmitDesc::SIZE_BYTES as u32 + 16;
        assert!(matches!(
            desc.validate(SubmitDesc::SIZE_BYTES as u32 + 16),
            Err(WireError::BadDescSize { .. })
        ));
    }

    #[test]
    fn submit_desc_rejects_range_mismatch_and_overflow() {
        let mut desc = valid_desc();
        desc.cmd_gpa = 0x1000;
        desc.cmd_size_bytes = 0;
        assert!(matches!(
            desc.validate(SubmitDesc::SIZE_BYTES as u32),
            Err(WireError::RangeFieldsMismatch { .. })
        ));

        let mut desc = valid_desc();
        desc.cmd_gpa = u64::MAX - 3;
        desc.cmd_size_bytes = 4;
        assert!(matches!(
            desc.validate(SubmitDesc::SIZE_BYTES as u32),
            Err(WireError::RangeOverflow { .. })
        ));

        let mut desc = valid_desc();
        desc.alloc_table_gpa = 0x1000;
        desc.alloc_table_size_bytes = 0;
        assert!(matches!(
            desc.validate(SubmitDesc::SIZE_BYTES as u32),
            Err(WireError::RangeFieldsMismatch { .. })
        ));
    }

    fn table_bytes(entries: &[AllocEntry]) -> Vec<u8> {
        let header = AllocTableHeader::for_entry_count(entries.len() as u32);
        let mut buf = vec![0u8; header.size_bytes as usize];
        header.encode(&mut buf).unwrap();
        for (i, e) in entries.iter().enumerate() {
            let off = AllocTableHeader::SIZE_BYTES + i * AllocEntry::SIZE_BYTES;
            e.encode(&mut buf[off..]).unwrap();
        }
        buf
    }

    #[test]
    fn alloc_table_decodes_and_looks_up() {
        let buf = table_bytes(&[
            AllocEntry {
                alloc_id: 7,
                flags: AllocFlags::READ_ONLY.bits(),
                gpa: 0x1000_0000,
                size_bytes: 0x2000,
            },
            AllocEntry {
                alloc_id: 9,
                flags: 0,
                gpa: 0x2000_0000,
                size_bytes: 0x40,
            },
        ]);
        let table = AllocTable::decode(&buf).unwrap();
        assert_eq!(table.entries.len(), 2);
        assert_eq!(table.lookup(9).unwrap().gpa, 0x2000_0000);
        assert!(table.lookup(8).is_none());
    }

    #[test]
    fn alloc_table_rejects_duplicates_zero_ids_and_overflow() {
        let dup = table_bytes(&[
            AllocEntry {
                alloc_id: 1,
                flags: 0,
                gpa: 0x1000,
                size_bytes: 0x10,
            },
            AllocEntry {
                alloc_id: 1,
                flags: 0,
                gpa: 0x2000,
                size_bytes: 0x20,
            },
        ]);
        assert!(matches!(
            AllocTable::decode(&dup),
            Err(AllocTableError::DuplicateAllocId { alloc_id: 1 })
        ));

        let zero = table_bytes(&[AllocEntry {
            alloc_id: 0,
            flags: 0,
            gpa: 0x1000,
            size_bytes: 0x10,
        }]);
        assert!(matches!(
            AllocTable::decode(&zero),
            Err(AllocTableError::ReservedAllocId)
        ));

        let overflow = table_bytes(&[AllocEntry {
            alloc_id: 2,
            flags: 0,
            gpa: u64::MAX - 15,
            size_bytes: 32,
        }]);
        assert!(matches!(
            AllocTable::decode(&overflow),
            Err(AllocTableError::RangeOverflow { alloc_id: 2, .. })
        ));
    }

    #[test]
    fn alloc_table_tolerates_extended_entry_stride() {
        let entry_stride = AllocEntry::SIZE_BYTES as u32 + 16;
        let header = AllocTableHeader {
            magic: ALLOC_TABLE_MAGIC,
            abi_version: ABI_VERSION,
            size_bytes: AllocTableHeader::SIZE_BYTES as u32 + entry_stride,
            entry_count: 1,
            entry_stride_bytes: entry_stride,
        };
        let mut buf = vec![0u8; header.size_bytes as usize];
        header.encode(&mut buf).unwrap();
        AllocEntry {
            alloc_id: 10,
            flags: AllocFlags::READ_ONLY.bits(),
            gpa: 0x1122_3344_5566_7788,
            size_bytes: 0x1000,
        }
        .encode(&mut buf[AllocTableHeader::SIZE_BYTES..])
        .unwrap();
        // Unknown extension bytes must be ignored.
        let ext = AllocTableHeader::SIZE_BYTES + AllocEntry::SIZE_BYTES;
        buf[ext..ext + 16].fill(0xAA);

        let table = AllocTable::decode(&buf).unwrap();
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.entries[0].alloc_id, 10);
    }

    #[test]
    fn fence_page_round_trips_and_validates() {
        let page = FencePage {
            magic: FENCE_PAGE_MAGIC,
            abi_version: ABI_VERSION,
            completed_fence: 123,
        };
        let mut buf = [0u8; FencePage::SIZE_BYTES];
        page.encode(&mut buf).unwrap();
        let decoded = FencePage::decode(&buf).unwrap();
        assert_eq!(decoded, page);
        assert!(decoded.validate().is_ok());

        let zeroed = FencePage::decode(&[0u8; FencePage::SIZE_BYTES]).unwrap();
        assert!(matches!(
            zeroed.validate(),
            Err(WireError::BadMagic { .. })
        ));
    }
}
