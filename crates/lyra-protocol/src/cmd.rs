//! Command-stream framing.
//!
//! A command stream is a [`CmdStreamHeader`] followed by a sequence of
//! packets. Each packet is an 8-byte [`CmdHdr`] (opcode + total packet size),
//! an opcode-specific fixed body, and an optional variable payload, zero
//! padded so every packet starts on a 4-byte boundary.
//!
//! Command semantics live entirely above this crate; apart from the control
//! opcodes in [`opcode`], an opcode is an opaque `u32` and a body is opaque
//! bytes. [`CmdStreamIter`] walks a finalized stream without interpreting
//! either, which is all a transport-level consumer (or a round-trip test)
//! needs.

use thiserror::Error;

use crate::abi::{self, AbiError};

/// `"SDMC"` byte tag.
pub const CMD_STREAM_MAGIC: u32 = 0x434D4453;

/// Packet alignment: every packet size is a multiple of this.
pub const CMD_ALIGN: usize = 4;

pub const fn align_up(v: usize, a: usize) -> usize {
    (v + (a - 1)) & !(a - 1)
}

/// Control opcodes owned by the transport layer itself. All other opcode
/// values belong to the command set layered on top.
pub mod opcode {
    pub const NOP: u32 = 0;
    pub const DEBUG_MARKER: u32 = 1;
    /// Explicit flush boundary; carries no body.
    pub const FLUSH: u32 = 2;
}

pub const CMD_STREAM_MAGIC_OFFSET: usize = 0;
pub const CMD_STREAM_ABI_VERSION_OFFSET: usize = 4;
pub const CMD_STREAM_SIZE_BYTES_OFFSET: usize = 8;
pub const CMD_STREAM_FLAGS_OFFSET: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdStreamHeader {
    pub magic: u32,
    pub abi_version: u32,
    /// Total stream length in bytes, header included. Stamped at finalize.
    pub size_bytes: u32,
    pub flags: u32,
}

impl CmdStreamHeader {
    pub const SIZE_BYTES: usize = 24;

    pub fn empty() -> Self {
        Self {
            magic: CMD_STREAM_MAGIC,
            abi_version: abi::ABI_VERSION,
            size_bytes: Self::SIZE_BYTES as u32,
            flags: 0,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CmdStreamError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(CmdStreamError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            abi_version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            size_bytes: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), CmdStreamError> {
        if buf.len() < Self::SIZE_BYTES {
            return Err(CmdStreamError::ShortBuffer {
                need: Self::SIZE_BYTES,
                have: buf.len(),
            });
        }
        buf[..Self::SIZE_BYTES].fill(0);
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.abi_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size_bytes.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CmdStreamError> {
        if self.magic != CMD_STREAM_MAGIC {
            return Err(CmdStreamError::BadMagic { found: self.magic });
        }
        abi::validate_abi_version(self.abi_version)?;
        if (self.size_bytes as usize) < Self::SIZE_BYTES {
            return Err(CmdStreamError::BadStreamSize {
                size_bytes: self.size_bytes,
            });
        }
        Ok(())
    }
}

/// Per-packet header: opcode plus the total packet size in bytes (header,
/// body, payload and padding), always a multiple of 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHdr {
    pub opcode: u32,
    pub size_bytes: u32,
}

impl CmdHdr {
    pub const SIZE_BYTES: usize = 8;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CmdStreamError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },
    #[error("bad command stream magic 0x{found:08x} (expected 0x{CMD_STREAM_MAGIC:08x})")]
    BadMagic { found: u32 },
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("bad stream size {size_bytes}")]
    BadStreamSize { size_bytes: u32 },
    #[error("stream declares {declared} bytes but only {have} are present")]
    TruncatedStream { declared: u32, have: usize },
    #[error("bad packet size {size_bytes} at offset {offset} (min 8, 4-byte aligned, in-bounds)")]
    BadPacketSize { offset: usize, size_bytes: u32 },
}

/// A validated packet: the opcode and the full packet bytes (header included).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdPacket<'a> {
    pub opcode: u32,
    pub bytes: &'a [u8],
}

impl<'a> CmdPacket<'a> {
    /// Body and payload bytes (everything after the packet header, padding
    /// included).
    pub fn body(&self) -> &'a [u8] {
        &self.bytes[CmdHdr::SIZE_BYTES..]
    }
}

/// Bounds-checked walk over a finalized stream.
///
/// Yields packets in order; stops at the first malformed packet with an
/// error. The iterator validates framing only — opcodes and bodies are
/// opaque here.
pub struct CmdStreamIter<'a> {
    buf: &'a [u8],
    end: usize,
    cursor: usize,
    poisoned: bool,
}

impl<'a> CmdStreamIter<'a> {
    /// Validate the stream header and return a packet iterator.
    pub fn new(buf: &'a [u8]) -> Result<Self, CmdStreamError> {
        let header = CmdStreamHeader::decode(buf)?;
        header.validate()?;
        let end = header.size_bytes as usize;
        if end > buf.len() {
            return Err(CmdStreamError::TruncatedStream {
                declared: header.size_bytes,
                have: buf.len(),
            });
        }
        Ok(Self {
            buf,
            end,
            cursor: CmdStreamHeader::SIZE_BYTES,
            poisoned: false,
        })
    }
}

impl<'a> Iterator for CmdStreamIter<'a> {
    type Item = Result<CmdPacket<'a>, CmdStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.cursor >= self.end {
            return None;
        }
        let offset = self.cursor;
        if self.end - offset < CmdHdr::SIZE_BYTES {
            self.poisoned = true;
            return Some(Err(CmdStreamError::BadPacketSize {
                offset,
                size_bytes: (self.end - offset) as u32,
            }));
        }
        let opcode = u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap());
        let size_bytes =
            u32::from_le_bytes(self.buf[offset + 4..offset + 8].try_into().unwrap());
        let size = size_bytes as usize;
        if size < CmdHdr::SIZE_BYTES || size % CMD_ALIGN != 0 || size > self.end - offset {
            self.poisoned = true;
            return Some(Err(CmdStreamError::BadPacketSize { offset, size_bytes }));
        }
        self.cursor = offset + size;
        Some(Ok(CmdPacket {
            opcode,
            bytes: &self.buf[offset..offset + size],
        }))
    }
}

/// Fixed command body that knows how to lay itself out on the wire.
///
/// `SIZE_BYTES` is the unpadded body size; the encoder aligns the full
/// packet. `encode_into` receives a zeroed slice of exactly `SIZE_BYTES`.
pub trait CmdBody {
    const SIZE_BYTES: usize;
    fn encode_into(&self, out: &mut [u8]);
}

/// Body-less packets (`NOP`, `FLUSH`).
impl CmdBody for () {
    const SIZE_BYTES: usize = 0;
    fn encode_into(&self, _out: &mut [u8]) {}
}

/// Body of [`opcode::DEBUG_MARKER`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugMarker {
    pub marker: u32,
}

impl CmdBody for DebugMarker {
    const SIZE_BYTES: usize = 4;
    fn encode_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.marker.to_le_bytes());
    }
}
