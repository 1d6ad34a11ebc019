//! LyraGPU guest⇄device wire ABI.
//!
//! Byte-exact, little-endian definitions of the structures shared across the
//! virtualization boundary: the submission ring, the per-submission
//! descriptor, the allocation-reference table, the fence page, and the
//! command-stream framing. All layouts are fixed-width and identical for
//! 32-bit and 64-bit producers talking to one consumer; nothing in here uses
//! architecture-sized types.
//!
//! This crate is pure data plus validation. It performs no I/O, takes no
//! locks, and interprets no command semantics — a command packet is an opcode
//! plus opaque bytes as far as this layer is concerned.
//!
//! Everything read back from the other trust domain must be validated before
//! use: every structure leads with a magic tag and an ABI version, and the
//! decode helpers reject wrong magic, foreign major versions, and malformed
//! shapes outright rather than partially interpreting them.

#![deny(unsafe_code)]

pub mod abi;
pub mod cmd;
pub mod ring;
