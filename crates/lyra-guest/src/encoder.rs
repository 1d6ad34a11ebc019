//! Bounded command-stream encoder.
//!
//! Appends opcode-tagged packets into a fixed-capacity buffer that begins
//! with a stream header. Every packet is padded to a 4-byte boundary. An
//! append that does not fit signals [`NoSpace`] and changes nothing — the
//! submission coordinator resolves that by flushing and retrying; the
//! encoder itself never flushes and never truncates.

use lyra_protocol::cmd::{align_up, CmdBody, CmdHdr, CmdStreamHeader, CMD_ALIGN};

/// The packet does not fit the remaining capacity. Retry after a flush.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoSpace;

#[derive(Debug)]
pub struct CmdStreamEncoder {
    buf: Vec<u8>,
    capacity: usize,
}

impl CmdStreamEncoder {
    /// An encoder bound to `capacity_bytes` of stream space. The capacity is
    /// fixed for the encoder's lifetime; it matches the staging region each
    /// finalized stream is handed to.
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        assert!(capacity_bytes >= CmdStreamHeader::SIZE_BYTES);
        let mut enc = Self {
            buf: Vec::with_capacity(capacity_bytes),
            capacity: capacity_bytes,
        };
        enc.rewind();
        enc
    }

    /// Reset to an empty stream (header only) without reallocating.
    pub fn rewind(&mut self) {
        self.buf.clear();
        self.buf.resize(CmdStreamHeader::SIZE_BYTES, 0);
        CmdStreamHeader::empty()
            .encode(&mut self.buf)
            .expect("header fits the minimum capacity");
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes_remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Current stream length, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True while no packet has been appended since the last rewind.
    pub fn is_empty(&self) -> bool {
        self.buf.len() <= CmdStreamHeader::SIZE_BYTES
    }

    /// Aligned on-wire size of a packet with `body_bytes + payload_bytes` of
    /// content.
    pub fn packet_size_bytes(body_bytes: usize, payload_bytes: usize) -> usize {
        align_up(CmdHdr::SIZE_BYTES + body_bytes + payload_bytes, CMD_ALIGN)
    }

    fn append_raw(&mut self, opcode: u32, content_bytes: usize) -> Result<usize, NoSpace> {
        let size = Self::packet_size_bytes(content_bytes, 0);
        if self.bytes_remaining() < size {
            return Err(NoSpace);
        }
        let base = self.buf.len();
        // Padding bytes are zero by construction.
        self.buf.resize(base + size, 0);
        self.buf[base..base + 4].copy_from_slice(&opcode.to_le_bytes());
        self.buf[base + 4..base + 8].copy_from_slice(&(size as u32).to_le_bytes());
        Ok(base)
    }

    /// Append a packet with a fixed body and no payload.
    pub fn append_fixed<T: CmdBody>(&mut self, opcode: u32, body: &T) -> Result<(), NoSpace> {
        let base = self.append_raw(opcode, T::SIZE_BYTES)?;
        let body_base = base + CmdHdr::SIZE_BYTES;
        body.encode_into(&mut self.buf[body_base..body_base + T::SIZE_BYTES]);
        Ok(())
    }

    /// Append a packet with a fixed body followed by a variable payload.
    pub fn append_with_payload<T: CmdBody>(
        &mut self,
        opcode: u32,
        body: &T,
        payload: &[u8],
    ) -> Result<(), NoSpace> {
        let size = Self::packet_size_bytes(T::SIZE_BYTES, payload.len());
        if self.bytes_remaining() < size {
            return Err(NoSpace);
        }
        let base = self
            .append_raw(opcode, T::SIZE_BYTES + payload.len())
            .expect("space checked above");
        let body_base = base + CmdHdr::SIZE_BYTES;
        body.encode_into(&mut self.buf[body_base..body_base + T::SIZE_BYTES]);
        let payload_base = body_base + T::SIZE_BYTES;
        self.buf[payload_base..payload_base + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Stamp the stream length into the header and expose the stream bytes.
    ///
    /// Finalize does not consume the stream: the coordinator may keep
    /// appending after a failed hand-off and finalize again. Only
    /// [`rewind`](Self::rewind) resets it.
    pub fn finalize(&mut self) -> &[u8] {
        let len = self.buf.len() as u32;
        self.buf[8..12].copy_from_slice(&len.to_le_bytes());
        &self.buf
    }
}
