//! Transfer buffers: fixed-size payload memory plus the leader the stream
//! writes when it completes a transfer.

use super::ledger::BufferId;
use crate::payload::PayloadType;

/// Image geometry carried by an image (or compressed image) leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageLeader {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw PFNC pixel format code.
    pub pixel_format: u32,
    /// Horizontal offset of the region of interest.
    pub offset_x: u32,
    /// Vertical offset of the region of interest.
    pub offset_y: u32,
}

/// Metadata the stream records for a completed block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferLeader {
    /// Block id assigned by the device.
    pub block_id: u64,
    /// Raw payload type tag.
    pub payload_type: u16,
    /// Device timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Geometry for image payloads.
    pub image: Option<ImageLeader>,
    /// Chunk count for chunk-data payloads.
    pub chunk_count: u32,
    /// Part count for multi-part payloads.
    pub part_count: u32,
}

/// One pool-owned block of payload memory.
///
/// The memory is allocated once, at pool initialization, and sized to the
/// session's payload size. The value moves between the stream (while queued)
/// and the acquisition loop (while filled / in use); it is never in both
/// places at once.
#[derive(Debug)]
pub struct TransferBuffer {
    id: BufferId,
    memory: Vec<u8>,
    received: usize,
    leader: BufferLeader,
}

impl TransferBuffer {
    pub(crate) fn new(id: BufferId, memory: Vec<u8>) -> Self {
        Self {
            id,
            memory,
            received: 0,
            leader: BufferLeader::default(),
        }
    }

    /// Pool index of this buffer.
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size of the backing memory in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Number of payload bytes the stream wrote.
    #[must_use]
    pub fn received_len(&self) -> usize {
        self.received
    }

    /// Received payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.memory[..self.received]
    }

    /// Leader of the last completed transfer.
    #[must_use]
    pub fn leader(&self) -> &BufferLeader {
        &self.leader
    }

    /// Decoded payload type tag.
    #[must_use]
    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from_raw(self.leader.payload_type)
    }

    /// Whole backing memory, for the stream to write into.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Record a completed transfer of `received` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `received` exceeds the buffer capacity.
    pub fn complete(&mut self, leader: BufferLeader, received: usize) {
        assert!(
            received <= self.memory.len(),
            "received length ({received}) exceeds buffer capacity ({})",
            self.memory.len()
        );
        self.leader = leader;
        self.received = received;
    }

    /// Forget the previous transfer. Memory contents are left as they are.
    pub fn clear(&mut self) {
        self.leader = BufferLeader::default();
        self.received = 0;
    }
}
