//! Per-buffer state ledger.
//!
//! The pool never hands out raw pointers. A buffer is identified by its
//! [`BufferId`] (an index into the ledger) and the ledger records which of the
//! four lifecycle states it is in. Every transition names the state it expects
//! to leave; a mismatch means the pool's own bookkeeping was bypassed, which is
//! a programming error and panics.

use std::fmt;

/// Index of a buffer inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl BufferId {
    /// Position of the buffer in the pool.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of one transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Allocated, owned by the pool, not handed to the stream.
    Free,
    /// Owned by the stream, waiting for a payload.
    Queued,
    /// Returned by the stream, not yet handed to decode.
    Filled,
    /// Being decoded / delivered by the acquisition loop.
    InUse,
}

/// Per-state buffer tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Buffers in [`SlotState::Free`].
    pub free: usize,
    /// Buffers in [`SlotState::Queued`].
    pub queued: usize,
    /// Buffers in [`SlotState::Filled`].
    pub filled: usize,
    /// Buffers in [`SlotState::InUse`].
    pub in_use: usize,
}

impl PoolCounts {
    /// Buffers currently cycling between stream and loop.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queued + self.filled + self.in_use
    }
}

#[derive(Debug)]
pub(crate) struct SlotLedger {
    states: Vec<SlotState>,
}

impl SlotLedger {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            states: vec![SlotState::Free; size],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn state(&self, id: BufferId) -> SlotState {
        self.states[id.0]
    }

    /// Move `id` from `from` to `to`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not belong to this ledger or is not in `from`.
    pub(crate) fn transition(&mut self, id: BufferId, from: SlotState, to: SlotState) {
        let slot = self
            .states
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("buffer {id} does not belong to this pool"));
        assert!(
            *slot == from,
            "buffer {id} expected in state {from:?} but is {slot:?} (requested {to:?})",
            slot = *slot
        );
        *slot = to;
    }

    /// Force every slot back to `Free` (teardown only).
    pub(crate) fn reset(&mut self) {
        self.states.fill(SlotState::Free);
    }

    pub(crate) fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for state in &self.states {
            match state {
                SlotState::Free => counts.free += 1,
                SlotState::Queued => counts.queued += 1,
                SlotState::Filled => counts.filled += 1,
                SlotState::InUse => counts.in_use += 1,
            }
        }
        counts
    }
}
