//! Bounded pool of transfer buffers cycled between the stream and the
//! acquisition loop.
//!
//! The pool is sized once at initialization,
//! `min(requested, stream max queueable)`, and never grows. Every buffer is
//! allocated up front (all allocations before any queueing) and then handed
//! to the stream. From then on a buffer value is always in exactly one place:
//!
//! ```text
//!   Free ──queue──▶ Queued ──stream completes──▶ Filled ──decode──▶ InUse
//!                     ▲                                               │
//!                     └──────────────────── requeue ──────────────────┘
//! ```
//!
//! An internal ledger mirrors those states by [`BufferId`]; a transition
//! that does not start from the expected state panics.

mod buffer;
mod ledger;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{Retrieved, Stream};
use crate::error::{AcqError, Result};
use crate::session::Session;

pub use buffer::{BufferLeader, ImageLeader, TransferBuffer};
pub use ledger::{BufferId, PoolCounts, SlotState};

use ledger::SlotLedger;

/// Default number of buffers requested from the stream.
pub const DEFAULT_BUFFER_COUNT: usize = 16;

/// Wait per retrieval while draining aborted buffers.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Retrieval attempts allowed per pool buffer while draining.
const DRAIN_ATTEMPTS_PER_BUFFER: usize = 4;

/// Memory for a transfer buffer could not be reserved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not reserve {requested} bytes: {reason}")]
pub struct AllocFailure {
    /// Bytes requested.
    pub requested: usize,
    /// Allocator-supplied reason.
    pub reason: String,
}

/// Source of transfer buffer memory.
pub trait BufferAllocator {
    /// Reserve `size` zeroed bytes.
    fn allocate(&mut self, size: usize) -> std::result::Result<Vec<u8>, AllocFailure>;
}

/// Fallible heap allocation via `Vec::try_reserve_exact`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> std::result::Result<Vec<u8>, AllocFailure> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|e| AllocFailure {
                requested: size,
                reason: e.to_string(),
            })?;
        memory.resize(size, 0);
        Ok(memory)
    }
}

/// Outcome of [`BufferPool::release_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Buffers retrieved back from the stream after the abort.
    pub recovered: usize,
    /// Buffers the pool was holding because the stream had refused them.
    pub parked: usize,
    /// Buffers the stream still reported as queued when draining gave up.
    pub outstanding: usize,
}

/// Fixed-size pool of transfer buffers bound to one session's stream.
#[derive(Debug)]
pub struct BufferPool {
    ledger: SlotLedger,
    buffer_size: usize,
    parked: Vec<TransferBuffer>,
    released: bool,
}

impl BufferPool {
    /// Allocate and queue `requested` buffers (capped by the stream) on the
    /// heap.
    pub fn initialize(session: &mut Session, requested: usize) -> Result<Self> {
        Self::initialize_with(session, requested, &mut HeapAllocator)
    }

    /// Allocate and queue buffers with a custom allocator.
    ///
    /// Allocation failure releases everything allocated so far. A stream
    /// that refuses a buffer causes the already queued ones to be aborted and
    /// drained before the error is returned.
    pub fn initialize_with(
        session: &mut Session,
        requested: usize,
        allocator: &mut dyn BufferAllocator,
    ) -> Result<Self> {
        let buffer_size = session.payload_size()?;
        let max_queueable = session.max_queueable()?;
        let size = requested.min(max_queueable);

        if size == 0 {
            return Err(AcqError::PoolGeometry(format!(
                "{requested} buffer(s) requested, stream accepts at most {max_queueable}"
            )));
        }
        if buffer_size == 0 {
            return Err(AcqError::PoolGeometry(
                "device reports a payload size of 0 bytes".into(),
            ));
        }
        if size < requested {
            debug!(
                requested,
                max_queueable, "buffer count capped by stream queue capacity"
            );
        }

        let mut buffers = Vec::with_capacity(size);
        for index in 0..size {
            match allocator.allocate(buffer_size) {
                Ok(memory) => buffers.push(TransferBuffer::new(BufferId(index), memory)),
                Err(source) => {
                    let allocated = buffers.len();
                    drop(buffers);
                    return Err(AcqError::Allocation {
                        index,
                        size: buffer_size,
                        allocated,
                        source,
                    });
                }
            }
        }

        let mut pool = Self {
            ledger: SlotLedger::new(size),
            buffer_size,
            parked: Vec::new(),
            released: false,
        };

        let stream = session.stream_mut()?;
        for buffer in buffers {
            let id = buffer.id();
            pool.ledger.transition(id, SlotState::Free, SlotState::Queued);
            if let Err(rejected) = stream.queue(buffer) {
                pool.ledger.transition(id, SlotState::Queued, SlotState::Free);
                drop(rejected.buffer);
                let report = pool.drain(stream);
                pool.released = true;
                warn!(
                    buffer = %id,
                    status = %rejected.status,
                    recovered = report.recovered,
                    outstanding = report.outstanding,
                    "stream refused buffer during pool setup, rolled back"
                );
                return Err(AcqError::BufferQueue(rejected.status));
            }
        }

        info!(
            pool_size = size,
            buffer_size, requested, "buffer pool initialized"
        );
        Ok(pool)
    }

    /// Number of buffers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.ledger.len()
    }

    /// Size of each buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Per-state buffer tallies.
    #[must_use]
    pub fn counts(&self) -> PoolCounts {
        self.ledger.counts()
    }

    /// State of one buffer.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this pool.
    #[must_use]
    pub fn state(&self, id: BufferId) -> SlotState {
        self.ledger.state(id)
    }

    /// Record that the stream handed `id` back (`Queued → Filled`).
    pub(crate) fn mark_filled(&mut self, id: BufferId) {
        self.ledger.transition(id, SlotState::Queued, SlotState::Filled);
    }

    /// Record that `id` is being decoded and delivered (`Filled → InUse`).
    pub(crate) fn begin_processing(&mut self, id: BufferId) {
        self.ledger.transition(id, SlotState::Filled, SlotState::InUse);
    }

    /// Hand an in-use buffer back to the stream (`InUse → Queued`).
    ///
    /// Buffers the stream previously refused are retried first. A refusal
    /// parks the buffer in the pool as `Free` and is logged; it never fails
    /// the caller.
    ///
    /// # Panics
    ///
    /// Panics if the ledger does not consider `buffer` in use.
    pub fn requeue(&mut self, stream: &mut dyn Stream, mut buffer: TransferBuffer) {
        self.ledger
            .transition(buffer.id(), SlotState::InUse, SlotState::Queued);
        buffer.clear();

        self.retry_parked(stream);
        self.submit(stream, buffer);
    }

    /// Offer every parked buffer to the stream again (`Free → Queued`).
    ///
    /// Buffers the stream still refuses stay parked.
    pub(crate) fn retry_parked(&mut self, stream: &mut dyn Stream) {
        if self.parked.is_empty() {
            return;
        }
        for parked in std::mem::take(&mut self.parked) {
            self.ledger
                .transition(parked.id(), SlotState::Free, SlotState::Queued);
            self.submit(stream, parked);
        }
        if self.parked.is_empty() {
            debug!("parked buffers requeued");
        }
    }

    /// Buffers held back after the stream refused them.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    fn submit(&mut self, stream: &mut dyn Stream, buffer: TransferBuffer) {
        if let Err(rejected) = stream.queue(buffer) {
            let id = rejected.buffer.id();
            self.ledger.transition(id, SlotState::Queued, SlotState::Free);
            warn!(buffer = %id, status = %rejected.status, "stream refused requeue, buffer parked");
            self.parked.push(rejected.buffer);
        }
    }

    /// Take every buffer back from the stream and free the pool's memory.
    ///
    /// Streaming must already be disabled. Queued buffers are aborted and
    /// the resulting completions are retrieved without processing, with a
    /// bounded number of attempts. Calling this again is a no-op.
    pub fn release_all(&mut self, session: &mut Session) -> Result<DrainReport> {
        if self.released {
            return Ok(DrainReport::default());
        }
        if session.is_streaming() {
            return Err(AcqError::StillStreaming);
        }

        let stream = session.stream_mut()?;
        let report = self.drain(stream);
        self.released = true;

        if report.outstanding > 0 {
            warn!(
                outstanding = report.outstanding,
                "stream still holds buffers after drain"
            );
        }
        info!(
            recovered = report.recovered,
            parked = report.parked,
            "buffer pool released"
        );
        Ok(report)
    }

    fn drain(&mut self, stream: &mut dyn Stream) -> DrainReport {
        if let Err(status) = stream.abort_queued() {
            warn!(%status, "aborting queued buffers failed");
        }

        let parked = self.parked.len();
        self.parked.clear();

        let mut recovered = 0;
        let mut attempts = self.ledger.len() * DRAIN_ATTEMPTS_PER_BUFFER;
        while stream.queued_count() > 0 && attempts > 0 {
            attempts -= 1;
            match stream.retrieve(DRAIN_TIMEOUT) {
                Ok(Retrieved { buffer, operational }) => {
                    debug!(buffer = %buffer.id(), %operational, "drained buffer");
                    recovered += 1;
                }
                Err(status) => debug!(%status, "drain retrieval returned no buffer"),
            }
        }

        self.ledger.reset();
        DrainReport {
            recovered,
            parked,
            outstanding: stream.queued_count(),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.released && self.ledger.counts().in_flight() > 0 {
            warn!(
                in_flight = self.ledger.counts().in_flight(),
                "buffer pool dropped without release_all"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{CameraSpec, SimulatedSystem};
    use crate::device::{Status, StatusCode};

    fn open(system: &SimulatedSystem, id: &str) -> Session {
        Session::open(system, &id.into()).unwrap()
    }

    #[test]
    fn pool_size_is_capped_by_stream_capacity() {
        let system = SimulatedSystem::new();
        system.add_camera("cam0", CameraSpec::gev(4096).max_queued(8));
        let mut session = open(&system, "cam0");

        let mut pool = BufferPool::initialize(&mut session, DEFAULT_BUFFER_COUNT).unwrap();
        assert_eq!(pool.size(), 8);
        assert_eq!(pool.buffer_size(), 4096);
        assert_eq!(pool.counts().queued, 8);
        assert_eq!(system.log("cam0").queued_now, 8);

        pool.release_all(&mut session).unwrap();
    }

    #[test]
    fn zero_buffers_is_a_geometry_error() {
        let system = SimulatedSystem::new();
        system.add_camera("cam0", CameraSpec::u3v(64));
        let mut session = open(&system, "cam0");

        let err = BufferPool::initialize(&mut session, 0).unwrap_err();
        assert!(matches!(err, AcqError::PoolGeometry(_)));
    }

    struct FailAfter(usize);

    impl BufferAllocator for FailAfter {
        fn allocate(&mut self, size: usize) -> std::result::Result<Vec<u8>, AllocFailure> {
            if self.0 == 0 {
                return Err(AllocFailure {
                    requested: size,
                    reason: "out of memory".into(),
                });
            }
            self.0 -= 1;
            Ok(vec![0; size])
        }
    }

    #[test]
    fn allocation_failure_queues_nothing() {
        let system = SimulatedSystem::new();
        system.add_camera("cam0", CameraSpec::u3v(256));
        let mut session = open(&system, "cam0");

        let err = BufferPool::initialize_with(&mut session, 4, &mut FailAfter(2)).unwrap_err();
        match err {
            AcqError::Allocation {
                index, allocated, ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(allocated, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(system.log("cam0").queue_calls, 0);
    }

    #[test]
    fn refused_queue_during_setup_rolls_back() {
        let system = SimulatedSystem::new();
        system.add_camera("cam0", CameraSpec::u3v(256).reject_queue_after(3));
        let mut session = open(&system, "cam0");

        let err = BufferPool::initialize(&mut session, 6).unwrap_err();
        assert!(matches!(err, AcqError::BufferQueue(ref s) if s.code == StatusCode::QueueFull));
        assert_eq!(system.log("cam0").queued_now, 0);
    }

    #[test]
    fn failed_payload_query_allocates_nothing() {
        let system = SimulatedSystem::new();
        system.add_camera(
            "cam0",
            CameraSpec::u3v(256).fail_payload_query(Status::new(
                StatusCode::NotConnected,
                "PayloadSize unreadable",
            )),
        );
        let mut session = open(&system, "cam0");

        let err = BufferPool::initialize(&mut session, 4).unwrap_err();
        assert!(matches!(err, AcqError::Query(ref s) if s.code == StatusCode::NotConnected));
        assert_eq!(system.log("cam0").queue_calls, 0);
    }

    #[test]
    fn refused_requeue_is_parked_then_retried() {
        let system = SimulatedSystem::new();
        // Call 0 queues the only buffer at setup; call 1 is the first requeue.
        system.add_camera("cam0", CameraSpec::u3v(64).frames(2).reject_queue_call(1));
        let mut session = open(&system, "cam0");
        let mut pool = BufferPool::initialize(&mut session, 1).unwrap();
        session.enable_streaming().unwrap();
        session.start_acquisition().unwrap();

        let stream = session.stream_mut().unwrap();
        let retrieved = stream.retrieve(Duration::from_millis(50)).unwrap();
        let id = retrieved.buffer.id();
        pool.mark_filled(id);
        pool.begin_processing(id);
        pool.requeue(stream, retrieved.buffer);

        assert_eq!(pool.state(id), SlotState::Free);
        assert_eq!(pool.parked(), 1);
        assert_eq!(pool.counts().in_flight(), 0);

        pool.retry_parked(stream);
        assert_eq!(pool.state(id), SlotState::Queued);
        assert_eq!(pool.parked(), 0);
        assert_eq!(system.log("cam0").queued_now, 1);

        session.stop_acquisition().unwrap();
        session.disable_streaming().unwrap();
        pool.release_all(&mut session).unwrap();
    }

    #[test]
    fn release_requires_streaming_disabled() {
        let system = SimulatedSystem::new();
        system.add_camera("cam0", CameraSpec::u3v(256));
        let mut session = open(&system, "cam0");
        let mut pool = BufferPool::initialize(&mut session, 4).unwrap();

        session.enable_streaming().unwrap();
        assert!(matches!(
            pool.release_all(&mut session),
            Err(AcqError::StillStreaming)
        ));

        session.disable_streaming().unwrap();
        let report = pool.release_all(&mut session).unwrap();
        assert_eq!(report.recovered, 4);
        assert_eq!(report.outstanding, 0);
        assert_eq!(pool.counts().free, 4);

        assert_eq!(pool.release_all(&mut session).unwrap(), DrainReport::default());
    }

    #[test]
    #[should_panic(expected = "expected in state InUse")]
    fn requeue_of_buffer_not_in_use_panics() {
        let system = SimulatedSystem::new();
        system.add_camera("cam0", CameraSpec::u3v(64).frames(1));
        let mut session = open(&system, "cam0");
        let mut pool = BufferPool::initialize(&mut session, 2).unwrap();
        session.enable_streaming().unwrap();
        session.start_acquisition().unwrap();

        let stream = session.stream_mut().unwrap();
        let retrieved = stream.retrieve(Duration::from_millis(50)).unwrap();
        pool.mark_filled(retrieved.buffer.id());
        pool.requeue(stream, retrieved.buffer);
    }
}
