//! Consumers of loop iterations.

use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tracing::debug;

use crate::device::StreamStatistics;
use crate::error::IterationError;
use crate::payload::{AcquiredFrame, OwnedFrame, PayloadType};
use crate::pool::PoolCounts;

/// One completed loop iteration, handed to the sink by reference.
///
/// A decoded frame borrows pool memory and is only valid for the duration
/// of [`FrameSink::deliver`].
#[derive(Debug)]
pub struct Iteration<'a> {
    /// Zero-based iteration number.
    pub index: u64,
    /// Decoded frame or the reason there is none.
    pub outcome: Result<AcquiredFrame<'a>, IterationError>,
    /// Stream counters read during this iteration.
    pub statistics: StreamStatistics,
    /// Pool state while the item is being delivered.
    pub pool: PoolCounts,
}

impl Iteration<'_> {
    /// Payload type of the frame or of the failed payload, when known.
    #[must_use]
    pub fn payload_type(&self) -> Option<PayloadType> {
        match &self.outcome {
            Ok(frame) => Some(frame.payload_type()),
            Err(e) => e.payload_type(),
        }
    }

    /// Copy the iteration out of pool memory.
    #[must_use]
    pub fn to_owned_iteration(&self) -> OwnedIteration {
        OwnedIteration {
            index: self.index,
            outcome: self
                .outcome
                .as_ref()
                .map(AcquiredFrame::to_owned_frame)
                .map_err(Clone::clone),
            statistics: self.statistics,
        }
    }
}

/// An [`Iteration`] whose frame was copied out of pool memory.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedIteration {
    /// Zero-based iteration number.
    pub index: u64,
    /// Copied frame or the reason there is none.
    pub outcome: Result<OwnedFrame, IterationError>,
    /// Stream counters read during the iteration.
    pub statistics: StreamStatistics,
}

/// Receives every iteration of the acquisition loop, in order, on the loop
/// thread.
///
/// Returning [`ControlFlow::Break`] stops the loop once the current buffer
/// has been requeued.
pub trait FrameSink: Send {
    /// Consume one iteration.
    fn deliver(&mut self, item: &Iteration<'_>) -> ControlFlow<()>;
}

impl<F> FrameSink for F
where
    F: FnMut(&Iteration<'_>) -> ControlFlow<()> + Send,
{
    fn deliver(&mut self, item: &Iteration<'_>) -> ControlFlow<()> {
        self(item)
    }
}

/// Forwards copied iterations over a bounded tokio channel.
///
/// The loop thread blocks while the channel is full. A dropped receiver
/// stops the loop.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<OwnedIteration>,
}

impl ChannelSink {
    /// Sink feeding `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<OwnedIteration>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of a fresh channel of `capacity` items.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OwnedIteration>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&mut self, item: &Iteration<'_>) -> ControlFlow<()> {
        match self.tx.blocking_send(item.to_owned_iteration()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => {
                debug!(index = item.index, "frame receiver dropped, stopping");
                ControlFlow::Break(())
            }
        }
    }
}
