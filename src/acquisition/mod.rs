//! Acquisition loop.
//!
//! The loop owns the session and the buffer pool for as long as it runs: both
//! are moved onto a dedicated, named thread and handed back by
//! [`AcquisitionLoop::join`]. Each iteration:
//!
//! 1. waits (bounded) for the next completed buffer
//! 2. classifies the result: transport failure, operational failure, or a
//!    payload to decode
//! 3. delivers one [`Iteration`] to the [`FrameSink`]
//! 4. requeues the buffer, whatever happened in 2 and 3
//!
//! Stop requests are honoured only between iterations, so stop latency is at
//! most one retrieval timeout plus one decode.
//!
//! ```text
//!   Idle ──start──▶ Running ──stop / sink Break / max_iterations──▶ Stopping ──join──▶ Idle
//! ```

mod sink;
mod stats;

pub use sink::{ChannelSink, FrameSink, Iteration, OwnedIteration};
pub use stats::{ErrorTally, LoopReport};

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::device::Retrieved;
use crate::error::{AcqError, IterationError, Result};
use crate::payload::{decode, DecompressionFilter};
use crate::pool::BufferPool;
use crate::session::Session;

/// Default bounded wait for one retrieval.
pub const DEFAULT_RETRIEVE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Loop parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Bounded wait for one retrieval.
    pub retrieve_timeout: Duration,
    /// Stop after this many iterations.
    pub max_iterations: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            retrieve_timeout: DEFAULT_RETRIEVE_TIMEOUT,
            max_iterations: None,
        }
    }
}

/// Lifecycle state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not running: never started, or the loop thread has exited.
    Idle,
    /// Iterating.
    Running,
    /// Told to stop or finishing its last iteration.
    Stopping,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Idle,
        }
    }
}

/// Cloneable handle to request a stop from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(LoopState::Idle as u8)),
        }
    }

    /// Ask the loop to stop after the current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.state.compare_exchange(
            LoopState::Running as u8,
            LoopState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Current loop state.
    ///
    /// A handle cannot observe the thread itself, so after the loop ends on
    /// its own this reports [`LoopState::Stopping`] until it is joined.
    #[must_use]
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// The loop refused to start; the session and pool are handed back.
#[derive(Error, Debug)]
#[error("acquisition loop not started: {error}")]
pub struct StartRejected {
    /// Why the loop did not start.
    #[source]
    pub error: AcqError,
    /// The session passed to [`AcquisitionLoop::start`].
    pub session: Session,
    /// The pool passed to [`AcquisitionLoop::start`].
    pub pool: BufferPool,
}

impl From<StartRejected> for AcqError {
    fn from(rejected: StartRejected) -> Self {
        rejected.error
    }
}

/// What the loop thread hands back on join.
#[derive(Debug)]
pub struct Finished {
    /// The session, still open.
    pub session: Session,
    /// The pool, all buffers queued (or parked).
    pub pool: BufferPool,
    /// Loop counters.
    pub report: LoopReport,
}

/// A running acquisition loop.
#[derive(Debug)]
pub struct AcquisitionLoop {
    control: StopHandle,
    thread: Option<JoinHandle<Finished>>,
}

impl AcquisitionLoop {
    /// Move `session` and `pool` onto a new loop thread and start iterating.
    ///
    /// The session must have streaming enabled and acquisition started.
    pub fn start<S>(
        session: Session,
        pool: BufferPool,
        config: LoopConfig,
        sink: S,
    ) -> std::result::Result<Self, StartRejected>
    where
        S: FrameSink + 'static,
    {
        if !session.is_streaming() || !session.is_acquiring() {
            return Err(StartRejected {
                error: AcqError::NotStreaming,
                session,
                pool,
            });
        }

        let control = StopHandle::new();
        control.set_state(LoopState::Running);

        let name = format!("acq-{}", session.connection_id());
        // Parked here so a failed spawn can hand them back.
        let parts = Arc::new(Mutex::new(Some((session, pool))));
        let thread_parts = Arc::clone(&parts);
        let thread_control = control.clone();

        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            let (session, pool) = thread_parts
                .lock()
                .take()
                .unwrap_or_else(|| unreachable!("loop parts taken twice"));
            let finished = run(session, pool, sink, config, &thread_control);
            thread_control.set_state(LoopState::Stopping);
            finished
        });

        match spawned {
            Ok(thread) => Ok(Self {
                control,
                thread: Some(thread),
            }),
            Err(e) => {
                control.set_state(LoopState::Idle);
                let (session, pool) = parts
                    .lock()
                    .take()
                    .unwrap_or_else(|| unreachable!("loop parts taken by a thread that never ran"));
                Err(StartRejected {
                    error: AcqError::Spawn(e),
                    session,
                    pool,
                })
            }
        }
    }

    /// Handle for stopping the loop from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.control.clone()
    }

    /// Ask the loop to stop after the current iteration.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Current loop state; [`LoopState::Idle`] once the thread has exited.
    #[must_use]
    pub fn state(&self) -> LoopState {
        if self.is_finished() {
            LoopState::Idle
        } else {
            self.control.state()
        }
    }

    /// Whether the loop thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the loop thread to exit and take back session and pool.
    ///
    /// Does not request a stop; call [`AcquisitionLoop::stop`] first unless
    /// the loop ends by itself.
    pub fn join(mut self) -> Result<Finished> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<Finished> {
        let thread = self.thread.take().ok_or(AcqError::LoopPanicked)?;
        let joined = thread.join();
        self.control.set_state(LoopState::Idle);
        joined.map_err(|_| AcqError::LoopPanicked)
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.control.stop();
            if let Err(e) = self.join_thread() {
                error!(error = %e, "acquisition loop dropped while running");
            }
        }
    }
}

fn run<S: FrameSink>(
    mut session: Session,
    mut pool: BufferPool,
    mut sink: S,
    config: LoopConfig,
    control: &StopHandle,
) -> Finished {
    let device = session.connection_id().clone();
    let mut filter = DecompressionFilter::new();
    let mut report = LoopReport::default();
    let started = Instant::now();

    info!(
        %device,
        pool_size = pool.size(),
        timeout_ms = config.retrieve_timeout.as_millis() as u64,
        "acquisition loop running"
    );

    while !control.is_stop_requested() {
        if config
            .max_iterations
            .is_some_and(|max| report.iterations >= max)
        {
            debug!(%device, iterations = report.iterations, "iteration limit reached");
            break;
        }

        let stream = match session.stream_mut() {
            Ok(stream) => stream,
            Err(e) => {
                error!(%device, error = %e, "stream unavailable, leaving loop");
                break;
            }
        };

        pool.retry_parked(stream);

        let index = report.iterations;
        report.retrievals += 1;

        let flow = match stream.retrieve(config.retrieve_timeout) {
            Err(status) => {
                let item = Iteration {
                    index,
                    outcome: Err(IterationError::TransientRetrieval(status)),
                    statistics: stream.statistics(),
                    pool: pool.counts(),
                };
                account(&mut report, &item);
                sink.deliver(&item)
            }
            Ok(Retrieved { buffer, operational }) => {
                let id = buffer.id();
                pool.mark_filled(id);
                pool.begin_processing(id);

                let flow = {
                    let outcome = if operational.is_ok() {
                        decode(&buffer, &mut filter)
                    } else {
                        Err(IterationError::Operational {
                            block_id: buffer.leader().block_id,
                            buffer: id,
                            status: operational,
                        })
                    };
                    let item = Iteration {
                        index,
                        outcome,
                        statistics: stream.statistics(),
                        pool: pool.counts(),
                    };
                    account(&mut report, &item);
                    sink.deliver(&item)
                };

                pool.requeue(stream, buffer);
                report.requeues += 1;
                flow
            }
        };

        if flow.is_break() {
            debug!(%device, index, "sink requested stop");
            control.stop();
        }
    }

    report.elapsed = started.elapsed();
    info!(
        %device,
        iterations = report.iterations,
        frames = report.frames,
        errors = report.errors.total(),
        "acquisition loop exited"
    );

    Finished {
        session,
        pool,
        report,
    }
}

fn account(report: &mut LoopReport, item: &Iteration<'_>) {
    report.iterations += 1;
    report.last_statistics = item.statistics;

    match &item.outcome {
        Ok(frame) => {
            report.frames += 1;
            trace!(
                index = item.index,
                block_id = frame.block_id,
                payload = %frame.payload_type(),
                rate_hz = item.statistics.acquisition_rate_hz,
                bandwidth_bps = item.statistics.bandwidth_bps,
                "frame delivered"
            );
            if let Some(ratio) = frame.compression_ratio() {
                debug!(block_id = frame.block_id, ratio, "compressed frame decoded");
            }
        }
        Err(e) => {
            report.errors.record(e.kind());
            match e {
                IterationError::TransientRetrieval(status) => {
                    debug!(index = item.index, %status, "retrieval returned no buffer");
                }
                other => warn!(index = item.index, error = %other, "iteration failed"),
            }
        }
    }
}
