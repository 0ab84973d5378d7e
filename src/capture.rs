//! End-to-end capture: session, pool, loop and the shutdown sequence.
//!
//! [`Acquisition`] performs the startup sequence
//!
//! 1. open the device session
//! 2. allocate and queue the buffer pool
//! 3. enable streaming
//! 4. execute `AcquisitionStart` (then wait out the configured start delay)
//! 5. start the acquisition loop
//!
//! and unwinds it in reverse on shutdown: stop and join the loop, execute
//! `AcquisitionStop`, disable streaming, release the pool, close the session.
//! A failure part-way through startup unwinds whatever was already set up
//! before the error is returned.
//!
//! [`snap`] runs the same sequence for a single image.

use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::acquisition::{
    AcquisitionLoop, Finished, FrameSink, Iteration, LoopReport, LoopState, StopHandle,
};
use crate::config::AcqConfig;
use crate::device::{ConnectionId, DeviceSystem};
use crate::error::{AcqError, Result};
use crate::payload::OwnedFrame;
use crate::pool::BufferPool;
use crate::session::Session;

/// Iterations [`snap`] waits for an image when no limit is configured.
pub const SNAP_ITERATIONS: u64 = 16;

/// A running acquisition pipeline.
#[derive(Debug)]
pub struct Acquisition {
    device: ConnectionId,
    running: Option<AcquisitionLoop>,
}

impl Acquisition {
    /// Bring up the pipeline for `id` and start delivering to `sink`.
    pub fn start<S>(
        system: &dyn DeviceSystem,
        id: &ConnectionId,
        config: &AcqConfig,
        sink: S,
    ) -> Result<Self>
    where
        S: FrameSink + 'static,
    {
        config.validate().map_err(AcqError::Configuration)?;

        let mut session = Session::open(system, id)?;
        let mut pool = match BufferPool::initialize(&mut session, config.acquisition.buffer_count)
        {
            Ok(pool) => pool,
            Err(e) => return Err(unwind(session, None, e)),
        };

        if let Err(e) = session.enable_streaming() {
            return Err(unwind(session, Some(pool), e));
        }
        if let Err(e) = session.start_acquisition() {
            return Err(unwind(session, Some(pool), e));
        }

        let delay = config.acquisition.start_delay;
        if !delay.is_zero() {
            info!(device = %id, delay_ms = delay.as_millis() as u64, "waiting before first retrieval");
            std::thread::sleep(delay);
        }

        let running = match AcquisitionLoop::start(session, pool, config.loop_config(), sink) {
            Ok(running) => running,
            Err(rejected) => {
                return Err(unwind(rejected.session, Some(rejected.pool), rejected.error));
            }
        };
        info!(device = %id, "acquisition pipeline running");

        Ok(Self {
            device: id.clone(),
            running: Some(running),
        })
    }

    /// Connection id of the device being acquired from.
    #[must_use]
    pub fn device(&self) -> &ConnectionId {
        &self.device
    }

    /// Handle for stopping the loop from elsewhere.
    #[must_use]
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.running.as_ref().map(AcquisitionLoop::stop_handle)
    }

    /// Current loop state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.running
            .as_ref()
            .map_or(LoopState::Idle, AcquisitionLoop::state)
    }

    /// Whether the loop has exited by itself (sink break or iteration limit).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.running
            .as_ref()
            .map_or(true, AcquisitionLoop::is_finished)
    }

    /// Stop the loop and run the shutdown sequence.
    pub fn shutdown(mut self) -> Result<LoopReport> {
        self.finish(true)
    }

    /// Wait for the loop to end by itself, then run the shutdown sequence.
    pub fn wait(mut self) -> Result<LoopReport> {
        self.finish(false)
    }

    fn finish(&mut self, request_stop: bool) -> Result<LoopReport> {
        let Some(running) = self.running.take() else {
            return Ok(LoopReport::default());
        };
        if request_stop {
            running.stop();
        }

        let Finished {
            mut session,
            mut pool,
            report,
        } = running.join()?;

        info!(
            device = %self.device,
            iterations = report.iterations,
            frames = report.frames,
            errors = report.errors.total(),
            "acquisition finished"
        );

        AcqError::from_shutdown(teardown(&mut session, &mut pool))?;
        Ok(report)
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.finish(true) {
                warn!(device = %self.device, error = %e, "shutdown of dropped acquisition failed");
            }
        }
    }
}

/// Reverse-order teardown. Every step runs; failures are collected.
fn teardown(session: &mut Session, pool: &mut BufferPool) -> Vec<AcqError> {
    let mut errors = Vec::new();

    if session.is_acquiring() {
        if let Err(e) = session.stop_acquisition() {
            errors.push(e);
        }
    }
    if session.is_streaming() {
        if let Err(e) = session.disable_streaming() {
            errors.push(e);
        }
    }
    if let Err(e) = pool.release_all(session) {
        errors.push(e);
    }
    if let Err(e) = session.close() {
        errors.push(e);
    }

    errors
}

/// Tear down a partially started pipeline and hand back the error that
/// caused it. Teardown failures are logged.
fn unwind(mut session: Session, pool: Option<BufferPool>, cause: AcqError) -> AcqError {
    warn!(device = %session.connection_id(), error = %cause, "startup failed, unwinding");

    let errors = match pool {
        Some(mut pool) => teardown(&mut session, &mut pool),
        None => session.close().err().into_iter().collect(),
    };
    for e in errors {
        warn!(device = %session.connection_id(), error = %e, "teardown after failed startup");
    }
    cause
}

/// Acquire a single image and shut everything down again.
///
/// Non-image iterations (errors, chunk data, ...) are skipped; the loop gives
/// up after `acquisition.max_iterations`, or [`SNAP_ITERATIONS`] when unset.
pub fn snap(system: &dyn DeviceSystem, id: &ConnectionId, config: &AcqConfig) -> Result<OwnedFrame> {
    let mut config = config.clone();
    config.acquisition.max_iterations =
        config.acquisition.max_iterations.or(Some(SNAP_ITERATIONS));

    let captured: Arc<Mutex<Option<OwnedFrame>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&captured);
    let sink = move |item: &Iteration<'_>| match &item.outcome {
        Ok(frame) if frame.image().is_some() => {
            *slot.lock() = Some(frame.to_owned_frame());
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    };

    let report = Acquisition::start(system, id, &config, sink)?.wait()?;
    let frame = captured.lock().take();
    frame.ok_or(AcqError::NoFrame {
        iterations: report.iterations,
    })
}
