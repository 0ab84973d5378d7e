//! # acq-stream
//!
//! Buffered frame acquisition from GigE Vision / USB3 Vision class imaging
//! devices.
//!
//! A fixed pool of transfer buffers cycles between the device's data stream
//! and application code. Every completed buffer is classified by payload
//! type, decoded (decompressed when needed) into a borrowed frame view,
//! delivered to a sink, and handed back to the stream before the next one is
//! retrieved. Per-frame failures are delivered as values alongside frames;
//! setup and teardown failures are returned as [`AcqError`].
//!
//! ## Crate Structure
//!
//! - **`device`**: the device/stream contract ([`device::DeviceSystem`],
//!   [`device::Device`], [`device::Stream`]), device selection, and a
//!   simulated implementation.
//! - **`session`**: [`Session`], one connected device plus its stream.
//! - **`pool`**: [`BufferPool`], the bounded set of transfer buffers.
//! - **`payload`**: payload classification, decoding and decompression.
//! - **`acquisition`**: the [`AcquisitionLoop`] thread and its sinks.
//! - **`capture`**: startup/shutdown sequencing ([`Acquisition`]) and
//!   single-frame [`snap`].
//! - **`config`**, **`logging`**: figment configuration and tracing setup.
//!
//! ## Example
//!
//! ```no_run
//! use std::ops::ControlFlow;
//! use acq_stream::acquisition::Iteration;
//! use acq_stream::device::mock::{CameraSpec, SimulatedSystem};
//! use acq_stream::{Acquisition, AcqConfig};
//!
//! let system = SimulatedSystem::new();
//! system.add_camera("cam0", CameraSpec::gev(640 * 480).continuous(640, 480));
//!
//! let acquisition = Acquisition::start(
//!     &system,
//!     &"cam0".into(),
//!     &AcqConfig::default(),
//!     |item: &Iteration<'_>| {
//!         if let Ok(frame) = &item.outcome {
//!             println!("block {} ({})", frame.block_id, frame.payload_type());
//!         }
//!         ControlFlow::Continue(())
//!     },
//! )?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! let report = acquisition.shutdown()?;
//! println!("{} frames", report.frames);
//! # Ok::<(), acq_stream::AcqError>(())
//! ```

pub mod acquisition;
pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod payload;
pub mod pool;
pub mod session;

pub use acquisition::{AcquisitionLoop, FrameSink, Iteration, LoopConfig, LoopReport, StopHandle};
pub use capture::{snap, Acquisition};
pub use config::AcqConfig;
pub use error::{AcqError, IterationError, Result};
pub use payload::{AcquiredFrame, OwnedFrame, PayloadType, PixelFormat};
pub use pool::BufferPool;
pub use session::Session;
