//! Error types for the acquisition pipeline.
//!
//! Two families, matching the two ways things go wrong:
//!
//! - **`AcqError`**: setup, teardown and configuration failures. These are
//!   returned immediately to the caller and abort whatever was being built
//!   (session, pool, acquisition). No retry happens inside the crate.
//! - **`IterationError`**: per-iteration failures of the acquisition loop.
//!   These are never propagated with `?`; they travel as values in the same
//!   output sequence as decoded frames so the caller keeps one item per
//!   iteration.
//!
//! Panics are reserved for violations of the pool's internal bookkeeping
//! (e.g. requeueing a buffer that is not in use).

use thiserror::Error;

use crate::device::{ConnectionId, Status};
use crate::payload::PayloadType;
use crate::pool::{AllocFailure, BufferId};

/// Convenience alias for results using the setup error type.
pub type Result<T> = std::result::Result<T, AcqError>;

/// Setup, teardown and configuration errors.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Unable to connect to device '{id}': {status}")]
    DeviceConnect { id: ConnectionId, status: Status },

    #[error("Unable to open stream from device '{id}': {status}")]
    StreamOpen { id: ConnectionId, status: Status },

    #[error("Unable to configure streaming for device '{id}': {status}")]
    StreamSetup { id: ConnectionId, status: Status },

    #[error("Device query failed: {0}")]
    Query(Status),

    #[error("{action} failed: {status}")]
    Command { action: &'static str, status: Status },

    #[error(
        "Unable to allocate transfer buffer {index} ({size} bytes); \
         released {allocated} buffer(s) allocated before it: {source}"
    )]
    Allocation {
        index: usize,
        size: usize,
        allocated: usize,
        #[source]
        source: AllocFailure,
    },

    #[error("Invalid buffer pool geometry: {0}")]
    PoolGeometry(String),

    #[error("Stream refused a buffer during pool setup: {0}")]
    BufferQueue(Status),

    #[error("Device session is closed")]
    SessionClosed,

    #[error("Acquisition requires streaming enabled and acquisition started")]
    NotStreaming,

    #[error("Buffers cannot be released while streaming is enabled")]
    StillStreaming,

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Acquisition loop thread panicked")]
    LoopPanicked,

    #[error("No device found")]
    NoDevice,

    #[error("No image acquired within {iterations} iteration(s)")]
    NoFrame { iterations: u64 },

    #[error("Device '{id}' cannot be used: {reason}")]
    DeviceUnusable { id: ConnectionId, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Shutdown failed: {}", summarize(.0))]
    ShutdownFailed(Vec<AcqError>),
}

fn summarize(errors: &[AcqError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AcqError {
    /// Collapse a list of teardown errors into one result.
    pub(crate) fn from_shutdown(mut errors: Vec<AcqError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(AcqError::ShutdownFailed(errors)),
        }
    }
}

/// Why a payload could not be turned into a valid image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFault {
    #[error(
        "decompressed size {actual} does not match {expected} bytes \
         predicted by pixel format and dimensions"
    )]
    SizeMismatch { expected: usize, actual: usize },

    #[error("payload holds {available} bytes but its geometry requires {required}")]
    Truncated { required: usize, available: usize },

    #[error("image payload carries no geometry")]
    MissingGeometry,

    #[error("pixel format {0:#010x} has no known pixel size")]
    UnknownPixelFormat(u32),

    #[error("could not decompress: {0}")]
    Decompression(String),
}

/// Category of a per-iteration error, used for tallies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retrieval failed at transport level; no buffer returned.
    TransientRetrieval,
    /// Buffer returned with a non-OK operational result.
    Operational,
    /// Payload contents do not match the declared payload type.
    FormatMismatch,
    /// Payload decoded to data inconsistent with its geometry.
    DecodeIntegrity,
    /// Payload type outside what the loop decodes.
    UnsupportedPayloadType,
}

/// Per-iteration acquisition failure. Never fatal to the loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IterationError {
    #[error("retrieval failed: {0}")]
    TransientRetrieval(Status),

    #[error("block {block_id} (buffer {buffer}) failed: {status}")]
    Operational {
        block_id: u64,
        buffer: BufferId,
        status: Status,
    },

    #[error("block {block_id}: contents do not match payload type ({reason})")]
    FormatMismatch { block_id: u64, reason: String },

    #[error("block {block_id}: {fault}")]
    DecodeIntegrity {
        block_id: u64,
        payload_type: PayloadType,
        fault: IntegrityFault,
    },

    #[error("block {block_id}: payload type {payload_type} not supported")]
    UnsupportedPayloadType {
        block_id: u64,
        payload_type: PayloadType,
    },
}

impl IterationError {
    /// Tally category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientRetrieval(_) => ErrorKind::TransientRetrieval,
            Self::Operational { .. } => ErrorKind::Operational,
            Self::FormatMismatch { .. } => ErrorKind::FormatMismatch,
            Self::DecodeIntegrity { .. } => ErrorKind::DecodeIntegrity,
            Self::UnsupportedPayloadType { .. } => ErrorKind::UnsupportedPayloadType,
        }
    }

    /// Payload type the error was raised for, when one was read.
    #[must_use]
    pub fn payload_type(&self) -> Option<PayloadType> {
        match self {
            Self::TransientRetrieval(_) | Self::Operational { .. } => None,
            Self::FormatMismatch { .. } => Some(PayloadType::CompressedImage),
            Self::DecodeIntegrity { payload_type, .. }
            | Self::UnsupportedPayloadType { payload_type, .. } => Some(*payload_type),
        }
    }

    /// Whether a buffer was returned by the stream for this iteration.
    #[must_use]
    pub fn had_buffer(&self) -> bool {
        !matches!(self, Self::TransientRetrieval(_))
    }
}
