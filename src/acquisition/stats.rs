//! Loop counters.

use std::time::Duration;

use crate::device::StreamStatistics;
use crate::error::ErrorKind;

/// Per-kind count of iteration errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorTally {
    /// Retrievals that returned no buffer (including timeouts).
    pub transient_retrieval: u64,
    /// Buffers returned with a non-OK operational result.
    pub operational: u64,
    /// Payloads whose contents did not match their type.
    pub format_mismatch: u64,
    /// Payloads that failed size or decompression checks.
    pub decode_integrity: u64,
    /// Payloads of a type the loop does not decode.
    pub unsupported_payload_type: u64,
}

impl ErrorTally {
    /// Count one error of `kind`.
    pub fn record(&mut self, kind: ErrorKind) {
        *self.slot(kind) += 1;
    }

    /// Errors counted for `kind`.
    #[must_use]
    pub fn get(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::TransientRetrieval => self.transient_retrieval,
            ErrorKind::Operational => self.operational,
            ErrorKind::FormatMismatch => self.format_mismatch,
            ErrorKind::DecodeIntegrity => self.decode_integrity,
            ErrorKind::UnsupportedPayloadType => self.unsupported_payload_type,
        }
    }

    /// Errors of every kind.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.transient_retrieval
            + self.operational
            + self.format_mismatch
            + self.decode_integrity
            + self.unsupported_payload_type
    }

    fn slot(&mut self, kind: ErrorKind) -> &mut u64 {
        match kind {
            ErrorKind::TransientRetrieval => &mut self.transient_retrieval,
            ErrorKind::Operational => &mut self.operational,
            ErrorKind::FormatMismatch => &mut self.format_mismatch,
            ErrorKind::DecodeIntegrity => &mut self.decode_integrity,
            ErrorKind::UnsupportedPayloadType => &mut self.unsupported_payload_type,
        }
    }
}

/// Summary returned when the loop thread is joined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopReport {
    /// Completed iterations (items delivered to the sink).
    pub iterations: u64,
    /// Iterations that produced a frame.
    pub frames: u64,
    /// Calls to retrieve.
    pub retrievals: u64,
    /// Buffers handed back to the stream.
    pub requeues: u64,
    /// Iteration errors by kind.
    pub errors: ErrorTally,
    /// Stream statistics read on the last iteration.
    pub last_statistics: StreamStatistics,
    /// Time between the first retrieval and the loop exiting.
    pub elapsed: Duration,
}
