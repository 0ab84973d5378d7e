//! Device / stream collaborator contract.
//!
//! The acquisition pipeline never talks to a vendor SDK directly. Everything it
//! needs from the outside world is expressed by three traits:
//!
//! - [`DeviceSystem`]: enumerates devices and creates device/stream handles
//!   for a connection id
//! - [`Device`]: one connected imaging device (payload size, streaming
//!   control, acquisition commands)
//! - [`Stream`]: the data stream fed by that device (buffer queue, retrieval,
//!   statistics)
//!
//! Collaborator results are reported as [`Status`] values carrying a
//! [`StatusCode`] plus a human-readable description, mirroring the
//! code-string / description pairs GigE Vision SDKs return.
//!
//! A simulated implementation lives in [`mock`].

pub mod discovery;
pub mod mock;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::pool::TransferBuffer;

/// Identifier used to connect to a device and open its stream.
///
/// For GigE Vision devices this is usually an IP or MAC address; for USB3
/// Vision devices a GUID. The pipeline treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap a connection identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Result codes reported by the device/stream collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// A bounded wait expired.
    Timeout,
    /// The operation was aborted (e.g. buffers aborted at teardown).
    Aborted,
    /// Packets of the block were lost on the wire.
    MissingPackets,
    /// Packet resend requests were exhausted.
    TooManyResends,
    /// The payload did not fit in the queued buffer.
    BufferTooSmall,
    /// The stream has no buffer queued to receive data.
    NoBufferQueued,
    /// The stream cannot accept more queued buffers.
    QueueFull,
    /// The device or stream is not connected.
    NotConnected,
    /// The requested device could not be found.
    NotFound,
    /// The device was found but refused the connection.
    AccessDenied,
    /// The device or transport does not support the operation.
    NotSupported,
    /// Any other collaborator failure.
    Generic,
}

impl StatusCode {
    /// Code string as printed in diagnostics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Timeout => "TIMEOUT",
            Self::Aborted => "ABORTED",
            Self::MissingPackets => "MISSING_PACKETS",
            Self::TooManyResends => "TOO_MANY_RESENDS",
            Self::BufferTooSmall => "BUFFER_TOO_SMALL",
            Self::NoBufferQueued => "NO_BUFFER_QUEUED",
            Self::QueueFull => "QUEUE_FULL",
            Self::NotConnected => "NOT_CONNECTED",
            Self::NotFound => "NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Generic => "GENERIC_ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collaborator result: code plus description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code} ({description})")]
pub struct Status {
    /// Result code.
    pub code: StatusCode,
    /// Free-form description supplied by the collaborator.
    pub description: String,
}

impl Status {
    /// Build a status from a code and description.
    pub fn new(code: StatusCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Successful status with an empty description.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    /// Timeout status.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(StatusCode::Timeout, "no buffer completed within the wait")
    }

    /// Whether the code is [`StatusCode::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// Transport class of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Networked GigE Vision device: needs packet size negotiation and a
    /// stream destination before it can push data.
    Gev,
    /// Directly attached USB3 Vision device.
    U3v,
}

impl TransportKind {
    /// Whether the device is networked (GEV-class).
    #[must_use]
    pub fn is_networked(self) -> bool {
        matches!(self, Self::Gev)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gev => f.write_str("GigE Vision"),
            Self::U3v => f.write_str("USB3 Vision"),
        }
    }
}

/// GenICam acquisition commands understood by [`Device::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    /// `AcquisitionStart`
    AcquisitionStart,
    /// `AcquisitionStop`
    AcquisitionStop,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcquisitionStart => f.write_str("AcquisitionStart"),
            Self::AcquisitionStop => f.write_str("AcquisitionStop"),
        }
    }
}

/// One enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Id to pass to [`DeviceSystem::connect`] / [`DeviceSystem::open_stream`].
    pub connection_id: ConnectionId,
    /// Human-readable label (vendor, model, address).
    pub display_id: String,
    /// Display id of the interface (NIC or USB host controller) it was found on.
    pub interface_id: String,
    /// Transport class.
    pub transport: TransportKind,
    /// Whether the device can be connected as found. A GEV device on the
    /// wrong subnet or a USB device on a USB2 port reports `false`.
    pub configuration_valid: bool,
}

/// Cumulative counters read from the stream once per loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStatistics {
    /// `AcquisitionRate` counter, frames per second.
    pub acquisition_rate_hz: f64,
    /// `Bandwidth` counter, bits per second.
    pub bandwidth_bps: f64,
    /// Blocks completed by the stream since it was opened.
    pub blocks_completed: u64,
}

/// A buffer handed back by [`Stream::retrieve`].
///
/// The transport-level result was OK (otherwise no buffer would have been
/// returned); `operational` carries the buffer-specific result.
#[derive(Debug)]
pub struct Retrieved {
    /// The buffer the stream filled (or tried to fill).
    pub buffer: TransferBuffer,
    /// Buffer-specific result (missing packets, buffer too small, ...).
    pub operational: Status,
}

/// A queue request the stream refused. The buffer is handed back so it is
/// never lost.
#[derive(Error, Debug)]
#[error("stream refused buffer: {status}")]
pub struct QueueRejected {
    /// The buffer that was not queued.
    pub buffer: TransferBuffer,
    /// Why the stream refused it.
    pub status: Status,
}

/// Entry point of a device SDK: enumeration and handle creation.
pub trait DeviceSystem: Send + Sync {
    /// Enumerate reachable devices on all interfaces.
    fn find(&self) -> Result<Vec<DeviceInfo>, Status>;

    /// Create a device handle and connect it.
    fn connect(&self, id: &ConnectionId) -> Result<Box<dyn Device>, Status>;

    /// Create and open a data stream for the device behind `id`.
    fn open_stream(&self, id: &ConnectionId) -> Result<Box<dyn Stream>, Status>;
}

/// A connected imaging device.
pub trait Device: Send {
    /// Transport class of the device.
    fn transport(&self) -> TransportKind;

    /// Number of bytes one complete payload occupies.
    fn payload_size(&self) -> Result<usize, Status>;

    /// Negotiate the largest packet size the path supports (GEV only).
    fn negotiate_packet_size(&mut self) -> Result<u32, Status>;

    /// Configure where the device pushes stream packets (GEV only).
    fn set_stream_destination(&mut self, destination: SocketAddr) -> Result<(), Status>;

    /// Enable streaming on the device's transport layer.
    fn stream_enable(&mut self) -> Result<(), Status>;

    /// Disable streaming on the device's transport layer.
    fn stream_disable(&mut self) -> Result<(), Status>;

    /// Execute a GenICam command.
    fn execute(&mut self, command: DeviceCommand) -> Result<(), Status>;

    /// Disconnect from the device.
    fn disconnect(&mut self) -> Result<(), Status>;
}

/// The data stream reading from a device.
pub trait Stream: Send {
    /// Local address the stream listens on (networked transports only).
    fn local_endpoint(&self) -> Option<SocketAddr>;

    /// Maximum number of buffers the stream can hold queued.
    fn max_queued_buffers(&self) -> usize;

    /// Hand a buffer to the stream so it can receive the next payload.
    fn queue(&mut self, buffer: TransferBuffer) -> Result<(), QueueRejected>;

    /// Wait up to `timeout` for the oldest completed buffer.
    ///
    /// `Err` is a transport-level failure (including timeout): no buffer was
    /// returned.
    fn retrieve(&mut self, timeout: Duration) -> Result<Retrieved, Status>;

    /// Abort every queued buffer. Aborted buffers are still returned by
    /// subsequent [`Stream::retrieve`] calls.
    fn abort_queued(&mut self) -> Result<(), Status>;

    /// Buffers currently owned by the stream (queued or completed but not yet
    /// retrieved).
    fn queued_count(&self) -> usize;

    /// Stream statistics counters.
    fn statistics(&self) -> StreamStatistics;

    /// Close the stream.
    fn close(&mut self) -> Result<(), Status>;
}
