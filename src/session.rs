//! Device session: one connected device plus its open data stream.
//!
//! A [`Session`] exclusively owns the device and stream handles created for a
//! connection id. Opening connects the device, opens the stream on the same
//! id and, for networked (GEV) devices, negotiates packet size and points the
//! device at the stream's local endpoint. Nothing is ever read from the stream
//! before all of that has succeeded.
//!
//! Closing unwinds in reverse: disable streaming, stop acquisition, close the
//! stream, disconnect the device. Every step is attempted even if an earlier
//! one fails.

use tracing::{debug, error, info, warn};

use crate::device::{
    ConnectionId, Device, DeviceCommand, DeviceSystem, Status, StatusCode, Stream,
    StreamStatistics, TransportKind,
};
use crate::error::{AcqError, Result};

struct Handles {
    device: Box<dyn Device>,
    stream: Box<dyn Stream>,
}

/// An open connection to one imaging device and its data stream.
pub struct Session {
    id: ConnectionId,
    transport: TransportKind,
    handles: Option<Handles>,
    streaming: bool,
    acquiring: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("open", &self.is_open())
            .field("streaming", &self.streaming)
            .field("acquiring", &self.acquiring)
            .finish()
    }
}

impl Session {
    /// Connect to `id` and open its stream.
    ///
    /// If the stream cannot be opened, or a GEV stream destination cannot be
    /// set, the device is disconnected before the error is returned.
    pub fn open(system: &dyn DeviceSystem, id: &ConnectionId) -> Result<Self> {
        info!(device = %id, "connecting to device");
        let mut device = system
            .connect(id)
            .map_err(|status| AcqError::DeviceConnect {
                id: id.clone(),
                status,
            })?;

        debug!(device = %id, "opening stream");
        let stream = match system.open_stream(id) {
            Ok(stream) => stream,
            Err(status) => {
                rollback(device.as_mut(), id);
                return Err(AcqError::StreamOpen {
                    id: id.clone(),
                    status,
                });
            }
        };

        let transport = device.transport();
        let mut handles = Handles { device, stream };
        if transport.is_networked() {
            if let Err(status) = configure_networked(&mut handles) {
                if let Err(close) = handles.stream.close() {
                    warn!(device = %id, status = %close, "closing stream during rollback failed");
                }
                rollback(handles.device.as_mut(), id);
                return Err(AcqError::StreamSetup {
                    id: id.clone(),
                    status,
                });
            }
        }

        info!(device = %id, %transport, "device session open");
        Ok(Self {
            id: id.clone(),
            transport,
            handles: Some(handles),
            streaming: false,
            acquiring: false,
        })
    }

    /// Connection id the session was opened with.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    /// Transport class of the connected device.
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Whether [`Session::close`] has not run yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handles.is_some()
    }

    /// Whether device streaming is enabled.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether `AcquisitionStart` was executed and not yet stopped.
    #[must_use]
    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    fn handles_mut(&mut self) -> Result<&mut Handles> {
        self.handles.as_mut().ok_or(AcqError::SessionClosed)
    }

    fn handles(&self) -> Result<&Handles> {
        self.handles.as_ref().ok_or(AcqError::SessionClosed)
    }

    /// Bytes one complete payload occupies, as reported by the device.
    pub fn payload_size(&self) -> Result<usize> {
        self.handles()?
            .device
            .payload_size()
            .map_err(AcqError::Query)
    }

    /// Maximum number of buffers the stream can hold queued.
    pub fn max_queueable(&self) -> Result<usize> {
        Ok(self.handles()?.stream.max_queued_buffers())
    }

    /// Current stream statistics.
    pub fn statistics(&self) -> Result<StreamStatistics> {
        Ok(self.handles()?.stream.statistics())
    }

    /// The session's data stream.
    pub fn stream_mut(&mut self) -> Result<&mut dyn Stream> {
        match self.handles.as_mut() {
            Some(handles) => Ok(handles.stream.as_mut()),
            None => Err(AcqError::SessionClosed),
        }
    }

    /// Enable streaming on the device.
    pub fn enable_streaming(&mut self) -> Result<()> {
        self.handles_mut()?
            .device
            .stream_enable()
            .map_err(|status| AcqError::Command {
                action: "StreamEnable",
                status,
            })?;
        self.streaming = true;
        debug!(device = %self.id, "streaming enabled");
        Ok(())
    }

    /// Disable streaming on the device.
    pub fn disable_streaming(&mut self) -> Result<()> {
        let result = self.handles_mut()?.device.stream_disable();
        // Cleared even on failure so teardown can still release buffers.
        self.streaming = false;
        result.map_err(|status| AcqError::Command {
            action: "StreamDisable",
            status,
        })?;
        debug!(device = %self.id, "streaming disabled");
        Ok(())
    }

    /// Execute `AcquisitionStart`.
    pub fn start_acquisition(&mut self) -> Result<()> {
        self.execute(DeviceCommand::AcquisitionStart)?;
        self.acquiring = true;
        info!(device = %self.id, "acquisition started");
        Ok(())
    }

    /// Execute `AcquisitionStop`.
    ///
    /// The command is always sent; a device that is already stopped may
    /// still report an error, which is returned.
    pub fn stop_acquisition(&mut self) -> Result<()> {
        let result = self.execute(DeviceCommand::AcquisitionStop);
        self.acquiring = false;
        result?;
        info!(device = %self.id, "acquisition stopped");
        Ok(())
    }

    fn execute(&mut self, command: DeviceCommand) -> Result<()> {
        let action = match command {
            DeviceCommand::AcquisitionStart => "AcquisitionStart",
            DeviceCommand::AcquisitionStop => "AcquisitionStop",
        };
        self.handles_mut()?
            .device
            .execute(command)
            .map_err(|status| AcqError::Command { action, status })
    }

    /// Release the stream and disconnect the device.
    ///
    /// Streaming is disabled and acquisition stopped first if still active.
    /// All steps run regardless of earlier failures; their errors are
    /// returned together. A closed session is left alone.
    pub fn close(&mut self) -> Result<()> {
        if self.handles.is_none() {
            return Ok(());
        }

        let mut errors = Vec::new();
        if self.streaming {
            if let Err(e) = self.disable_streaming() {
                errors.push(e);
            }
        }
        if self.acquiring {
            if let Err(e) = self.stop_acquisition() {
                errors.push(e);
            }
        }

        if let Some(mut handles) = self.handles.take() {
            if let Err(status) = handles.stream.close() {
                errors.push(AcqError::Command {
                    action: "CloseStream",
                    status,
                });
            }
            if let Err(status) = handles.device.disconnect() {
                errors.push(AcqError::Command {
                    action: "Disconnect",
                    status,
                });
            }
        }

        if errors.is_empty() {
            info!(device = %self.id, "device session closed");
        } else {
            warn!(device = %self.id, failures = errors.len(), "device session closed with errors");
        }
        AcqError::from_shutdown(errors)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.handles.is_some() {
            if let Err(e) = self.close() {
                error!(device = %self.id, error = %e, "closing dropped session failed");
            }
        }
    }
}

fn configure_networked(handles: &mut Handles) -> std::result::Result<(), Status> {
    match handles.device.negotiate_packet_size() {
        Ok(size) => debug!(packet_size = size, "packet size negotiated"),
        Err(status) => warn!(%status, "packet size negotiation failed, keeping device default"),
    }

    match handles.stream.local_endpoint() {
        Some(destination) => handles.device.set_stream_destination(destination),
        None => Err(Status::new(
            StatusCode::NotConnected,
            "stream has no local endpoint",
        )),
    }
}

fn rollback(device: &mut dyn Device, id: &ConnectionId) {
    if let Err(status) = device.disconnect() {
        warn!(device = %id, %status, "disconnect during rollback failed");
    }
}
