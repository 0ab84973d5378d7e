//! Simulated device system.
//!
//! [`SimulatedSystem`] implements the device contract entirely in memory. Each
//! registered camera is described by a [`CameraSpec`]: transport, payload size,
//! stream queue capacity, a script of [`MockEvent`]s the stream plays back on
//! retrieval, and optional failures injected into individual operations.
//!
//! The stream behaves like a real one where the pipeline can observe it:
//!
//! - queued buffers complete in FIFO order
//! - buffer memory is overwritten with [`POISON_BYTE`] whenever a buffer is
//!   queued, so stale views into requeued memory would read garbage
//! - aborted buffers are handed back by later retrievals with an `ABORTED`
//!   status
//! - an idle stream blocks for the full retrieval timeout
//!
//! Everything observable is recorded in a [`MockLog`] per camera.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::{
    ConnectionId, Device, DeviceCommand, DeviceInfo, DeviceSystem, QueueRejected, Retrieved,
    Status, StatusCode, Stream, StreamStatistics, TransportKind,
};
use crate::payload::decompress::{compress_image, OutputFormat};
use crate::payload::{PayloadType, PixelFormat};
use crate::pool::{BufferLeader, ImageLeader, TransferBuffer};

/// Byte written over buffer memory whenever a buffer is queued.
pub const POISON_BYTE: u8 = 0xDE;

const DEFAULT_MAX_QUEUED: usize = 64;
const NEGOTIATED_PACKET_SIZE: u32 = 8164;

/// Contents of one simulated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadSpec {
    /// Uncompressed image; pixel `i` has value `seed + i` (wrapping).
    Image {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        seed: u8,
    },
    /// Image leader whose data stops after `received` bytes.
    TruncatedImage {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        received: usize,
    },
    /// Properly compressed image.
    CompressedImage {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        seed: u8,
    },
    /// Compressed header whose pixel data is `pixel_bytes` long regardless
    /// of the declared geometry.
    CompressedSizeMismatch {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        pixel_bytes: usize,
    },
    /// Tagged as compressed but carrying plain bytes.
    UncompressedAsCompressed { length: usize },
    /// Chunk data block.
    ChunkData { chunk_count: u32, length: usize },
    /// Raw data block.
    RawData { length: usize },
    /// Multi-part block.
    MultiPart { part_count: u32, length: usize },
    /// Block with an arbitrary payload type tag.
    Tagged { tag: u16, length: usize },
}

impl PayloadSpec {
    /// Mono8 image.
    #[must_use]
    pub fn mono8(width: u32, height: u32, seed: u8) -> Self {
        Self::Image {
            width,
            height,
            pixel_format: PixelFormat::Mono8,
            seed,
        }
    }

    fn render(&self, block_id: u64, timestamp_ns: u64) -> (BufferLeader, Vec<u8>) {
        let leader = |payload_type: u16| BufferLeader {
            block_id,
            payload_type,
            timestamp_ns,
            ..Default::default()
        };
        let geometry = |width, height, pixel_format: PixelFormat| ImageLeader {
            width,
            height,
            pixel_format: pixel_format.to_raw(),
            ..Default::default()
        };

        match *self {
            Self::Image {
                width,
                height,
                pixel_format,
                seed,
            } => {
                let len = pixel_format.image_size(width, height).unwrap_or(0);
                let mut leader = leader(PayloadType::IMAGE);
                leader.image = Some(geometry(width, height, pixel_format));
                (leader, pattern(seed, len))
            }
            Self::TruncatedImage {
                width,
                height,
                pixel_format,
                received,
            } => {
                let mut leader = leader(PayloadType::IMAGE);
                leader.image = Some(geometry(width, height, pixel_format));
                (leader, pattern(0, received))
            }
            Self::CompressedImage {
                width,
                height,
                pixel_format,
                seed,
            } => {
                let len = pixel_format.image_size(width, height).unwrap_or(0);
                let format = OutputFormat {
                    pixel_format,
                    width,
                    height,
                };
                let data = compress_image(&format, &pattern(seed, len));
                (leader(PayloadType::COMPRESSED_IMAGE), data)
            }
            Self::CompressedSizeMismatch {
                width,
                height,
                pixel_format,
                pixel_bytes,
            } => {
                let format = OutputFormat {
                    pixel_format,
                    width,
                    height,
                };
                let data = compress_image(&format, &pattern(0, pixel_bytes));
                (leader(PayloadType::COMPRESSED_IMAGE), data)
            }
            Self::UncompressedAsCompressed { length } => {
                (leader(PayloadType::COMPRESSED_IMAGE), pattern(0, length))
            }
            Self::ChunkData {
                chunk_count,
                length,
            } => {
                let mut leader = leader(PayloadType::CHUNK_DATA);
                leader.chunk_count = chunk_count;
                (leader, pattern(0, length))
            }
            Self::RawData { length } => (leader(PayloadType::RAW_DATA), pattern(0, length)),
            Self::MultiPart { part_count, length } => {
                let mut leader = leader(PayloadType::MULTI_PART);
                leader.part_count = part_count;
                (leader, pattern(0, length))
            }
            Self::Tagged { tag, length } => (leader(tag), pattern(0, length)),
        }
    }
}

/// Test pattern: byte `i` is `seed + i` (wrapping).
#[must_use]
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// One scripted stream outcome, consumed by a retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// The oldest queued buffer completes with this payload.
    Frame(PayloadSpec),
    /// Retrieval fails at transport level; no buffer is returned.
    TransportFailure(Status),
    /// The oldest queued buffer is returned with a non-OK result.
    OperationalFailure(Status),
    /// Nothing completes: retrieval waits out its timeout.
    Idle,
}

/// Description of a simulated camera.
#[derive(Debug, Clone)]
pub struct CameraSpec {
    transport: TransportKind,
    payload_size: usize,
    max_queued: usize,
    display_name: Option<String>,
    configuration_valid: bool,
    script: Vec<MockEvent>,
    continuous: Option<(u32, u32)>,
    frame_interval: Duration,
    reject_queue_after: Option<usize>,
    reject_queue_calls: Vec<usize>,
    fail_connect: Option<Status>,
    fail_open_stream: Option<Status>,
    fail_payload_query: Option<Status>,
    fail_packet_negotiation: Option<Status>,
    fail_stream_destination: Option<Status>,
    fail_commands: HashMap<DeviceCommand, Status>,
    fail_stream_disable: Option<Status>,
    fail_stream_close: Option<Status>,
    fail_disconnect: Option<Status>,
}

impl CameraSpec {
    fn new(transport: TransportKind, payload_size: usize) -> Self {
        Self {
            transport,
            payload_size,
            max_queued: DEFAULT_MAX_QUEUED,
            display_name: None,
            configuration_valid: true,
            script: Vec::new(),
            continuous: None,
            frame_interval: Duration::ZERO,
            reject_queue_after: None,
            reject_queue_calls: Vec::new(),
            fail_connect: None,
            fail_open_stream: None,
            fail_payload_query: None,
            fail_packet_negotiation: None,
            fail_stream_destination: None,
            fail_commands: HashMap::new(),
            fail_stream_disable: None,
            fail_stream_close: None,
            fail_disconnect: None,
        }
    }

    /// GigE Vision camera with the given payload size.
    #[must_use]
    pub fn gev(payload_size: usize) -> Self {
        Self::new(TransportKind::Gev, payload_size)
    }

    /// USB3 Vision camera with the given payload size.
    #[must_use]
    pub fn u3v(payload_size: usize) -> Self {
        Self::new(TransportKind::U3v, payload_size)
    }

    /// Stream queue capacity.
    #[must_use]
    pub fn max_queued(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    /// Label reported by discovery.
    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Report an unusable configuration (wrong subnet, USB2 port).
    #[must_use]
    pub fn invalid_configuration(mut self) -> Self {
        self.configuration_valid = false;
        self
    }

    /// Append one scripted event.
    #[must_use]
    pub fn event(mut self, event: MockEvent) -> Self {
        self.script.push(event);
        self
    }

    /// Append scripted events.
    #[must_use]
    pub fn events(mut self, events: impl IntoIterator<Item = MockEvent>) -> Self {
        self.script.extend(events);
        self
    }

    /// Append `count` Mono8 frames filling the whole payload (one row).
    #[must_use]
    pub fn frames(mut self, count: usize) -> Self {
        let width = u32::try_from(self.payload_size).unwrap_or(u32::MAX);
        for i in 0..count {
            self.script.push(MockEvent::Frame(PayloadSpec::mono8(
                width,
                1,
                i as u8,
            )));
        }
        self
    }

    /// After the script runs out, keep producing Mono8 frames of this size.
    #[must_use]
    pub fn continuous(mut self, width: u32, height: u32) -> Self {
        self.continuous = Some((width, height));
        self
    }

    /// Delay before each frame completes.
    #[must_use]
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Refuse every queue request from the `n`-th call on (0-based).
    #[must_use]
    pub fn reject_queue_after(mut self, n: usize) -> Self {
        self.reject_queue_after = Some(n);
        self
    }

    /// Refuse only the `n`-th queue request (0-based).
    #[must_use]
    pub fn reject_queue_call(mut self, n: usize) -> Self {
        self.reject_queue_calls.push(n);
        self
    }

    /// Fail [`DeviceSystem::connect`].
    #[must_use]
    pub fn fail_connect(mut self, status: Status) -> Self {
        self.fail_connect = Some(status);
        self
    }

    /// Fail [`DeviceSystem::open_stream`].
    #[must_use]
    pub fn fail_open_stream(mut self, status: Status) -> Self {
        self.fail_open_stream = Some(status);
        self
    }

    /// Fail [`Device::payload_size`].
    #[must_use]
    pub fn fail_payload_query(mut self, status: Status) -> Self {
        self.fail_payload_query = Some(status);
        self
    }

    /// Fail [`Device::negotiate_packet_size`].
    #[must_use]
    pub fn fail_packet_negotiation(mut self, status: Status) -> Self {
        self.fail_packet_negotiation = Some(status);
        self
    }

    /// Fail [`Device::set_stream_destination`].
    #[must_use]
    pub fn fail_stream_destination(mut self, status: Status) -> Self {
        self.fail_stream_destination = Some(status);
        self
    }

    /// Fail one device command.
    #[must_use]
    pub fn fail_command(mut self, command: DeviceCommand, status: Status) -> Self {
        self.fail_commands.insert(command, status);
        self
    }

    /// Fail [`Device::stream_disable`].
    #[must_use]
    pub fn fail_stream_disable(mut self, status: Status) -> Self {
        self.fail_stream_disable = Some(status);
        self
    }

    /// Fail [`Stream::close`].
    #[must_use]
    pub fn fail_stream_close(mut self, status: Status) -> Self {
        self.fail_stream_close = Some(status);
        self
    }

    /// Fail [`Device::disconnect`].
    #[must_use]
    pub fn fail_disconnect(mut self, status: Status) -> Self {
        self.fail_disconnect = Some(status);
        self
    }
}

/// Snapshot of everything a simulated camera observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockLog {
    /// Calls to [`Stream::queue`], accepted or not.
    pub queue_calls: usize,
    /// Buffers the stream holds right now (queued or aborted, not retrieved).
    pub queued_now: usize,
    /// Buffers handed back by [`Stream::retrieve`].
    pub retrieved: usize,
    /// Times buffer memory was overwritten with [`POISON_BYTE`].
    pub poisoned: usize,
    /// Calls to [`Stream::abort_queued`].
    pub aborts: usize,
    /// Commands executed successfully, in order.
    pub commands: Vec<DeviceCommand>,
    /// Whether streaming is currently enabled.
    pub stream_enabled: bool,
    /// Whether packet size negotiation succeeded.
    pub packet_size_negotiated: bool,
    /// Destination set through [`Device::set_stream_destination`].
    pub stream_destination: Option<SocketAddr>,
    /// Calls to [`Stream::close`].
    pub stream_closes: usize,
    /// Calls to [`Device::disconnect`].
    pub disconnects: usize,
}

#[derive(Debug)]
struct CameraState {
    spec: CameraSpec,
    endpoint: Option<SocketAddr>,
    script: VecDeque<MockEvent>,
    queued: VecDeque<TransferBuffer>,
    aborted: VecDeque<TransferBuffer>,
    acquiring: bool,
    next_block_id: u64,
    generated: u64,
    started: Option<Instant>,
    bytes_completed: u64,
    log: MockLog,
}

impl CameraState {
    fn snapshot(&self) -> MockLog {
        let mut log = self.log.clone();
        log.queued_now = self.queued.len() + self.aborted.len();
        log
    }

    fn next_event(&mut self) -> MockEvent {
        if let Some(event) = self.script.pop_front() {
            return event;
        }
        match self.spec.continuous {
            Some((width, height)) => {
                self.generated += 1;
                MockEvent::Frame(PayloadSpec::mono8(width, height, self.generated as u8))
            }
            None => MockEvent::Idle,
        }
    }

    fn statistics(&self) -> StreamStatistics {
        let elapsed = self
            .started
            .map_or(0.0, |started| started.elapsed().as_secs_f64());
        let blocks = self.next_block_id;
        if elapsed <= 0.0 {
            return StreamStatistics {
                blocks_completed: blocks,
                ..Default::default()
            };
        }
        StreamStatistics {
            acquisition_rate_hz: blocks as f64 / elapsed,
            bandwidth_bps: self.bytes_completed as f64 * 8.0 / elapsed,
            blocks_completed: blocks,
        }
    }
}

type Shared = Arc<Mutex<CameraState>>;

/// In-memory [`DeviceSystem`] with scriptable cameras.
#[derive(Debug, Default)]
pub struct SimulatedSystem {
    cameras: Mutex<Vec<(ConnectionId, Shared)>>,
}

impl SimulatedSystem {
    /// Empty system with no cameras.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a camera under `id`.
    pub fn add_camera(&self, id: impl Into<ConnectionId>, spec: CameraSpec) {
        let mut cameras = self.cameras.lock();
        let endpoint = spec.transport.is_networked().then(|| {
            let port = 50_000 + u16::try_from(cameras.len()).unwrap_or(0);
            SocketAddr::from((Ipv4Addr::LOCALHOST, port))
        });
        let state = CameraState {
            script: spec.script.iter().cloned().collect(),
            spec,
            endpoint,
            queued: VecDeque::new(),
            aborted: VecDeque::new(),
            acquiring: false,
            next_block_id: 0,
            generated: 0,
            started: None,
            bytes_completed: 0,
            log: MockLog::default(),
        };
        cameras.push((id.into(), Arc::new(Mutex::new(state))));
    }

    /// What the camera registered under `id` has observed so far.
    ///
    /// Unknown ids yield an empty log.
    #[must_use]
    pub fn log(&self, id: &str) -> MockLog {
        self.camera(&ConnectionId::new(id))
            .map(|camera| camera.lock().snapshot())
            .unwrap_or_default()
    }

    fn camera(&self, id: &ConnectionId) -> Option<Shared> {
        self.cameras
            .lock()
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, camera)| Arc::clone(camera))
    }

    fn lookup(&self, id: &ConnectionId) -> Result<Shared, Status> {
        self.camera(id).ok_or_else(|| {
            Status::new(StatusCode::NotFound, format!("no simulated device '{id}'"))
        })
    }
}

impl DeviceSystem for SimulatedSystem {
    fn find(&self) -> Result<Vec<DeviceInfo>, Status> {
        let cameras = self.cameras.lock();
        Ok(cameras
            .iter()
            .map(|(id, camera)| {
                let camera = camera.lock();
                let transport = camera.spec.transport;
                DeviceInfo {
                    connection_id: id.clone(),
                    display_id: camera
                        .spec
                        .display_name
                        .clone()
                        .unwrap_or_else(|| format!("Simulated {transport} camera [{id}]")),
                    interface_id: match transport {
                        TransportKind::Gev => "Simulated network interface".to_string(),
                        TransportKind::U3v => "Simulated USB host controller".to_string(),
                    },
                    transport,
                    configuration_valid: camera.spec.configuration_valid,
                }
            })
            .collect())
    }

    fn connect(&self, id: &ConnectionId) -> Result<Box<dyn Device>, Status> {
        let camera = self.lookup(id)?;
        if let Some(status) = camera.lock().spec.fail_connect.clone() {
            return Err(status);
        }
        trace!(device = %id, "simulated device connected");
        Ok(Box::new(SimulatedDevice { camera }))
    }

    fn open_stream(&self, id: &ConnectionId) -> Result<Box<dyn Stream>, Status> {
        let camera = self.lookup(id)?;
        if let Some(status) = camera.lock().spec.fail_open_stream.clone() {
            return Err(status);
        }
        Ok(Box::new(SimulatedStream { camera }))
    }
}

struct SimulatedDevice {
    camera: Shared,
}

impl Device for SimulatedDevice {
    fn transport(&self) -> TransportKind {
        self.camera.lock().spec.transport
    }

    fn payload_size(&self) -> Result<usize, Status> {
        let camera = self.camera.lock();
        match &camera.spec.fail_payload_query {
            Some(status) => Err(status.clone()),
            None => Ok(camera.spec.payload_size),
        }
    }

    fn negotiate_packet_size(&mut self) -> Result<u32, Status> {
        let mut camera = self.camera.lock();
        if let Some(status) = camera.spec.fail_packet_negotiation.clone() {
            return Err(status);
        }
        camera.log.packet_size_negotiated = true;
        Ok(NEGOTIATED_PACKET_SIZE)
    }

    fn set_stream_destination(&mut self, destination: SocketAddr) -> Result<(), Status> {
        let mut camera = self.camera.lock();
        if let Some(status) = camera.spec.fail_stream_destination.clone() {
            return Err(status);
        }
        camera.log.stream_destination = Some(destination);
        Ok(())
    }

    fn stream_enable(&mut self) -> Result<(), Status> {
        self.camera.lock().log.stream_enabled = true;
        Ok(())
    }

    fn stream_disable(&mut self) -> Result<(), Status> {
        let mut camera = self.camera.lock();
        camera.log.stream_enabled = false;
        match camera.spec.fail_stream_disable.clone() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn execute(&mut self, command: DeviceCommand) -> Result<(), Status> {
        let mut camera = self.camera.lock();
        if let Some(status) = camera.spec.fail_commands.get(&command) {
            return Err(status.clone());
        }
        camera.log.commands.push(command);
        match command {
            DeviceCommand::AcquisitionStart => {
                camera.acquiring = true;
                camera.started.get_or_insert_with(Instant::now);
            }
            DeviceCommand::AcquisitionStop => camera.acquiring = false,
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Status> {
        let mut camera = self.camera.lock();
        camera.log.disconnects += 1;
        camera.acquiring = false;
        camera.log.stream_enabled = false;
        match camera.spec.fail_disconnect.clone() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}

struct SimulatedStream {
    camera: Shared,
}

enum Step {
    Return(Result<Retrieved, Status>),
    Wait(Duration, Status),
}

impl SimulatedStream {
    fn step(&self, timeout: Duration) -> Step {
        let mut camera = self.camera.lock();

        if let Some(mut buffer) = camera.aborted.pop_front() {
            buffer.clear();
            camera.log.retrieved += 1;
            return Step::Return(Ok(Retrieved {
                buffer,
                operational: Status::new(StatusCode::Aborted, "buffer aborted"),
            }));
        }

        if !camera.acquiring || !camera.log.stream_enabled {
            return Step::Wait(timeout, Status::timeout());
        }

        match camera.next_event() {
            MockEvent::Idle => Step::Wait(timeout, Status::timeout()),
            MockEvent::TransportFailure(status) => Step::Return(Err(status)),
            MockEvent::OperationalFailure(status) => {
                let Some(mut buffer) = camera.queued.pop_front() else {
                    camera.script.push_front(MockEvent::OperationalFailure(status));
                    return Step::Return(Err(no_buffer_queued()));
                };
                let block_id = camera.next_block();
                buffer.complete(
                    BufferLeader {
                        block_id,
                        payload_type: PayloadType::IMAGE,
                        ..Default::default()
                    },
                    0,
                );
                camera.log.retrieved += 1;
                Step::Return(Ok(Retrieved {
                    buffer,
                    operational: status,
                }))
            }
            MockEvent::Frame(spec) => {
                let Some(mut buffer) = camera.queued.pop_front() else {
                    camera.script.push_front(MockEvent::Frame(spec));
                    return Step::Return(Err(no_buffer_queued()));
                };
                let block_id = camera.next_block();
                let timestamp_ns = camera
                    .started
                    .map_or(0, |started| started.elapsed().as_nanos() as u64);
                let (leader, data) = spec.render(block_id, timestamp_ns);
                camera.log.retrieved += 1;

                if data.len() > buffer.capacity() {
                    buffer.complete(leader, 0);
                    return Step::Return(Ok(Retrieved {
                        buffer,
                        operational: Status::new(
                            StatusCode::BufferTooSmall,
                            format!("payload of {} bytes does not fit", data.len()),
                        ),
                    }));
                }

                buffer.memory_mut()[..data.len()].copy_from_slice(&data);
                buffer.complete(leader, data.len());
                camera.bytes_completed += data.len() as u64;
                Step::Return(Ok(Retrieved {
                    buffer,
                    operational: Status::ok(),
                }))
            }
        }
    }
}

impl CameraState {
    fn next_block(&mut self) -> u64 {
        self.next_block_id += 1;
        self.next_block_id
    }
}

fn no_buffer_queued() -> Status {
    Status::new(StatusCode::NoBufferQueued, "no buffer queued")
}

impl Stream for SimulatedStream {
    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.camera.lock().endpoint
    }

    fn max_queued_buffers(&self) -> usize {
        self.camera.lock().spec.max_queued
    }

    fn queue(&mut self, mut buffer: TransferBuffer) -> Result<(), QueueRejected> {
        let mut camera = self.camera.lock();
        let call = camera.log.queue_calls;
        camera.log.queue_calls += 1;

        let refused = camera.spec.reject_queue_after.is_some_and(|n| call >= n)
            || camera.spec.reject_queue_calls.contains(&call);
        if refused || camera.queued.len() >= camera.spec.max_queued {
            return Err(QueueRejected {
                buffer,
                status: Status::new(StatusCode::QueueFull, "stream refused buffer"),
            });
        }

        buffer.memory_mut().fill(POISON_BYTE);
        camera.log.poisoned += 1;
        camera.queued.push_back(buffer);
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Retrieved, Status> {
        let interval = self.camera.lock().spec.frame_interval;
        if !interval.is_zero() {
            std::thread::sleep(interval.min(timeout));
        }
        match self.step(timeout) {
            Step::Return(result) => result,
            Step::Wait(wait, status) => {
                std::thread::sleep(wait);
                Err(status)
            }
        }
    }

    fn abort_queued(&mut self) -> Result<(), Status> {
        let mut camera = self.camera.lock();
        camera.log.aborts += 1;
        let queued = std::mem::take(&mut camera.queued);
        camera.aborted.extend(queued);
        Ok(())
    }

    fn queued_count(&self) -> usize {
        let camera = self.camera.lock();
        camera.queued.len() + camera.aborted.len()
    }

    fn statistics(&self) -> StreamStatistics {
        self.camera.lock().statistics()
    }

    fn close(&mut self) -> Result<(), Status> {
        let mut camera = self.camera.lock();
        camera.log.stream_closes += 1;
        camera.queued.clear();
        camera.aborted.clear();
        match camera.spec.fail_stream_close.clone() {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }
}
