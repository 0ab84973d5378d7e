//! CLI entry point for acq-stream.
//!
//! Runs against the built-in simulated device system:
//!
//! ```bash
//! acq-stream list
//! acq-stream stream --frames 100
//! acq-stream snap --device sim-gev-0
//! ```
//!
//! `stream` runs until Ctrl-C (or the frame limit) and prints a summary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use acq_stream::acquisition::{ChannelSink, OwnedIteration};
use acq_stream::config::{AcqConfig, DEFAULT_CONFIG_PATH};
use acq_stream::device::discovery::select_device;
use acq_stream::device::mock::{CameraSpec, MockEvent, PayloadSpec, SimulatedSystem};
use acq_stream::device::{ConnectionId, DeviceSystem, Status, StatusCode};
use acq_stream::{logging, snap, Acquisition, PixelFormat};

#[derive(Parser)]
#[command(name = "acq-stream")]
#[command(about = "Buffered frame acquisition from imaging devices", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Connection id of the device to use (overrides the config file)
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List reachable devices
    List,

    /// Acquire continuously until Ctrl-C
    Stream {
        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Number of transfer buffers to request
        #[arg(long)]
        buffers: Option<usize>,
    },

    /// Acquire a single image
    Snap,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AcqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(device) = cli.device {
        config.device.connection_id = Some(device);
    }
    if let Commands::Stream {
        buffers: Some(count),
        ..
    } = &cli.command
    {
        config.acquisition.buffer_count = *count;
    }
    config.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let system = simulated_system();

    match cli.command {
        Commands::List => list(&system),
        Commands::Stream { frames, .. } => stream(system, config, frames).await,
        Commands::Snap => snap_once(system, config).await,
    }
}

/// Devices the CLI can talk to without hardware.
fn simulated_system() -> SimulatedSystem {
    let system = SimulatedSystem::new();
    system.add_camera(
        "sim-gev-0",
        CameraSpec::gev(640 * 480)
            .display_name("Simulated GigE Vision camera 640x480 Mono8")
            .max_queued(32)
            .continuous(640, 480)
            .frame_interval(Duration::from_millis(33))
            .events([
                MockEvent::Frame(PayloadSpec::CompressedImage {
                    width: 640,
                    height: 480,
                    pixel_format: PixelFormat::Mono8,
                    seed: 0,
                }),
                MockEvent::Frame(PayloadSpec::ChunkData {
                    chunk_count: 2,
                    length: 64,
                }),
                MockEvent::OperationalFailure(Status::new(
                    StatusCode::MissingPackets,
                    "3 packets lost",
                )),
            ]),
    );
    system.add_camera(
        "sim-u3v-0",
        CameraSpec::u3v(1280 * 1024)
            .display_name("Simulated USB3 Vision camera 1280x1024 Mono8")
            .continuous(1280, 1024)
            .frame_interval(Duration::from_millis(20)),
    );
    system
}

fn list(system: &dyn DeviceSystem) -> Result<()> {
    let devices = system
        .find()
        .map_err(|status| anyhow!("device enumeration failed: {status}"))?;
    if devices.is_empty() {
        println!("No devices found");
    }
    for device in devices {
        println!(
            "{:<12} {:<12} {}{}",
            device.connection_id.to_string(),
            device.transport.to_string(),
            device.display_id,
            if device.configuration_valid {
                ""
            } else {
                "  (configuration invalid)"
            }
        );
    }
    Ok(())
}

fn resolve_device(system: &SimulatedSystem, config: &AcqConfig) -> Result<ConnectionId> {
    let preferred = config.connection_id();
    let info = select_device(system, preferred.as_ref())?;
    Ok(info.connection_id)
}

async fn stream(system: SimulatedSystem, config: AcqConfig, frames: Option<u64>) -> Result<()> {
    let id = resolve_device(&system, &config)?;
    let (sink, mut rx) = ChannelSink::channel(64);
    let acquisition = Acquisition::start(&system, &id, &config, sink)?;
    let stop = acquisition
        .stop_handle()
        .ok_or_else(|| anyhow!("acquisition loop not running"))?;

    let mut received = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
            item = rx.recv() => {
                let Some(item) = item else { break };
                if report_item(&item) {
                    received += 1;
                }
                if frames.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
        }
    }
    stop.stop();
    // Unblock the loop thread if it is waiting on a full channel.
    drop(rx);

    let report = tokio::task::spawn_blocking(move || acquisition.shutdown()).await??;
    println!(
        "{} iterations, {} frames, {} errors (timeouts {}, operational {}, decode {})",
        report.iterations,
        report.frames,
        report.errors.total(),
        report.errors.transient_retrieval,
        report.errors.operational,
        report.errors.decode_integrity + report.errors.format_mismatch,
    );
    println!(
        "{:.1} FPS, {:.1} Mb/s",
        report.last_statistics.acquisition_rate_hz,
        report.last_statistics.bandwidth_bps / 1_000_000.0
    );
    Ok(())
}

fn report_item(item: &OwnedIteration) -> bool {
    let stats = item.statistics;
    match &item.outcome {
        Ok(frame) => {
            let geometry = frame
                .image
                .as_ref()
                .map(|image| format!(" {}x{}", image.width, image.height))
                .unwrap_or_default();
            println!(
                "BlockID: {:016} {}{}  {:.1} FPS  {:.1} Mb/s",
                frame.block_id,
                frame.payload_type,
                geometry,
                stats.acquisition_rate_hz,
                stats.bandwidth_bps / 1_000_000.0
            );
            true
        }
        Err(e) => {
            warn!(index = item.index, error = %e, "iteration failed");
            false
        }
    }
}

async fn snap_once(system: SimulatedSystem, config: AcqConfig) -> Result<()> {
    let id = resolve_device(&system, &config)?;
    let frame = tokio::task::spawn_blocking(move || snap(&system, &id, &config)).await??;
    match frame.image {
        Some(image) => println!(
            "block {}: {}x{} {:?}, {} bytes",
            frame.block_id,
            image.width,
            image.height,
            image.pixel_format,
            image.data.len()
        ),
        None => println!("block {}: {}", frame.block_id, frame.payload_type),
    }
    Ok(())
}
