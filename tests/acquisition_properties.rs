//! Acquisition loop behaviour against the simulated device system.
//!
//! Each test brings a session up by hand (open, pool, streaming, start),
//! runs an `AcquisitionLoop` over a scripted camera and inspects both the
//! delivered iterations and what the camera observed.

use std::ops::ControlFlow;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_test::traced_test;

use acq_stream::acquisition::{ChannelSink, Finished, OwnedIteration};
use acq_stream::device::mock::{pattern, CameraSpec, MockEvent, PayloadSpec, SimulatedSystem};
use acq_stream::device::{Status, StatusCode};
use acq_stream::error::{IntegrityFault, IterationError};
use acq_stream::pool::{BufferId, PoolCounts, SlotState};
use acq_stream::{
    AcquisitionLoop, BufferPool, Iteration, LoopConfig, OwnedFrame, PayloadType, PixelFormat,
    Session,
};

fn streaming(system: &SimulatedSystem, id: &str, buffers: usize) -> (Session, BufferPool) {
    let mut session = Session::open(system, &id.into()).expect("open session");
    let pool = BufferPool::initialize(&mut session, buffers).expect("initialize pool");
    session.enable_streaming().expect("enable streaming");
    session.start_acquisition().expect("start acquisition");
    (session, pool)
}

fn limited(iterations: u64) -> LoopConfig {
    LoopConfig {
        retrieve_timeout: Duration::from_millis(50),
        max_iterations: Some(iterations),
    }
}

/// Run the loop to its iteration limit and collect every delivered item.
fn run_to_completion(
    session: Session,
    pool: BufferPool,
    iterations: u64,
) -> (Finished, Vec<OwnedIteration>) {
    let (sink, mut rx) = ChannelSink::channel(256);
    let acquisition =
        AcquisitionLoop::start(session, pool, limited(iterations), sink).expect("start loop");
    let finished = acquisition.join().expect("join loop");

    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    (finished, items)
}

#[test]
#[traced_test]
fn every_returned_buffer_is_requeued_whatever_the_outcome() {
    let system = SimulatedSystem::new();
    system.add_camera(
        "cam",
        CameraSpec::u3v(256).events([
            MockEvent::Frame(PayloadSpec::mono8(16, 16, 0)),
            MockEvent::TransportFailure(Status::new(StatusCode::Generic, "link reset")),
            MockEvent::OperationalFailure(Status::new(StatusCode::MissingPackets, "2 lost")),
            MockEvent::Frame(PayloadSpec::UncompressedAsCompressed { length: 32 }),
            MockEvent::Frame(PayloadSpec::CompressedSizeMismatch {
                width: 8,
                height: 8,
                pixel_format: PixelFormat::Mono8,
                pixel_bytes: 60,
            }),
            MockEvent::Frame(PayloadSpec::Tagged {
                tag: 0x4242,
                length: 8,
            }),
            MockEvent::Frame(PayloadSpec::TruncatedImage {
                width: 16,
                height: 16,
                pixel_format: PixelFormat::Mono8,
                received: 100,
            }),
            MockEvent::Frame(PayloadSpec::RawData { length: 512 }),
            MockEvent::Frame(PayloadSpec::mono8(16, 16, 1)),
        ]),
    );
    let (session, pool) = streaming(&system, "cam", 2);
    let (finished, items) = run_to_completion(session, pool, 9);

    let report = finished.report;
    assert_eq!(items.len(), 9);
    assert_eq!(report.iterations, 9);
    assert_eq!(report.frames, 2);

    let with_buffer = items
        .iter()
        .filter(|item| item.outcome.as_ref().map_or_else(IterationError::had_buffer, |_| true))
        .count() as u64;
    assert_eq!(with_buffer, 8);
    assert_eq!(report.requeues, with_buffer);
    assert_eq!(report.requeues as usize, system.log("cam").retrieved);

    assert_eq!(report.errors.transient_retrieval, 1);
    assert_eq!(report.errors.operational, 2);
    assert_eq!(report.errors.format_mismatch, 1);
    assert_eq!(report.errors.decode_integrity, 2);
    assert_eq!(report.errors.unsupported_payload_type, 1);

    assert_eq!(finished.pool.counts().queued, 2);
    assert_eq!(system.log("cam").queued_now, 2);

    let Finished {
        mut session,
        mut pool,
        ..
    } = finished;
    session.stop_acquisition().unwrap();
    session.disable_streaming().unwrap();
    pool.release_all(&mut session).unwrap();
    session.close().unwrap();
    assert!(logs_contain("buffer pool released"));
}

#[test]
fn pool_stays_bounded_during_delivery() {
    let system = SimulatedSystem::new();
    system.add_camera(
        "cam",
        CameraSpec::u3v(64)
            .max_queued(3)
            .frames(4)
            .event(MockEvent::TransportFailure(Status::timeout()))
            .event(MockEvent::OperationalFailure(Status::new(
                StatusCode::TooManyResends,
                "resend limit",
            )))
            .frames(2),
    );
    let (session, pool) = streaming(&system, "cam", 8);
    assert_eq!(pool.size(), 3);

    let seen: Arc<Mutex<Vec<PoolCounts>>> = Arc::default();
    let record = Arc::clone(&seen);
    let acquisition = AcquisitionLoop::start(session, pool, limited(8), move |item: &Iteration<'_>| {
        record.lock().push(item.pool);
        ControlFlow::Continue(())
    })
    .unwrap();
    let finished = acquisition.join().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 8);
    for counts in seen.iter() {
        assert_eq!(counts.in_flight(), 3);
        assert_eq!(counts.free, 0);
        assert!(counts.in_use <= 1);
    }
    assert_eq!(finished.pool.counts().queued, 3);
}

#[test]
fn owned_copies_survive_buffer_reuse() {
    // One buffer: every frame lands in the same memory, poisoned on requeue.
    let system = SimulatedSystem::new();
    system.add_camera(
        "cam",
        CameraSpec::u3v(64).events((0..3u8).map(|seed| {
            MockEvent::Frame(PayloadSpec::mono8(8, 8, seed * 50))
        })),
    );
    let (session, pool) = streaming(&system, "cam", 1);

    let copies: Arc<Mutex<Vec<(BufferId, OwnedFrame)>>> = Arc::default();
    let keep = Arc::clone(&copies);
    let acquisition = AcquisitionLoop::start(session, pool, limited(3), move |item: &Iteration<'_>| {
        if let Ok(frame) = &item.outcome {
            keep.lock().push((frame.buffer, frame.to_owned_frame()));
        }
        ControlFlow::Continue(())
    })
    .unwrap();
    let finished = acquisition.join().unwrap();
    assert_eq!(finished.report.requeues, 3);

    let copies = copies.lock();
    assert_eq!(copies.len(), 3);
    assert!(copies.iter().all(|(buffer, _)| *buffer == copies[0].0));
    for (i, (_, frame)) in copies.iter().enumerate() {
        let image = frame.image.as_ref().unwrap();
        assert_eq!(&image.data[..], &pattern(i as u8 * 50, 64)[..]);
    }

    // Initial queue plus one poisoning per requeue.
    assert_eq!(system.log("cam").poisoned, 4);
}

#[test]
fn each_payload_type_is_dispatched() {
    let system = SimulatedSystem::new();
    system.add_camera(
        "cam",
        CameraSpec::gev(128).events([
            MockEvent::Frame(PayloadSpec::mono8(8, 8, 3)),
            MockEvent::Frame(PayloadSpec::ChunkData {
                chunk_count: 3,
                length: 48,
            }),
            MockEvent::Frame(PayloadSpec::RawData { length: 100 }),
            MockEvent::Frame(PayloadSpec::MultiPart {
                part_count: 2,
                length: 64,
            }),
            MockEvent::Frame(PayloadSpec::Tagged {
                tag: 0x4242,
                length: 16,
            }),
        ]),
    );
    let (session, pool) = streaming(&system, "cam", 4);
    let (finished, items) = run_to_completion(session, pool, 5);

    let types: Vec<_> = items
        .iter()
        .map(|item| match &item.outcome {
            Ok(frame) => Some(frame.payload_type),
            Err(e) => e.payload_type(),
        })
        .collect();
    assert_eq!(
        types,
        vec![
            Some(PayloadType::Image),
            Some(PayloadType::ChunkData),
            Some(PayloadType::RawData),
            Some(PayloadType::MultiPart),
            Some(PayloadType::Unsupported(0x4242)),
        ]
    );
    assert!(matches!(
        items[4].outcome,
        Err(IterationError::UnsupportedPayloadType { block_id: 5, .. })
    ));
    assert_eq!(finished.report.frames, 4);
    assert_eq!(finished.report.requeues, 5);
}

#[test]
fn pool_size_is_capped_by_stream_capacity() {
    let system = SimulatedSystem::new();
    system.add_camera("cam", CameraSpec::u3v(64).max_queued(8));
    let mut session = Session::open(&system, &"cam".into()).unwrap();

    let mut pool = BufferPool::initialize(&mut session, 16).unwrap();
    assert_eq!(pool.size(), 8);
    assert_eq!(
        pool.counts(),
        PoolCounts {
            queued: 8,
            ..PoolCounts::default()
        }
    );
    assert_eq!(system.log("cam").queued_now, 8);

    pool.release_all(&mut session).unwrap();
    session.close().unwrap();
}

#[test]
fn transport_failure_mid_run_skips_requeue_for_that_iteration() {
    let system = SimulatedSystem::new();
    system.add_camera(
        "cam",
        CameraSpec::u3v(64).events([
            MockEvent::Frame(PayloadSpec::mono8(8, 8, 1)),
            MockEvent::Frame(PayloadSpec::mono8(8, 8, 2)),
            MockEvent::TransportFailure(Status::new(StatusCode::Generic, "GVSP socket error")),
            MockEvent::Frame(PayloadSpec::mono8(8, 8, 4)),
            MockEvent::Frame(PayloadSpec::mono8(8, 8, 5)),
        ]),
    );
    let (session, pool) = streaming(&system, "cam", 4);
    let (finished, items) = run_to_completion(session, pool, 5);

    assert_eq!(items.len(), 5);
    for (i, item) in items.iter().enumerate() {
        if i == 2 {
            assert!(matches!(
                &item.outcome,
                Err(IterationError::TransientRetrieval(status)) if status.code == StatusCode::Generic
            ));
        } else {
            assert!(item.outcome.is_ok(), "iteration {i} should yield a frame");
        }
    }
    assert_eq!(finished.report.requeues, 4);
    assert_eq!(system.log("cam").retrieved, 4);
}

#[test]
fn refused_requeue_is_retried_before_the_next_retrieval() {
    let system = SimulatedSystem::new();
    // Queue call 0 is pool setup; call 1 is the first requeue.
    system.add_camera("cam", CameraSpec::u3v(64).frames(6).reject_queue_call(1));
    let (session, pool) = streaming(&system, "cam", 1);

    let (finished, items) = run_to_completion(session, pool, 6);

    assert_eq!(items.len(), 6);
    assert!(items.iter().all(|item| item.outcome.is_ok()), "{items:?}");
    assert_eq!(finished.report.frames, 6);
    assert_eq!(finished.report.errors.total(), 0);
    assert_eq!(finished.report.requeues, 6);

    assert_eq!(finished.pool.parked(), 0);
    assert_eq!(finished.pool.state(BufferId(0)), SlotState::Queued);
    assert_eq!(finished.pool.counts().in_flight(), finished.pool.size());

    let log = system.log("cam");
    assert_eq!(log.retrieved, 6);
    // Setup, six requeues and one retry of the parked buffer.
    assert_eq!(log.queue_calls, 8);
    assert_eq!(log.queued_now, 1);
}

#[test]
fn short_decompression_is_an_integrity_error_and_still_requeues() {
    let system = SimulatedSystem::new();
    system.add_camera(
        "cam",
        CameraSpec::u3v(1_000_000).event(MockEvent::Frame(PayloadSpec::CompressedSizeMismatch {
            width: 1000,
            height: 1000,
            pixel_format: PixelFormat::Mono8,
            pixel_bytes: 999_998,
        })),
    );
    let (session, pool) = streaming(&system, "cam", 2);
    let (finished, items) = run_to_completion(session, pool, 1);

    assert_eq!(items.len(), 1);
    match &items[0].outcome {
        Err(IterationError::DecodeIntegrity {
            payload_type,
            fault,
            ..
        }) => {
            assert_eq!(*payload_type, PayloadType::CompressedImage);
            assert_eq!(
                *fault,
                IntegrityFault::SizeMismatch {
                    expected: 1_000_000,
                    actual: 999_998
                }
            );
        }
        other => panic!("expected a decode integrity error, got {other:?}"),
    }
    assert_eq!(finished.report.requeues, 1);
    assert_eq!(finished.pool.counts().queued, 2);
}

#[test]
fn stop_during_blocked_retrieval_returns_within_one_timeout() {
    let system = SimulatedSystem::new();
    system.add_camera("cam", CameraSpec::u3v(64).frames(3));
    let (session, pool) = streaming(&system, "cam", 4);

    let (tx, rx) = mpsc::channel();
    let config = LoopConfig {
        retrieve_timeout: Duration::from_millis(1000),
        max_iterations: None,
    };
    let acquisition = AcquisitionLoop::start(session, pool, config, move |item: &Iteration<'_>| {
        let _ = tx.send((item.index, item.outcome.is_ok()));
        ControlFlow::Continue(())
    })
    .unwrap();

    for expected in 0..3 {
        let (index, ok) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(index, expected);
        assert!(ok);
    }
    // The fourth retrieval is now waiting on an idle stream.
    std::thread::sleep(Duration::from_millis(50));

    let stop_requested = Instant::now();
    acquisition.stop();
    let finished = acquisition.join().unwrap();
    let latency = stop_requested.elapsed();

    assert!(latency < Duration::from_millis(1500), "stop took {latency:?}");
    assert_eq!(finished.report.requeues, 3);
    assert_eq!(finished.report.iterations, 4);
    assert_eq!(finished.report.errors.transient_retrieval, 1);
    assert_eq!(system.log("cam").retrieved, 3);
}
