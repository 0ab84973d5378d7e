//! Device session setup, rollback and close.

use acq_stream::device::mock::{CameraSpec, SimulatedSystem};
use acq_stream::device::{DeviceCommand, Status, StatusCode, TransportKind};
use acq_stream::{AcqError, BufferPool, Session};

fn system_with(spec: CameraSpec) -> SimulatedSystem {
    let system = SimulatedSystem::new();
    system.add_camera("cam", spec);
    system
}

#[test]
fn close_twice_disconnects_once() {
    let system = system_with(CameraSpec::gev(64));
    let mut session = Session::open(&system, &"cam".into()).unwrap();
    assert_eq!(session.transport(), TransportKind::Gev);

    session.close().unwrap();
    session.close().unwrap();
    assert!(!session.is_open());
    drop(session);

    let log = system.log("cam");
    assert_eq!(log.stream_closes, 1);
    assert_eq!(log.disconnects, 1);
}

#[test]
fn unknown_device_fails_to_connect() {
    let system = SimulatedSystem::new();
    let err = Session::open(&system, &"nowhere".into()).unwrap_err();
    match err {
        AcqError::DeviceConnect { id, status } => {
            assert_eq!(id.as_str(), "nowhere");
            assert_eq!(status.code, StatusCode::NotFound);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn refused_connection_leaves_nothing_open() {
    let system = system_with(
        CameraSpec::u3v(64).fail_connect(Status::new(StatusCode::AccessDenied, "in use")),
    );
    let err = Session::open(&system, &"cam".into()).unwrap_err();
    assert!(matches!(err, AcqError::DeviceConnect { .. }));
    assert_eq!(system.log("cam").disconnects, 0);
}

#[test]
fn stream_open_failure_disconnects_device() {
    let system = system_with(
        CameraSpec::u3v(64).fail_open_stream(Status::new(StatusCode::Generic, "no channel")),
    );
    let err = Session::open(&system, &"cam".into()).unwrap_err();
    assert!(matches!(err, AcqError::StreamOpen { .. }));

    let log = system.log("cam");
    assert_eq!(log.disconnects, 1);
    assert_eq!(log.stream_closes, 0);
}

#[test]
fn stream_destination_failure_closes_stream_and_device() {
    let system = system_with(
        CameraSpec::gev(64)
            .fail_stream_destination(Status::new(StatusCode::NotSupported, "SCDA read-only")),
    );
    let err = Session::open(&system, &"cam".into()).unwrap_err();
    assert!(err.to_string().contains("Unable to configure streaming"));

    let log = system.log("cam");
    assert_eq!(log.stream_closes, 1);
    assert_eq!(log.disconnects, 1);
}

#[test]
fn close_stops_an_active_device() {
    let system = system_with(CameraSpec::u3v(64));
    let mut session = Session::open(&system, &"cam".into()).unwrap();
    session.enable_streaming().unwrap();
    session.start_acquisition().unwrap();

    session.close().unwrap();

    let log = system.log("cam");
    assert!(!log.stream_enabled);
    assert_eq!(
        log.commands,
        vec![DeviceCommand::AcquisitionStart, DeviceCommand::AcquisitionStop]
    );
    assert_eq!(log.disconnects, 1);
}

#[test]
fn close_reports_every_failed_step() {
    let system = system_with(
        CameraSpec::u3v(64)
            .fail_stream_close(Status::new(StatusCode::Generic, "close refused"))
            .fail_disconnect(Status::new(StatusCode::NotConnected, "link down")),
    );
    let mut session = Session::open(&system, &"cam".into()).unwrap();

    match session.close().unwrap_err() {
        AcqError::ShutdownFailed(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors[0].to_string().starts_with("CloseStream failed"));
            assert!(errors[1].to_string().starts_with("Disconnect failed"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // Handles are gone even though closing them failed.
    assert!(session.close().is_ok());
    assert_eq!(system.log("cam").disconnects, 1);
}

#[test]
fn closed_session_refuses_work() {
    let system = system_with(CameraSpec::u3v(64));
    let mut session = Session::open(&system, &"cam".into()).unwrap();
    session.close().unwrap();

    assert!(matches!(session.payload_size(), Err(AcqError::SessionClosed)));
    assert!(matches!(
        session.enable_streaming(),
        Err(AcqError::SessionClosed)
    ));
    assert!(matches!(
        BufferPool::initialize(&mut session, 4),
        Err(AcqError::SessionClosed)
    ));
}

#[test]
fn pool_release_requires_streaming_disabled() {
    let system = system_with(CameraSpec::u3v(64));
    let mut session = Session::open(&system, &"cam".into()).unwrap();
    let mut pool = BufferPool::initialize(&mut session, 4).unwrap();
    session.enable_streaming().unwrap();

    assert!(matches!(
        pool.release_all(&mut session),
        Err(AcqError::StillStreaming)
    ));

    session.disable_streaming().unwrap();
    let drained = pool.release_all(&mut session).unwrap();
    assert_eq!(drained.recovered, 4);
    assert_eq!(drained.outstanding, 0);
    assert_eq!(system.log("cam").queued_now, 0);

    // Second release is a no-op.
    assert_eq!(pool.release_all(&mut session).unwrap().recovered, 0);
    session.close().unwrap();
}
