mod common;

use std::{fs, sync::atomic::Ordering, time::Duration};

use common::{BufferSpec, Fixture, TempAllocator, TestBuffer};
use hwcomposer::{
    buffer::Fourcc,
    capture::{dump::DisplayKind, CaptureClient, CaptureError, CaptureStatus},
    config::SessionConfig,
    engine::{CaptureConfig, PowerMode, SecureEvent},
    notify::Notification,
    session::SessionError,
    sync::SyncPoint,
    utils::{DisplayId, Rectangle},
};

const ETIME: i32 = 62;

fn roi_config() -> CaptureConfig {
    CaptureConfig {
        roi: Rectangle::from_size((64, 32).into()),
        ..Default::default()
    }
}

fn dump_fixture(dir: &std::path::Path) -> (Fixture, TempAllocator) {
    let config = SessionConfig {
        dump_dir: dir.to_path_buf(),
        capture_wait: Duration::from_secs(2),
        ..SessionConfig::new(DisplayId(0), DisplayKind::Builtin)
    };
    let allocator = TempAllocator::default();
    let live = TempAllocator {
        live: allocator.live.clone(),
        ..Default::default()
    };
    let mut fx = Fixture::with_config(config);
    fx.session = fx.session.with_dump_allocator(Box::new(allocator));
    fx.power_on();
    (fx, live)
}

fn dumped_frames(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir.join("frame_dump_disp_id_00_builtin"))
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().file_name().into_string().unwrap())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn timed_out_readback_has_no_fence() {
    let fx = Fixture::new();
    let capture = fx.session.capture_handle();
    capture.request(CaptureClient::FrameDump, 77).unwrap();
    capture.notify_done(-ETIME, 77, Some(SyncPoint::signaled()));

    let readback = fx.session.readback_fence(CaptureClient::FrameDump).unwrap();
    assert_eq!(readback.status, CaptureStatus::TimedOut);
    assert!(readback.fence.is_none());
    assert_eq!(readback.handle_id, Some(77));

    let readback = fx.session.readback_fence(CaptureClient::FrameDump).unwrap();
    assert_eq!(readback.status, CaptureStatus::NotAvailable);
}

#[test]
fn timed_out_frame_dump_is_still_written() {
    let dir = tempfile::tempdir().unwrap();
    let (mut fx, allocator) = dump_fixture(dir.path());
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.engine.script().writeback_code = Some(-ETIME);

    fx.session
        .set_frame_dump_config(1, Fourcc::Argb8888, roi_config())
        .unwrap();
    assert_eq!(allocator.live.load(Ordering::SeqCst), 1);
    assert_eq!(fx.engine.script().writeback_requests, 1);

    fx.frame().unwrap();

    let frames = dumped_frames(dir.path());
    assert_eq!(frames.len(), 1);
    assert!(frames[0].starts_with("output_layer_64x32_"));
    assert!(frames[0].ends_with("_frame0.raw"));
    let written = fs::metadata(dir.path().join("frame_dump_disp_id_00_builtin").join(&frames[0])).unwrap();
    assert_eq!(written.len(), 64 * 32 * 4);
    assert_eq!(allocator.live.load(Ordering::SeqCst), 0);
}

#[test]
fn frame_dump_is_rearmed_for_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (mut fx, allocator) = dump_fixture(dir.path());
    let buffer = TestBuffer::new(1);
    fx.add_layer(&buffer, BufferSpec::default());
    fx.engine.script().writeback_code = Some(0);

    fx.session
        .set_frame_dump_config(2, Fourcc::Argb8888, roi_config())
        .unwrap();
    assert!(matches!(
        fx.session.set_frame_dump_config(1, Fourcc::Argb8888, roi_config()),
        Err(SessionError::Capture(CaptureError::Busy))
    ));

    fx.frame().unwrap();
    assert_eq!(fx.engine.script().writeback_requests, 2);
    assert_eq!(allocator.live.load(Ordering::SeqCst), 1);

    fx.frame().unwrap();
    let frames = dumped_frames(dir.path());
    assert_eq!(frames.len(), 2);
    assert!(frames[1].ends_with("_frame1.raw"));
    assert_eq!(allocator.live.load(Ordering::SeqCst), 0);

    // the dump finished, a new one can start
    fx.session
        .set_frame_dump_config(1, Fourcc::Argb8888, roi_config())
        .unwrap();
}

#[test]
fn frame_dump_needs_an_allocator() {
    let mut fx = Fixture::new();
    fx.power_on();
    assert!(matches!(
        fx.session.set_frame_dump_config(1, Fourcc::Argb8888, roi_config()),
        Err(SessionError::Unsupported)
    ));
}

#[test]
fn composer_readback_follows_the_commit() {
    let mut fx = Fixture::new();
    fx.power_on();
    let layer_buffer = TestBuffer::new(1);
    fx.add_layer(&layer_buffer, BufferSpec::default());
    let readback = TestBuffer::new(50);
    fx.provider.insert(readback.id, BufferSpec::default());

    fx.session
        .set_readback_buffer(readback.handle(), None, CaptureConfig::default(), CaptureClient::Composer)
        .unwrap();
    let pending = fx.session.readback_fence(CaptureClient::Composer).unwrap();
    assert_eq!(pending.status, CaptureStatus::Pending);
    assert!(pending.fence.is_none());

    fx.frame().unwrap();
    let done = fx.session.readback_fence(CaptureClient::Composer).unwrap();
    assert_eq!(done.handle_id, Some(readback.id));
    assert!(done.fence.is_some());

    // retrieved, so the client may capture again
    fx.session
        .set_readback_buffer(readback.handle(), None, CaptureConfig::default(), CaptureClient::Composer)
        .unwrap();
}

#[test]
fn second_readback_buffer_is_busy() {
    let mut fx = Fixture::new();
    fx.power_on();
    let (first, second) = (TestBuffer::new(50), TestBuffer::new(51));
    fx.provider.insert(first.id, BufferSpec::default());
    fx.provider.insert(second.id, BufferSpec::default());

    fx.session
        .set_readback_buffer(first.handle(), None, CaptureConfig::default(), CaptureClient::Composer)
        .unwrap();
    assert!(matches!(
        fx.session
            .set_readback_buffer(second.handle(), None, CaptureConfig::default(), CaptureClient::Composer),
        Err(SessionError::Capture(CaptureError::Busy))
    ));
    assert_eq!(fx.engine.script().writeback_requests, 1);
}

#[test]
fn readback_is_validated_before_submission() {
    let mut fx = Fixture::new();
    let buffer = TestBuffer::new(50);
    fx.provider.insert(
        buffer.id,
        BufferSpec {
            format: Fourcc::Nv12,
            ..Default::default()
        },
    );
    let unknown = TestBuffer::new(51);

    assert!(matches!(
        fx.session
            .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Composer),
        Err(SessionError::Capture(CaptureError::BadDisplay))
    ));

    fx.power_on();
    assert!(matches!(
        fx.session
            .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Composer),
        Err(SessionError::Capture(CaptureError::BadParameter(_)))
    ));
    assert!(matches!(
        fx.session
            .set_readback_buffer(unknown.handle(), None, CaptureConfig::default(), CaptureClient::Composer),
        Err(SessionError::Capture(CaptureError::BadParameter(_)))
    ));
    assert_eq!(fx.engine.script().writeback_requests, 0);
}

#[test]
fn rejected_writeback_is_not_tracked() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(50);
    fx.provider.insert(buffer.id, BufferSpec::default());
    fx.engine.script().reject_writeback = true;

    assert!(matches!(
        fx.session
            .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Composer),
        Err(SessionError::Capture(CaptureError::BadParameter(_)))
    ));
    let readback = fx.session.readback_fence(CaptureClient::Composer).unwrap();
    assert_eq!(readback.status, CaptureStatus::NotAvailable);
}

#[test]
fn external_clients_are_notified() {
    let mut fx = Fixture::new();
    fx.power_on();
    let layer_buffer = TestBuffer::new(1);
    fx.add_layer(&layer_buffer, BufferSpec::default());
    let buffer = TestBuffer::new(50);
    fx.provider.insert(buffer.id, BufferSpec::default());
    fx.engine.script().writeback_code = Some(0);

    fx.session
        .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::External)
        .unwrap();
    fx.frame().unwrap();

    assert!(fx.sink.take().contains(&Notification::CaptureDone {
        status: CaptureStatus::Signaled,
        handle_id: buffer.id,
    }));
}

#[test]
fn color_capture_status_is_recorded() {
    let mut fx = Fixture::new();
    fx.power_on();
    let layer_buffer = TestBuffer::new(1);
    fx.add_layer(&layer_buffer, BufferSpec::default());
    let buffer = TestBuffer::new(50);
    fx.provider.insert(buffer.id, BufferSpec::default());
    fx.engine.script().writeback_code = Some(0);

    assert_eq!(fx.session.frame_capture_status(), None);
    fx.session
        .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Color)
        .unwrap();
    fx.frame().unwrap();
    assert_eq!(fx.session.frame_capture_status(), Some(CaptureStatus::Signaled));
}

#[test]
fn powering_off_drops_captures() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(50);
    fx.provider.insert(buffer.id, BufferSpec::default());
    fx.session
        .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Composer)
        .unwrap();

    fx.session.set_power_mode(PowerMode::Off, false).unwrap();
    let readback = fx.session.readback_fence(CaptureClient::Composer).unwrap();
    assert_eq!(readback.status, CaptureStatus::NotAvailable);
}

#[test]
fn writeback_teardown_goes_through_the_engine() {
    let mut fx = Fixture::new();
    fx.power_on();
    let buffer = TestBuffer::new(50);
    fx.provider.insert(buffer.id, BufferSpec::default());
    fx.session
        .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Composer)
        .unwrap();

    fx.session.teardown_concurrent_writeback().unwrap();
    assert_eq!(fx.engine.script().cwb_teardowns, 1);
    let readback = fx.session.readback_fence(CaptureClient::Composer).unwrap();
    assert_eq!(readback.status, CaptureStatus::NotAvailable);
}

#[test]
fn secure_sessions_block_captures() {
    let dir = tempfile::tempdir().unwrap();
    let (mut fx, allocator) = dump_fixture(dir.path());
    let buffer = TestBuffer::new(50);
    fx.provider.insert(buffer.id, BufferSpec::default());

    fx.session.handle_secure_event(SecureEvent::SecureDisplayStart).unwrap();
    assert!(matches!(
        fx.session
            .set_readback_buffer(buffer.handle(), None, CaptureConfig::default(), CaptureClient::Composer),
        Err(SessionError::Capture(CaptureError::Unsupported))
    ));
    fx.session
        .set_frame_dump_config(1, Fourcc::Argb8888, roi_config())
        .unwrap();
    assert_eq!(allocator.live.load(Ordering::SeqCst), 0);
    assert_eq!(fx.engine.script().writeback_requests, 0);
}
