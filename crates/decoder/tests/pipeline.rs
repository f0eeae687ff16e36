//! End-to-end pipeline tests over the fake device boundary.
//!
//! Each test builds a session from scripted [`FakeM2mDevice`]s and
//! drives the public submit/retrieve/release API, covering both the
//! direct (linear-capable decoder) and chained (decoder + converter)
//! topologies.

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use m2m_decoder::testing::{FakeDeviceLocator, FakeM2mDevice};
use m2m_decoder::{
    CropRect, DecodeError, DecodeSession, DeviceCaps, DeviceError, FourCc, PixelLayout,
    QueueType, Resolution, SessionConfig, VideoCodec,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn test_config(codec: VideoCodec) -> SessionConfig {
    SessionConfig {
        stream_buffer_size: 4096,
        poll_timeout_ms: 50,
        ..SessionConfig::new(codec, Resolution::new(1280, 720))
    }
}

/// Decoder that only produces tiled pictures, forcing a converter.
fn tiled_decoder() -> Arc<FakeM2mDevice> {
    Arc::new(
        FakeM2mDevice::new()
            .with_auto_complete_output(true)
            .with_min_capture_buffers(2)
            .with_capture_layout(
                PixelLayout::new(FourCc::NV12MT, Resolution::new(1280, 736))
                    .with_plane_sizes(&[8192, 4096]),
            )
            .with_capture_crop(CropRect::new(0, 0, 1280, 720)),
    )
}

/// Decoder that can emit the linear layout directly.
fn linear_decoder() -> Arc<FakeM2mDevice> {
    Arc::new(
        FakeM2mDevice::new()
            .with_linear_capture(true)
            .with_auto_complete_output(true)
            .with_min_capture_buffers(2)
            .with_capture_crop(CropRect::new(0, 0, 1280, 720)),
    )
}

fn converter() -> Arc<FakeM2mDevice> {
    Arc::new(
        FakeM2mDevice::new()
            .with_linear_capture(true)
            .with_auto_complete_output(true),
    )
}

fn chained_setup(
    codec: VideoCodec,
) -> (DecodeSession, Arc<FakeM2mDevice>, Arc<FakeM2mDevice>) {
    let decoder = tiled_decoder();
    let conv = converter();
    let locator = FakeDeviceLocator::new(vec![
        ("s5p-jpeg", Arc::new(FakeM2mDevice::new())),
        ("s5p-mfc-dec", decoder.clone()),
        ("exynos-fimc-m2m", conv.clone()),
    ]);
    let session = DecodeSession::open(&locator, test_config(codec)).unwrap();
    (session, decoder, conv)
}

fn direct_setup(codec: VideoCodec) -> (DecodeSession, Arc<FakeM2mDevice>) {
    let decoder = linear_decoder();
    let locator = FakeDeviceLocator::new(vec![("s5p-mfc-dec", decoder.clone())]);
    let session = DecodeSession::open(&locator, test_config(codec)).unwrap();
    (session, decoder)
}

fn wait_until(timeout_ms: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

// ── device selection ─────────────────────────────────────────────────

#[test]
fn open_chains_converter_when_capture_is_tiled() {
    init_tracing();
    let (mut session, decoder, _conv) = chained_setup(VideoCodec::H264);
    assert!(session.is_chaining());
    // Only the OUTPUT format is committed before the header arrives.
    assert_eq!(decoder.set_format_calls(), 1);
    assert!(session.picture_layout().is_none());
    assert!(session.retrieve().unwrap().is_none());
}

#[test]
fn open_skips_converter_for_linear_capture() {
    init_tracing();
    let (session, decoder) = direct_setup(VideoCodec::H264);
    assert!(!session.is_chaining());
    // OUTPUT and CAPTURE both committed up front.
    assert_eq!(decoder.set_format_calls(), 2);
}

#[test]
fn open_fails_without_decoder() {
    init_tracing();
    let locator = FakeDeviceLocator::new(vec![("uvcvideo", Arc::new(FakeM2mDevice::new()))]);
    let err = DecodeSession::open(&locator, test_config(VideoCodec::H264)).unwrap_err();
    assert!(matches!(err, DecodeError::NoDevice { role: "decoder" }));
}

#[test]
fn open_rejects_decoder_without_streaming_caps() {
    init_tracing();
    let crippled = Arc::new(FakeM2mDevice::new().with_caps(DeviceCaps::default()));
    let locator = FakeDeviceLocator::new(vec![("s5p-mfc-dec", crippled)]);
    let err = DecodeSession::open(&locator, test_config(VideoCodec::H264)).unwrap_err();
    assert!(matches!(err, DecodeError::NoDevice { role: "decoder" }));
}

#[test]
fn open_fails_when_converter_missing() {
    init_tracing();
    let locator = FakeDeviceLocator::new(vec![("s5p-mfc-dec", tiled_decoder())]);
    let err = DecodeSession::open(&locator, test_config(VideoCodec::H264)).unwrap_err();
    assert!(matches!(err, DecodeError::NoDevice { role: "converter" }));
}

// ── header processing ────────────────────────────────────────────────

#[test]
fn header_negotiation_runs_exactly_once() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);

    session.submit(&[b"sps-pps"]).unwrap();
    assert!(decoder.is_streaming(QueueType::Output));
    assert!(decoder.is_streaming(QueueType::Capture));
    assert_eq!(decoder.min_buffer_queries(), 1);
    // min 2 buffers, 1.5x headroom -> 3, all queued to the device.
    assert_eq!(decoder.queued_len(QueueType::Capture), 3);
    assert_eq!(session.picture_crop(), Some(CropRect::new(0, 0, 1280, 720)));
    let layout = session.picture_layout().unwrap();
    assert_eq!(layout.fourcc, FourCc::NV12M);

    for _ in 0..5 {
        session.submit(&[b"frame"]).unwrap();
    }
    assert_eq!(decoder.min_buffer_queries(), 1);
    // OUTPUT pool at open, CAPTURE pool at header time.
    assert_eq!(decoder.map_calls(), 2);
}

#[test]
fn header_chunks_are_concatenated() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"ab", b"cde"]).unwrap();
    assert_eq!(decoder.last_queued_bytes(QueueType::Output), Some(5));
}

#[test]
fn header_consumes_whole_call_for_parameter_set_codecs() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"sps-pps"]).unwrap();
    // The single header submission was already reclaimed.
    assert_eq!(decoder.completed_len(QueueType::Output), 0);
}

#[test]
fn h263_first_submit_also_queues_a_frame() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H263);
    session.submit(&[b"first-frame"]).unwrap();
    // Header slot reclaimed, then the same payload queued as a frame.
    assert_eq!(decoder.completed_len(QueueType::Output), 1);
}

// ── steady-state submit ──────────────────────────────────────────────

#[test]
fn submit_timeout_is_a_hard_error() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();

    // Device stops consuming; the pool saturates after three frames.
    decoder.set_auto_complete_output(false);
    for i in 0..3u8 {
        session.submit(&[&[i]]).unwrap();
    }
    let err = session.submit(&[b"stall"]).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::Device(DeviceError::PollTimeout { timeout_ms: 50 })
    ));

    // The failure left the pool consistent: once the device makes
    // progress again, submission resumes.
    assert_eq!(decoder.complete_output(1), 1);
    session.submit(&[b"resume"]).unwrap();
}

#[test]
fn working_set_stays_bounded() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();
    for i in 0..20u8 {
        session.submit(&[&[i]]).unwrap();
        let in_flight = decoder.queued_len(QueueType::Output)
            + decoder.completed_len(QueueType::Output);
        assert!(in_flight <= 3, "working set grew to {in_flight}");
    }
}

// ── retrieve / release ───────────────────────────────────────────────

#[test]
fn retrieve_is_none_until_a_picture_finishes() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();
    assert!(session.retrieve().unwrap().is_none());

    decoder.complete_capture(1);
    let frame = session.retrieve().unwrap().expect("finished picture");
    assert_eq!(frame.index, 0);
    assert!(!frame.planes.is_empty());
    assert!(session.retrieve().unwrap().is_none());
}

#[test]
fn release_requeues_the_picture_buffer() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();
    decoder.complete_capture(1);
    let frame = session.retrieve().unwrap().unwrap();
    assert_eq!(decoder.queued_len(QueueType::Capture), 2);

    session.release(frame.index).unwrap();
    assert_eq!(decoder.queued_len(QueueType::Capture), 3);

    // The slot went back to the device; a second release is a
    // contract violation, not a no-op.
    assert!(matches!(
        session.release(frame.index),
        Err(DecodeError::Pool(_))
    ));
}

#[test]
fn release_rejects_unknown_handles() {
    init_tracing();
    let (mut session, decoder) = direct_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();
    decoder.complete_capture(1);
    session.retrieve().unwrap().unwrap();
    assert!(matches!(
        session.release(99),
        Err(DecodeError::InvalidHandle { index: 99 })
    ));
}

// ── conversion bridge ────────────────────────────────────────────────

#[test]
fn bridge_relays_pictures_and_returns_buffers() {
    init_tracing();
    let (mut session, decoder, conv) = chained_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();
    assert_eq!(decoder.queued_len(QueueType::Capture), 3);

    // One decoded picture: forward relay imports it into the
    // converter, the converter "finishes" it instantly, and the
    // return relay hands the slot back to the decoder.
    decoder.complete_capture(1);
    assert!(wait_until(1000, || {
        conv.last_queued_bytes(QueueType::Output).is_some()
    }));
    assert!(wait_until(1000, || {
        decoder.queued_len(QueueType::Capture) == 3
            && decoder.completed_len(QueueType::Capture) == 0
    }));

    // Nothing for the caller until the converter emits a picture.
    assert!(session.retrieve().unwrap().is_none());
    conv.complete_capture(1);
    let frame = session.retrieve().unwrap().expect("converted picture");
    session.release(frame.index).unwrap();
    assert_eq!(conv.queued_len(QueueType::Capture), 3);
}

#[test]
fn bridge_fault_surfaces_on_the_next_call() {
    init_tracing();
    let (mut session, decoder, _conv) = chained_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();

    decoder.fail_dequeue(QueueType::Capture, "EIO");
    decoder.complete_capture(1);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match session.retrieve() {
            Err(DecodeError::BridgeFault(msg)) => {
                assert!(msg.contains("EIO"), "unexpected fault: {msg}");
                break;
            }
            Ok(None) => {
                assert!(Instant::now() < deadline, "fault never surfaced");
                thread::sleep(Duration::from_millis(5));
            }
            other => panic!("expected bridge fault, got {other:?}"),
        }
    }
}

// ── teardown ─────────────────────────────────────────────────────────

#[test]
fn close_stops_streaming_everywhere() {
    init_tracing();
    let (mut session, decoder, conv) = chained_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();

    session.close();
    assert!(!decoder.is_streaming(QueueType::Output));
    assert!(!decoder.is_streaming(QueueType::Capture));
    assert!(!conv.is_streaming(QueueType::Output));
    assert!(!conv.is_streaming(QueueType::Capture));

    session.close(); // idempotent
    assert!(matches!(session.submit(&[b"x"]), Err(DecodeError::Closed)));
    assert!(matches!(session.retrieve(), Err(DecodeError::Closed)));
}

#[test]
fn drop_tears_the_pipeline_down() {
    init_tracing();
    let (mut session, decoder, conv) = chained_setup(VideoCodec::H264);
    session.submit(&[b"header"]).unwrap();
    drop(session);
    assert!(!decoder.is_streaming(QueueType::Capture));
    assert!(!conv.is_streaming(QueueType::Capture));
}
