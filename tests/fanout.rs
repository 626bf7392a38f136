use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{GenericImageView, Rgb, RgbImage};

use facewatch::config::LiveConfig;
use facewatch::fanout::{socket_path, wire};
use facewatch::stream::avi::MjpegAviBackend;
use facewatch::{
    Camera, FanoutError, Frame, Recorder, RtspConfig, RtspSource, SocketClient, SocketHandler,
    StreamServer, VideoStream,
};

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn stub_source(id: &str, fps: u32) -> RtspSource {
    RtspSource::new(RtspConfig {
        url: format!("stub://{}", id),
        display_url: format!("stub://{}", id),
        target_fps: fps,
        width: 64,
        height: 48,
    })
    .unwrap()
}

fn recorder(dir: &Path, camera: &Camera) -> Recorder {
    Recorder::new(
        camera.id.clone(),
        camera.label.clone(),
        dir.join("records").join(&camera.id),
        Arc::new(MjpegAviBackend::default()),
    )
}

#[test]
fn payload_bytes_arrive_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(dir.path(), "front");
    let server = StreamServer::bind(&path).unwrap();
    server.start().unwrap();

    let mut client = SocketClient::connect(&path).unwrap();
    assert!(wait_for(|| server.client_count() == 1));

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(server.send_to_clients(&payload).unwrap(), 1);
    assert_eq!(client.read_frame().unwrap(), payload);

    server.stop().unwrap();
    assert!(client.next().is_none());
    assert!(client.is_closed());
    client.close();
}

#[test]
fn oversized_frame_ends_the_subscription() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(dir.path(), "front");
    let server = StreamServer::bind(&path).unwrap();
    server.start().unwrap();

    let mut client = SocketClient::connect(&path).unwrap().with_max_frame(16);
    assert!(wait_for(|| server.client_count() == 1));
    server.send_to_clients(&[0u8; 64]).unwrap();
    server.send_to_clients(b"\xFF\xD8ok\xFF\xD9").unwrap();

    // The unread payload would be taken for the next header; the client gives up instead.
    assert!(matches!(
        client.next(),
        Some(Err(FanoutError::FrameTooLarge(64)))
    ));
    assert!(client.is_closed());
    assert!(client.next().is_none());
    assert!(matches!(
        client.read_frame(),
        Err(FanoutError::ConnectionClosed)
    ));
    server.stop().unwrap();
}

#[test]
fn stalled_subscriber_never_blocks_the_publisher() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(dir.path(), "front");
    let server = StreamServer::bind(&path)
        .unwrap()
        .with_write_timeout(Duration::from_millis(300));
    server.start().unwrap();

    let _idle = std::os::unix::net::UnixStream::connect(&path).unwrap();
    let mut reader = SocketClient::connect(&path).unwrap();
    assert!(wait_for(|| server.client_count() == 2));

    let payload: Vec<u8> = (0..512 * 1024u32).map(|i| (i % 253) as u8).collect();
    let expected = payload.clone();
    let reading = std::thread::spawn(move || {
        let mut frames = 0usize;
        for frame in reader.by_ref() {
            assert_eq!(frame.unwrap(), expected);
            frames += 1;
        }
        frames
    });

    let mut worst = Duration::ZERO;
    for _ in 0..20 {
        let started = Instant::now();
        server.send_to_clients(&payload).unwrap();
        worst = worst.max(started.elapsed());
        std::thread::sleep(Duration::from_millis(30));
    }
    assert!(worst < Duration::from_millis(500), "send took {:?}", worst);

    // The idle subscriber is dropped once its backlog stalls; the reader stays.
    assert!(wait_for(|| server.client_count() == 1));

    std::thread::sleep(Duration::from_millis(200));
    server.stop().unwrap();
    let frames = reading.join().unwrap();
    assert!(frames >= 1, "reader got {} frames", frames);
}

#[test]
fn socket_handler_publishes_downscaled_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Camera::new("front", "Front door", "stub://front");
    let live = LiveConfig {
        max_width: 32,
        ..LiveConfig::default()
    };
    let handler = SocketHandler::new(&camera, dir.path(), &live).unwrap();
    let server = handler.server();
    let mut thread = handler.into_thread();

    // Nobody listening: the frame is consumed without publishing.
    thread.start().unwrap();
    assert!(thread.push(Frame::new(RgbImage::from_pixel(64, 48, Rgb([200, 10, 10])), 1)));

    let mut client = SocketClient::for_camera(dir.path(), "front").unwrap();
    assert!(wait_for(|| server.client_count() == 1));
    assert!(wait_for(|| thread.stats().processed.load(std::sync::atomic::Ordering::Relaxed) == 1));

    assert!(thread.push(Frame::new(RgbImage::from_pixel(64, 48, Rgb([200, 10, 10])), 2)));
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let jpeg = client.read_frame().unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!(decoded.dimensions(), (32, 24));

    thread.stop().unwrap();
    assert!(!socket_path(dir.path(), "front").exists());
}

#[test]
fn throttled_subscriber_sees_at_most_max_fps() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Camera::new("yard", "Yard", "stub://yard");
    let handler = SocketHandler::new(&camera, dir.path(), &LiveConfig::default()).unwrap();
    let server = handler.server();

    let mut stream = VideoStream::new(
        camera.clone(),
        Box::new(stub_source("yard", 30)),
        recorder(dir.path(), &camera),
    );
    stream.attach(handler.into_thread(), 5);
    let mut handle = stream.start().unwrap();

    let mut client = SocketClient::for_camera(dir.path(), "yard").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    assert!(wait_for(|| server.client_count() == 1));

    let window = Duration::from_secs(2);
    let started = Instant::now();
    let mut received = 0u32;
    while started.elapsed() < window {
        match client.read_frame() {
            Ok(_) => received += 1,
            Err(err) => panic!("read failed: {}", err),
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    // One frame of slack for a push landing right at the window edge.
    assert!(
        f64::from(received) <= 5.0 * elapsed + 1.0,
        "{} frames in {:.2}s",
        received,
        elapsed
    );
    assert!(received >= 3, "only {} frames in {:.2}s", received, elapsed);

    drop(client);
    assert!(wait_for(|| server.client_count() == 0));
    assert!(handle.status().frames > u64::from(received));

    handle.stop().unwrap();
    assert!(!server.path().exists());
}

#[test]
fn one_failing_client_does_not_affect_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(dir.path(), "front");
    let server = StreamServer::bind(&path).unwrap();
    server.start().unwrap();

    let mut healthy = std::os::unix::net::UnixStream::connect(&path).unwrap();
    let broken = std::os::unix::net::UnixStream::connect(&path).unwrap();
    assert!(wait_for(|| server.client_count() == 2));
    broken.shutdown(std::net::Shutdown::Both).unwrap();
    drop(broken);

    for _ in 0..3 {
        server.send_to_clients(b"frame").unwrap();
    }
    for _ in 0..3 {
        assert_eq!(
            wire::read_message(&mut healthy, wire::DEFAULT_MAX_FRAME).unwrap(),
            b"frame"
        );
    }
    assert!(wait_for(|| server.client_count() == 1));
    server.stop().unwrap();
}
