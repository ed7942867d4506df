use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, Rgb, RgbImage};
use mjpeg_file_streamer::client::{self, ClientArgs, StreamConnection};
use mjpeg_file_streamer::config::{FrameRate, StreamConfig};
use mjpeg_file_streamer::multipart::{ImageKind, STREAM_CONTENT_TYPE};
use mjpeg_file_streamer::server::{self, AppState, STREAM_PATH};
use mjpeg_file_streamer::video_source::{write_mjpeg_frame, ActiveSources};
use std::fs::File;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const ERROR_IMAGE: &[u8] = include_bytes!("../static/playback_error.png");

fn write_clip(dir: &TempDir, frames: usize) -> String {
    let path = dir.path().join("clip.mjpeg");
    let mut file = File::create(&path).expect("create clip");
    for i in 0..frames {
        let img = RgbImage::from_fn(48, 32, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, (i * 9) as u8]));
        let mut jpeg = Vec::new();
        JpegEncoder::new(&mut jpeg).encode_image(&img).expect("encode fixture frame");
        write_mjpeg_frame(&mut file, &jpeg).expect("write fixture frame");
    }
    path.to_string_lossy().into_owned()
}

async fn start_server(video_path: &str, frame_rate: u32) -> (String, ActiveSources) {
    let config = StreamConfig::new(
        video_path,
        FrameRate::new(i64::from(frame_rate)).expect("valid rate"),
        Bytes::from_static(ERROR_IMAGE),
    );
    let state = AppState::new(config);
    let active = state.active_sources().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(server::serve(listener, state, std::future::pending()));
    (addr, active)
}

async fn wait_for_released(active: &ActiveSources) {
    for _ in 0..100 {
        if active.count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} video sources still open", active.count());
}

#[tokio::test]
async fn index_page_embeds_the_stream() {
    let (addr, _) = start_server("unused.mjpeg", 30).await;

    let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
    let uri = format!("http://{}/", addr).parse().unwrap();
    let response = client.get(uri).await.unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/html"), "{}", content_type);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("<img src=\"/stream_video_file\""));
}

#[tokio::test]
async fn non_stream_responses_are_refused() {
    let (addr, _) = start_server("unused.mjpeg", 30).await;

    let err = StreamConnection::connect(&addr, "/").await.err().unwrap();
    assert!(err.to_string().contains("content type"), "{:#}", err);

    let err = StreamConnection::connect(&addr, "/missing").await.err().unwrap();
    assert!(err.to_string().contains("404"), "{:#}", err);
}

#[tokio::test]
async fn streams_every_frame_of_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write_clip(&dir, 6);
    let (addr, active) = start_server(&path, 120).await;

    let mut connection = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
    assert_eq!(connection.content_type(), Some(STREAM_CONTENT_TYPE));

    let mut frames = 0;
    while let Some(part) = connection.next_part().await.unwrap() {
        assert_eq!(part.kind(), Some(ImageKind::Jpeg));
        let img = image::load_from_memory_with_format(&part.body, ImageFormat::Jpeg).unwrap();
        assert_eq!((img.width(), img.height()), (48, 32));
        frames += 1;
    }
    assert_eq!(frames, 6);
    wait_for_released(&active).await;
}

#[tokio::test]
async fn unopenable_file_streams_the_error_image_once() {
    let (addr, active) = start_server("/nonexistent/clip.mjpeg", 30).await;

    let mut connection = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
    let part = connection.next_part().await.unwrap().expect("error image part");
    assert_eq!(part.content_type(), Some("image/png"));
    assert_eq!(&part.body[..], ERROR_IMAGE);
    assert!(connection.next_part().await.unwrap().is_none());
    assert_eq!(active.count(), 0);
}

#[tokio::test]
async fn every_request_restarts_from_the_first_frame() {
    let dir = TempDir::new().unwrap();
    let path = write_clip(&dir, 3);
    let (addr, _) = start_server(&path, 120).await;

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut connection = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
        let mut bodies = Vec::new();
        while let Some(part) = connection.next_part().await.unwrap() {
            bodies.push(part.body);
        }
        runs.push(bodies);
    }
    assert_eq!(runs[0].len(), 3);
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn disconnecting_releases_the_video_source() {
    let dir = TempDir::new().unwrap();
    let path = write_clip(&dir, 200);
    let (addr, active) = start_server(&path, 10).await;

    for _ in 0..3 {
        let mut connection = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
        connection.next_part().await.unwrap().expect("first frame");
        assert_eq!(active.count(), 1);
        drop(connection);
        wait_for_released(&active).await;
    }
}

#[tokio::test]
async fn concurrent_streams_use_independent_sources() {
    let dir = TempDir::new().unwrap();
    let path = write_clip(&dir, 200);
    let (addr, active) = start_server(&path, 10).await;

    let mut first = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
    let mut second = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
    let a = first.next_part().await.unwrap().unwrap();
    let b = second.next_part().await.unwrap().unwrap();
    assert_eq!(a.body, b.body);
    assert_eq!(active.count(), 2);

    drop(first);
    drop(second);
    wait_for_released(&active).await;
}

#[tokio::test]
async fn client_saves_received_frames() {
    let dir = TempDir::new().unwrap();
    let path = write_clip(&dir, 4);
    let (addr, _) = start_server(&path, 120).await;
    let out = TempDir::new().unwrap();

    let count = client::run(ClientArgs {
        server_addr: addr,
        path: STREAM_PATH.to_string(),
        max_frames: Some(2),
        output_dir: Some(out.path().to_path_buf()),
    })
    .await
    .unwrap();

    assert_eq!(count, 2);
    assert!(out.path().join("frame_000001.jpg").exists());
    assert!(out.path().join("frame_000002.jpg").exists());
    assert!(!out.path().join("frame_000003.jpg").exists());
}

#[tokio::test]
async fn zero_max_frames_reads_nothing() {
    let dir = TempDir::new().unwrap();
    let path = write_clip(&dir, 4);
    let (addr, active) = start_server(&path, 120).await;
    let out = TempDir::new().unwrap();

    let count = client::run(ClientArgs {
        server_addr: addr,
        path: STREAM_PATH.to_string(),
        max_frames: Some(0),
        output_dir: Some(out.path().to_path_buf()),
    })
    .await
    .unwrap();

    assert_eq!(count, 0);
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    wait_for_released(&active).await;
}

#[cfg(not(feature = "ffmpeg"))]
#[tokio::test]
async fn bare_jpeg_file_streams_the_error_image() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raw.mjpeg");
    let mut data = Vec::new();
    for shade in [0u8, 120, 240] {
        let img = RgbImage::from_pixel(48, 32, Rgb([shade, shade, shade]));
        JpegEncoder::new(&mut data).encode_image(&img).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    let (addr, active) = start_server(path.to_str().unwrap(), 30).await;

    let mut connection = StreamConnection::connect(&addr, STREAM_PATH).await.unwrap();
    let part = connection.next_part().await.unwrap().expect("error image part");
    assert_eq!(part.kind(), Some(ImageKind::Png));
    assert_eq!(&part.body[..], ERROR_IMAGE);
    assert!(connection.next_part().await.unwrap().is_none());
    assert_eq!(active.count(), 0);
}
