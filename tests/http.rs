mod support;

use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use bytes::Bytes;
use camsnap::capture::{FrameMetadata, PixelFormat};
use camsnap::{server, Frame, FramePublisher, FramePump};
use http_body_util::BodyExt;
use support::{armed_fake_device, pattern, wait_until};
use tower::ServiceExt;

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    request(Method::GET, uri)
}

fn frame(sequence: u64, data: Bytes) -> Frame {
    Frame {
        data,
        meta: FrameMetadata {
            sequence,
            device_sequence: 41,
            device_timestamp: None,
        },
        captured_at: Instant::now(),
    }
}

#[tokio::test]
async fn not_ready_before_first_frame() {
    let app = server::router(FramePublisher::new(), "/image.jpg", PixelFormat::Mjpeg);

    let res = app.oneshot(get("/image.jpg")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()[header::RETRY_AFTER], "1");
    assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
}

#[tokio::test]
async fn serves_latest_frame_uncached() {
    let publisher = FramePublisher::new();
    let app = server::router(publisher.clone(), "/image.jpg", PixelFormat::Jpeg);

    let jpeg = Bytes::from_static(b"\xff\xd8\xff\xe0 not really a jpeg \xff\xd9");
    publisher.publish(frame(7, jpeg.clone()));

    let res = app.oneshot(get("/image.jpg")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(res.headers()["x-frame-sequence"], "7");
    assert_eq!(res.headers()[header::AGE], "0");
    assert!(res.headers().get("x-frame-timestamp").is_none());

    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, jpeg);
}

#[tokio::test]
async fn head_returns_headers_without_body() {
    let publisher = FramePublisher::new();
    let app = server::router(publisher.clone(), "/image.jpg", PixelFormat::Mjpeg);

    let res = app
        .clone()
        .oneshot(request(Method::HEAD, "/image.jpg"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()[header::RETRY_AFTER], "1");

    let mut published = frame(3, Bytes::from(vec![0xab; 2048]));
    published.meta.device_timestamp = Some(Duration::from_micros(1_250_000));
    publisher.publish(published);

    let res = app
        .oneshot(request(Method::HEAD, "/image.jpg"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
    assert_eq!(res.headers()["x-frame-sequence"], "3");
    assert_eq!(res.headers()["x-frame-timestamp"], "1250000");

    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

#[tokio::test]
async fn other_paths_are_not_found() {
    let app = server::router(FramePublisher::new(), "/snapshot.jpg", PixelFormat::Mjpeg);

    let res = app.oneshot(get("/image.jpg")).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pumped_frames_reach_http_clients() {
    let (device, control) = armed_fake_device(4096);
    let publisher = FramePublisher::new();
    let pump = FramePump::new(device, publisher.clone()).unwrap();
    let stop = pump.stop_signal();
    let pump_task = tokio::task::spawn_blocking(move || pump.run());
    let app = server::router(publisher.clone(), "/image.jpg", PixelFormat::Mjpeg);

    let res = app.clone().oneshot(get("/image.jpg")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let frame = pattern(1500, 42);
    control.push_frame(frame.clone());
    let watched = publisher.clone();
    let published = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(5), || watched.latest_sequence() == Some(1))
    })
    .await
    .unwrap();
    assert!(published);

    let res = app.oneshot(get("/image.jpg")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-frame-sequence"], "1");
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], &frame[..]);

    stop.stop();
    let report = pump_task.await.unwrap().unwrap();
    assert_eq!(report.frames_published, 1);
    // Device released once the pump has returned
    assert!(control.is_dropped());
}
