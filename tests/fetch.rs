//! HttpFetcher and the full gateway against a local document server.

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use memexec::AnonymousImage;
use pdf_crop_gateway::{
    build_launcher, router, CropError, CropService, Fetcher, HttpFetcher, ServiceConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const PDF: &[u8] = b"%PDF-1.7\n%fake document\n";
const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

async fn document_server() -> SocketAddr {
    let app = Router::new()
        .route("/doc.pdf", get(|| async { PDF }))
        .route("/page.png", get(|| async { PNG }))
        .route("/empty.pdf", get(|| async { "" }))
        .route("/big.pdf", get(|| async { vec![b'x'; 4096] }))
        .route(
            "/chunked.pdf",
            get(|| async {
                let chunks = (0..8).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'y'; 512])));
                Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .route("/moved.pdf", get(|| async { Redirect::temporary("/doc.pdf") }))
        .route(
            "/slow.pdf",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                PDF
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(Duration::from_secs(1), 1024).unwrap()
}

#[tokio::test]
async fn fetches_document_bytes() {
    let addr = document_server().await;
    let body = fetcher()
        .fetch(&format!("http://{addr}/doc.pdf"))
        .await
        .unwrap();
    assert_eq!(body, PDF);
}

#[tokio::test]
async fn follows_redirects() {
    let addr = document_server().await;
    let body = fetcher()
        .fetch(&format!("http://{addr}/moved.pdf"))
        .await
        .unwrap();
    assert_eq!(body, PDF);
}

#[tokio::test]
async fn not_found_is_a_fetch_error() {
    let addr = document_server().await;
    let err = fetcher()
        .fetch(&format!("http://{addr}/missing.pdf"))
        .await
        .unwrap_err();
    match err {
        CropError::Fetch { reason, .. } => assert!(reason.contains("404"), "got: {reason}"),
        other => panic!("expected fetch error, got: {other}"),
    }
}

#[tokio::test]
async fn empty_body_is_a_fetch_error() {
    let addr = document_server().await;
    let err = fetcher()
        .fetch(&format!("http://{addr}/empty.pdf"))
        .await
        .unwrap_err();
    assert!(matches!(err, CropError::Fetch { .. }), "got: {err}");
}

#[tokio::test]
async fn oversized_documents_are_rejected() {
    let addr = document_server().await;

    let err = fetcher()
        .fetch(&format!("http://{addr}/big.pdf"))
        .await
        .unwrap_err();
    assert!(matches!(err, CropError::DocumentTooLarge { limit: 1024, .. }), "got: {err}");

    // No Content-Length: the cap is enforced while streaming.
    let err = fetcher()
        .fetch(&format!("http://{addr}/chunked.pdf"))
        .await
        .unwrap_err();
    assert!(matches!(err, CropError::DocumentTooLarge { .. }), "got: {err}");
}

#[tokio::test]
async fn slow_server_times_out() {
    let addr = document_server().await;
    let err = fetcher()
        .fetch(&format!("http://{addr}/slow.pdf"))
        .await
        .unwrap_err();
    assert!(matches!(err, CropError::FetchTimeout { secs: 1, .. }), "got: {err}");
}

#[tokio::test]
async fn unreachable_host_is_a_fetch_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = fetcher()
        .fetch(&format!("http://{addr}/doc.pdf"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "fetch");
}

#[tokio::test]
async fn gateway_serves_converted_remote_document() {
    let addr = document_server().await;
    let work = TempDir::new().unwrap();
    let config = ServiceConfig::builder()
        .work_dir(work.path())
        .build()
        .unwrap();

    let image = AnonymousImage::create("crop", b"#!/bin/sh\ncp \"$1\" \"$2\"\n").unwrap();
    let launcher = build_launcher(&config, Arc::new(image));
    let service = Arc::new(CropService::new(&config, launcher).unwrap());
    let app = router(service, &config).unwrap();

    let req = Request::builder()
        .method("POST")
        .uri("/fetch")
        .body(Body::from(format!("http://{addr}/page.png\n")))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/png");
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], PNG);
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}
