//! Capped download against a local HTTP server.

use pretty_assertions::assert_eq;
use reqwest::Client;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use worker_convert::error::DownloadError;
use worker_convert::transfer::Downloader;

/// HEAD response declaring `len` bytes.
fn probe(len: usize) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/octet-stream")
        .insert_header("content-length", len.to_string().as_str())
        .set_body_bytes(vec![b'x'; len])
}

#[tokio::test]
async fn test_download_with_range_request() {
    let server = MockServer::start().await;
    let content = b"0123456789".to_vec();

    Mock::given(method("HEAD"))
        .and(path("/doc.docx"))
        .respond_with(probe(content.len()).insert_header("accept-ranges", "bytes"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/doc.docx"))
        .and(header("range", "bytes=0-10"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("original1");
    let downloader = Downloader::new(Client::new());

    let written = downloader
        .download(&format!("{}/doc.docx", server.uri()), &dest, 100)
        .await
        .unwrap();

    assert_eq!(written, 10);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[tokio::test]
async fn test_declared_length_over_cap_is_rejected_before_fetch() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/big.mov"))
        .respond_with(probe(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/big.mov"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 200]))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("original2");

    let result = Downloader::new(Client::new())
        .download(&format!("{}/big.mov", server.uri()), &dest, 100)
        .await;

    assert!(matches!(
        result,
        Err(DownloadError::TooLarge { size: 200, limit: 100 })
    ));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_actual_size_over_cap_is_rejected() {
    let server = MockServer::start().await;

    // No declared length: the cap becomes the expected length.
    Mock::given(method("HEAD"))
        .and(path("/liar.pdf"))
        .respond_with(probe(0))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/liar.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 150]))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("original3");

    let result = Downloader::new(Client::new())
        .download(&format!("{}/liar.pdf", server.uri()), &dest, 100)
        .await;

    assert!(matches!(result, Err(DownloadError::TooLarge { limit: 100, .. })));
}

#[tokio::test]
async fn test_probe_requires_content_type() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/untyped"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let result = Downloader::new(Client::new())
        .download(
            &format!("{}/untyped", server.uri()),
            &dir.path().join("original4"),
            100,
        )
        .await;

    assert!(matches!(result, Err(DownloadError::MissingContentType { .. })));
}

#[tokio::test]
async fn test_probe_status_error() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let result = Downloader::new(Client::new())
        .download(
            &format!("{}/missing.docx", server.uri()),
            &dir.path().join("original5"),
            100,
        )
        .await;

    match result {
        Err(DownloadError::Status { status, .. }) => assert_eq!(status.as_u16(), 404),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_range_server_without_length_cannot_truncate() {
    let server = MockServer::start().await;
    let content = vec![b'z'; 150];

    Mock::given(method("HEAD"))
        .and(path("/unsized.docx"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;
    // Honors the requested range: bytes 0..=100 of a 150-byte file.
    Mock::given(method("GET"))
        .and(path("/unsized.docx"))
        .and(header("range", "bytes=0-100"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content[..101].to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let result = Downloader::new(Client::new())
        .download(
            &format!("{}/unsized.docx", server.uri()),
            &dir.path().join("original6"),
            100,
        )
        .await;

    assert!(matches!(
        result,
        Err(DownloadError::TooLarge { size: 101, limit: 100 })
    ));
}

#[tokio::test]
async fn test_refused_url_is_retried_with_repaired_escapes() {
    let server = MockServer::start().await;
    let content = b"report".to_vec();

    // Only the repaired form is known to the server; the raw one gets 404.
    Mock::given(method("HEAD"))
        .and(path("/100%25.docx"))
        .respond_with(probe(content.len()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/100%25.docx"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("original7");

    let written = Downloader::new(Client::new())
        .download(&format!("{}/100%.docx", server.uri()), &dest, 100)
        .await
        .unwrap();

    assert_eq!(written, 6);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    let requests = server.received_requests().await.unwrap();
    let gets: Vec<String> = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(gets, vec!["/100%25.docx".to_string()]);
}
