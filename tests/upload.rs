mod common;

use common::{CountingTokenSource, ProgressLog, UPLOADS_PATH, blob_of, blob_path, fast_config, write_blob};
use mockito::{Matcher, Server};
use registry_blob_transfer::registry::operations::manifest_operations::DOCKER_MANIFEST_V2;
use registry_blob_transfer::{FailureClass, TransferError, UploadOptions, upload};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CHALLENGE: &str = r#"Bearer realm="http://auth.invalid/token",service="registry",scope="repository:library/_:push,pull""#;

#[tokio::test]
async fn uploads_only_blobs_missing_from_registry() {
    let dir = TempDir::new().unwrap();
    let missing = write_blob(dir.path(), "model weights ".repeat(300).as_bytes());
    let present = write_blob(dir.path(), b"license text");
    let mut server = Server::new_async().await;

    let head_missing = server
        .mock("HEAD", blob_path(&missing.digest).as_str())
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let head_present = server
        .mock("HEAD", blob_path(&present.digest).as_str())
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let init = server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::UrlEncoded("digest".into(), missing.digest.clone()))
        .with_status(202)
        .with_header("docker-upload-location", "/v2/library/_/blobs/uploads/session-1")
        .expect(1)
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-1")
        .match_query(Matcher::UrlEncoded("digest".into(), missing.digest.clone()))
        .match_header("content-type", "application/octet-stream")
        .match_body("model weights ".repeat(300).as_str())
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let progress = ProgressLog::default();
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![missing.clone(), present])
        .with_config(fast_config())
        .with_progress(progress.callback());
    upload(options).await.unwrap();

    head_missing.assert_async().await;
    head_present.assert_async().await;
    init.assert_async().await;
    put.assert_async().await;

    // Only the transferred blob counts toward the total
    let size = missing.size as i64;
    assert_eq!(progress.last(), Some((size, size)));
}

#[tokio::test]
async fn single_401_triggers_exactly_one_token_exchange() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"tokenizer.json contents");
    let mut server = Server::new_async().await;

    let unauthorized = server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .match_header("authorization", Matcher::Missing)
        .with_status(401)
        .with_header("www-authenticate", CHALLENGE)
        .expect(1)
        .create_async()
        .await;
    let head = server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .match_header("authorization", "Bearer fresh")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let init = server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer fresh")
        .with_status(202)
        .with_header("location", "/v2/library/_/blobs/uploads/session-2")
        .expect(1)
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-2")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer fresh")
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let source = CountingTokenSource::new("fresh");
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_config(fast_config())
        .with_token_source(source.clone());
    upload(options).await.unwrap();

    unauthorized.assert_async().await;
    head.assert_async().await;
    init.assert_async().await;
    put.assert_async().await;
    assert_eq!(source.calls(), 1);
    assert_eq!(
        source.last_scope.lock().unwrap().as_deref(),
        Some("repository:library/_:push,pull")
    );
}

#[tokio::test]
async fn no_401_means_no_token_exchange() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"already there");
    let mut server = Server::new_async().await;

    let head = server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .match_header("authorization", "Bearer initial")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let source = CountingTokenSource::new("unused");
    let progress = ProgressLog::default();
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_token("initial")
        .with_token_source(source.clone())
        .with_progress(progress.callback());
    upload(options).await.unwrap();

    head.assert_async().await;
    assert_eq!(source.calls(), 0);
    // Nothing needed uploading, so nothing was reported
    assert!(progress.values().is_empty());
}

#[tokio::test]
async fn cdn_redirect_restreams_body_without_token() {
    let dir = TempDir::new().unwrap();
    let data = "layer bytes ".repeat(1000);
    let blob = write_blob(dir.path(), data.as_bytes());
    let mut server = Server::new_async().await;
    let mut cdn = Server::new_async().await;

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .with_status(202)
        .with_header("location", "/v2/library/_/blobs/uploads/session-3")
        .create_async()
        .await;
    let registry_put = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-3")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer secret")
        .with_status(307)
        .with_header("location", &format!("{}/bucket/object?signature=abc", cdn.url()))
        .expect(1)
        .create_async()
        .await;
    let cdn_put = cdn
        .mock("PUT", "/bucket/object")
        .match_query(Matcher::UrlEncoded("signature".into(), "abc".into()))
        .match_header("authorization", Matcher::Missing)
        .match_body(data.as_str())
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let progress = ProgressLog::default();
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob.clone()])
        .with_token("secret")
        .with_config(fast_config())
        .with_progress(progress.callback());
    upload(options).await.unwrap();

    registry_put.assert_async().await;
    cdn_put.assert_async().await;

    let size = blob.size as i64;
    assert!(progress.dipped(), "redirect should roll back the first stream");
    assert_eq!(progress.last(), Some((size, size)));
    assert!(progress.values().iter().all(|(completed, _)| *completed <= size));
}

#[tokio::test]
async fn manifest_is_pushed_after_blobs() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"config");
    let manifest = format!(
        r#"{{"schemaVersion":2,"mediaType":"{}","config":{{"digest":"{}","size":{}}},"layers":[]}}"#,
        DOCKER_MANIFEST_V2, blob.digest, blob.size
    );
    let mut server = Server::new_async().await;

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(200)
        .create_async()
        .await;
    let manifest_put = server
        .mock("PUT", "/v2/library/_/manifests/v1")
        .match_header("content-type", DOCKER_MANIFEST_V2)
        .match_body(manifest.as_str())
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_manifest(manifest.clone(), "v1")
        .with_config(fast_config());
    upload(options).await.unwrap();

    manifest_put.assert_async().await;
}

#[tokio::test]
async fn unauthorized_without_token_source_is_terminal() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"private");
    let mut server = Server::new_async().await;

    let head = server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(401)
        .with_header("www-authenticate", CHALLENGE)
        .expect(1)
        .create_async()
        .await;

    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_config(fast_config());
    let err = upload(options).await.unwrap_err();

    head.assert_async().await;
    assert_eq!(err.class(), FailureClass::Terminal);
    match err {
        TransferError::Blob { source, .. } => assert!(matches!(*source, TransferError::Unauthorized(_))),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_upload_location_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"weights");
    let mut server = Server::new_async().await;

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    let init = server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_config(fast_config());
    let err = upload(options).await.unwrap_err();

    init.assert_async().await;
    match err {
        TransferError::Blob { operation, source, .. } => {
            assert_eq!(operation, "upload");
            assert!(matches!(*source, TransferError::ProtocolViolation(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn failing_put_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"flaky");
    let mut server = Server::new_async().await;

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .with_status(202)
        .with_header("location", "/v2/library/_/blobs/uploads/session-4")
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-4")
        .match_query(Matcher::Any)
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let progress = ProgressLog::default();
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_config(fast_config())
        .with_progress(progress.callback());
    let err = upload(options).await.unwrap_err();

    put.assert_async().await;
    match err {
        TransferError::Blob { source, .. } => {
            assert!(matches!(*source, TransferError::MaxRetriesExceeded { .. }))
        }
        other => panic!("unexpected error: {other}"),
    }
    // Every failed attempt was rolled back
    assert_eq!(progress.last().map(|(completed, _)| completed), Some(0));
}

#[tokio::test]
async fn missing_local_file_fails_before_any_request() {
    let dir = TempDir::new().unwrap();
    let blob = blob_of(b"never written");
    let mut server = Server::new_async().await;

    let head = server
        .mock("HEAD", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let options = UploadOptions::new(server.url(), dir.path()).with_blobs(vec![blob]);
    let err = upload(options).await.unwrap_err();

    head.assert_async().await;
    assert!(matches!(err, TransferError::Validation(_)));
}

#[tokio::test]
async fn put_401_refreshes_token_and_resends_once() {
    let dir = TempDir::new().unwrap();
    let data = "shard ".repeat(2000);
    let blob = write_blob(dir.path(), data.as_bytes());
    let mut server = Server::new_async().await;

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    let init = server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .with_status(202)
        .with_header("location", "/v2/library/_/blobs/uploads/session-6")
        .expect(1)
        .create_async()
        .await;
    let rejected = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-6")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer stale")
        .with_status(401)
        .with_header("www-authenticate", CHALLENGE)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-6")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer fresh")
        .match_body(data.as_str())
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let source = CountingTokenSource::new("fresh");
    let progress = ProgressLog::default();
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob.clone()])
        .with_token("stale")
        .with_token_source(source.clone())
        .with_config(fast_config())
        .with_progress(progress.callback());
    upload(options).await.unwrap();

    init.assert_async().await;
    rejected.assert_async().await;
    accepted.assert_async().await;
    assert_eq!(source.calls(), 1);

    let size = blob.size as i64;
    assert_eq!(progress.last(), Some((size, size)));
    assert!(progress.values().iter().all(|(completed, _)| *completed <= size));
}

#[tokio::test]
async fn second_put_401_fails_the_attempt() {
    let dir = TempDir::new().unwrap();
    let blob = write_blob(dir.path(), b"still forbidden");
    let mut server = Server::new_async().await;

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .with_status(202)
        .with_header("location", "/v2/library/_/blobs/uploads/session-7")
        .create_async()
        .await;
    let put = server
        .mock("PUT", "/v2/library/_/blobs/uploads/session-7")
        .match_query(Matcher::Any)
        .with_status(401)
        .with_header("www-authenticate", CHALLENGE)
        .expect(2)
        .create_async()
        .await;

    let source = CountingTokenSource::new("fresh");
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob])
        .with_token("stale")
        .with_token_source(source.clone())
        .with_config(fast_config().with_max_retries(1));
    let err = upload(options).await.unwrap_err();

    put.assert_async().await;
    assert_eq!(source.calls(), 1);
    match err {
        TransferError::Blob { source, .. } => match *source {
            TransferError::MaxRetriesExceeded { last } => {
                assert!(matches!(*last, TransferError::Status { status: 401, .. }))
            }
            other => panic!("unexpected cause: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
}

/// Read a request head; returns how many body bytes arrived with it
async fn read_request_head(socket: &mut TcpStream) -> usize {
    let mut head = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before request head");
        head.extend_from_slice(&buf[..n]);
        if let Some(end) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            return head.len() - (end + 4);
        }
    }
}

#[tokio::test]
async fn redirect_before_body_is_read_keeps_progress_within_total() {
    let dir = TempDir::new().unwrap();
    let data: Vec<u8> = (0..8 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let blob = write_blob(dir.path(), &data);
    let mut server = Server::new_async().await;
    let mut cdn = Server::new_async().await;

    // Registry that answers the PUT with a redirect right after the request
    // head, then drains the body slowly
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upload_host = listener.local_addr().unwrap();
    let location = format!("{}/bucket/object", cdn.url());
    let size = blob.size as usize;
    let drain = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = read_request_head(&mut socket).await;
        let response = format!(
            "HTTP/1.1 307 Temporary Redirect\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
            location
        );
        socket.write_all(response.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 64 * 1024];
        while received < size {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received += n,
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    server
        .mock("HEAD", blob_path(&blob.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", UPLOADS_PATH)
        .match_query(Matcher::Any)
        .with_status(202)
        .with_header("location", &format!("http://{}/upload/session-8", upload_host))
        .create_async()
        .await;
    let cdn_put = cdn
        .mock("PUT", "/bucket/object")
        .match_header("authorization", Matcher::Missing)
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let progress = ProgressLog::default();
    let options = UploadOptions::new(server.url(), dir.path())
        .with_blobs(vec![blob.clone()])
        .with_config(fast_config())
        .with_progress(progress.callback());
    upload(options).await.unwrap();

    cdn_put.assert_async().await;
    let total = blob.size as i64;
    assert_eq!(progress.last(), Some((total, total)));

    // Whatever the client still pushes into the abandoned request must not count
    let _ = tokio::time::timeout(Duration::from_secs(10), drain).await;
    assert_eq!(progress.last(), Some((total, total)));
    assert!(progress.values().iter().all(|(completed, _)| *completed <= total));
}
