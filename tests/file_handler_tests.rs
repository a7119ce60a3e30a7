
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use fleet_agent::handlers::{
    DeleteFileHandler, DownloadFileHandler, GetFileInfoHandler, MoveFileHandler,
};
use fleet_agent::protocol::{dispatch, types, HandlerRegistry, Message, ResponseCode};
use test_harness::{loopback_session, next_outbound};

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(types::GET_FILE_INFO, Arc::new(GetFileInfoHandler))
        .unwrap();
    registry
        .register(types::DELETE_FILE, Arc::new(DeleteFileHandler))
        .unwrap();
    registry
        .register(types::MOVE_FILE, Arc::new(MoveFileHandler))
        .unwrap();
    registry
        .register(
            types::DOWNLOAD_FILE,
            Arc::new(DownloadFileHandler::new(reqwest::Client::new())),
        )
        .unwrap();
    registry
}

/// Serve `body` with a 200 status once per connection over plain HTTP/1.1
async fn serve_body(body: &'static [u8]) -> SocketAddr {
    serve_response("200 OK", body).await
}

async fn serve_response(status: &'static str, body: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes()).await;
                let _ = stream.write_all(body).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// Accept connections and never answer
async fn serve_nothing() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

async fn call(registry: &HandlerRegistry, msg_type: &str, data: serde_json::Value) -> Message {
    let (session, mut rx) = loopback_session("agent-1");
    dispatch(registry, &session, Message::request(msg_type, data)).await;
    next_outbound(&mut rx, Duration::from_secs(5)).await
}

#[tokio::test]
async fn test_get_file_info() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.txt");
    std::fs::write(&path, b"12345678").unwrap();

    let reply = call(&registry(), types::GET_FILE_INFO, json!({"path": path})).await;

    assert_eq!(reply.code, Some(ResponseCode::Success));
    assert_eq!(reply.data["name"], "report.txt");
    assert_eq!(reply.data["size"], 8);
    assert_eq!(reply.data["isDir"], false);
    assert!(reply.data["modTime"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_get_file_info_missing_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent");

    let reply = call(&registry(), types::GET_FILE_INFO, json!({"path": path})).await;

    assert_eq!(reply.code, Some(ResponseCode::Error));
    assert!(!reply.msg.is_empty());
}

#[tokio::test]
async fn test_invalid_payload_gets_error_response() {
    let reply = call(&registry(), types::MOVE_FILE, json!({"src": 1})).await;

    assert_eq!(reply.code, Some(ResponseCode::Error));
    assert!(reply.msg.starts_with("invalid request"));
}

#[tokio::test]
async fn test_delete_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("old.log");
    std::fs::write(&path, b"x").unwrap();

    let reply = call(&registry(), types::DELETE_FILE, json!({"path": path})).await;

    assert_eq!(reply.code, Some(ResponseCode::Success));
    assert!(!path.exists());

    let again = call(&registry(), types::DELETE_FILE, json!({"path": path})).await;
    assert_eq!(again.code, Some(ResponseCode::Error));
}

#[tokio::test]
async fn test_move_file() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("a.bin");
    let dest = dir.path().join("b.bin");
    std::fs::write(&src, b"payload").unwrap();

    let reply = call(&registry(), types::MOVE_FILE, json!({"src": src, "dest": dest})).await;

    assert_eq!(reply.code, Some(ResponseCode::Success));
    assert!(!src.exists());
    assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
}

#[tokio::test]
async fn test_download_creates_directories() {
    let addr = serve_body(b"downloaded bytes").await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("nested").join("deeper").join("file.bin");

    let reply = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({
            "url": format!("http://{}/file.bin", addr),
            "destPath": dest,
            "autoCreateDir": true,
            "timeout": 5
        }),
    )
    .await;

    assert_eq!(reply.code, Some(ResponseCode::Success), "{}", reply.msg);
    assert_eq!(std::fs::read(&dest).unwrap(), b"downloaded bytes");
}

#[tokio::test]
async fn test_download_without_auto_create_fails_for_missing_dir() {
    let addr = serve_body(b"data").await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("missing").join("file.bin");

    let reply = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({"url": format!("http://{}/f", addr), "destPath": dest, "timeout": 5}),
    )
    .await;

    assert_eq!(reply.code, Some(ResponseCode::Error));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_download_respects_overwrite_guard() {
    let addr = serve_body(b"new contents").await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("config.yaml");
    std::fs::write(&dest, b"old contents").unwrap();
    let url = format!("http://{}/config.yaml", addr);

    let refused = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({"url": url, "destPath": dest, "timeout": 5}),
    )
    .await;
    assert_eq!(refused.code, Some(ResponseCode::Error));
    assert!(refused.msg.contains("overwriteExisted"));
    assert_eq!(std::fs::read(&dest).unwrap(), b"old contents");

    let replaced = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({"url": url, "destPath": dest, "overwriteExisted": true, "timeout": 5}),
    )
    .await;
    assert_eq!(replaced.code, Some(ResponseCode::Success));
    assert_eq!(std::fs::read(&dest).unwrap(), b"new contents");
}

#[tokio::test]
async fn test_download_timeout_answers_timeout() {
    let addr = serve_nothing().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("never.bin");

    let reply = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({"url": format!("http://{}/slow", addr), "destPath": dest, "timeout": 1}),
    )
    .await;

    assert_eq!(reply.code, Some(ResponseCode::Timeout));
    assert!(!dest.exists());
}

/// Names in `dir`, sorted
fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_failed_download_keeps_existing_file() {
    let addr = serve_response("404 Not Found", b"missing").await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("config.bin");
    std::fs::write(&dest, b"precious").unwrap();

    let reply = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({
            "url": format!("http://{}/config.bin", addr),
            "destPath": dest,
            "overwriteExisted": true,
            "timeout": 5
        }),
    )
    .await;

    assert_eq!(reply.code, Some(ResponseCode::Error));
    assert!(reply.msg.contains("404"), "{}", reply.msg);
    assert_eq!(std::fs::read(&dest).unwrap(), b"precious");
    assert_eq!(entries(dir.path()), vec!["config.bin"]);
}

#[tokio::test]
async fn test_timed_out_download_keeps_existing_file() {
    let addr = serve_nothing().await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("config.bin");
    std::fs::write(&dest, b"precious").unwrap();

    let reply = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({
            "url": format!("http://{}/config.bin", addr),
            "destPath": dest,
            "overwriteExisted": true,
            "timeout": 1
        }),
    )
    .await;

    assert_eq!(reply.code, Some(ResponseCode::Timeout));
    assert_eq!(std::fs::read(&dest).unwrap(), b"precious");
    assert_eq!(entries(dir.path()), vec!["config.bin"]);
}

#[tokio::test]
async fn test_download_leaves_no_partial_files() {
    let addr = serve_body(b"fresh").await;
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");

    let reply = call(
        &registry(),
        types::DOWNLOAD_FILE,
        json!({"url": format!("http://{}/out.bin", addr), "destPath": dest, "timeout": 5}),
    )
    .await;

    assert_eq!(reply.code, Some(ResponseCode::Success));
    assert_eq!(entries(dir.path()), vec!["out.bin"]);
}
