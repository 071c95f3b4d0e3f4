//! Wire-level tests: a raw TCP client talking JSON to a real worker.


use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use boltbuild::protocol::{frame_reader, read_frame, FrameReader, ProtocolError, PROTOCOL_VERSION};
use test_harness::{spawn_worker, wait_until};

async fn open(addr: &str) -> (FrameReader<OwnedReadHalf, Value>, tokio::net::tcp::OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    (frame_reader(read_half), write_half)
}

async fn next_value(reader: &mut FrameReader<OwnedReadHalf, Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(10), read_frame(reader))
        .await
        .expect("worker did not answer in time")
        .unwrap()
}

#[tokio::test]
async fn test_identity_is_sent_first() {
    let worker = spawn_worker().await;
    let (mut reader, _writer) = open(&worker.addr).await;

    let identity = next_value(&mut reader).await;

    assert_eq!(identity["id"], json!(format!("server-test-{}", worker.port)));
    assert_eq!(identity["address"], json!("127.0.0.1"));
    assert_eq!(identity["port"], json!(worker.port));
    assert_eq!(identity["capacity"], json!(2));
    assert_eq!(identity["version"], json!(PROTOCOL_VERSION));
}

#[tokio::test]
async fn test_request_with_null_collections_is_accepted() {
    let worker = spawn_worker().await;
    let (mut reader, mut writer) = open(&worker.addr).await;
    next_value(&mut reader).await;

    // Shape produced by encoders that write absent maps and lists as null.
    let request = json!({
        "id": "job-null",
        "environment": "shell",
        "command": "echo compat",
        "project_dir": "/tmp/whatever",
        "execution_dir": "",
        "output_paths": null,
        "env_vars": null,
        "files": null,
        "project_name": "project_job-null",
    });
    writer
        .write_all(serde_json::to_string(&request).unwrap().as_bytes())
        .await
        .unwrap();

    let result = next_value(&mut reader).await;
    assert_eq!(result["id"], json!("job-null"));
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["output"], json!("compat\n"));
    assert!(result["duration"].is_u64());
    assert!(result.get("error").is_none());
}

#[tokio::test]
async fn test_jobs_on_one_connection_answer_in_order() {
    let worker = spawn_worker().await;
    let (mut reader, mut writer) = open(&worker.addr).await;
    next_value(&mut reader).await;

    // Two requests back to back in one write, no separator.
    let mut batch = String::new();
    for n in 1..=2 {
        batch.push_str(
            &json!({
                "id": format!("job-{n}"),
                "command": format!("echo {n}"),
                "project_name": format!("project_seq_{n}"),
            })
            .to_string(),
        );
    }
    writer.write_all(batch.as_bytes()).await.unwrap();

    let first = next_value(&mut reader).await;
    let second = next_value(&mut reader).await;
    assert_eq!(first["id"], json!("job-1"));
    assert_eq!(first["output"], json!("1\n"));
    assert_eq!(second["id"], json!("job-2"));
    assert_eq!(second["output"], json!("2\n"));
}

#[tokio::test]
async fn test_failed_job_keeps_connection_open() {
    let worker = spawn_worker().await;
    let (mut reader, mut writer) = open(&worker.addr).await;
    next_value(&mut reader).await;

    let failing = json!({"id": "bad", "command": "false", "project_name": "project_bad"});
    writer.write_all(failing.to_string().as_bytes()).await.unwrap();
    let result = next_value(&mut reader).await;
    assert_eq!(result["success"], json!(false));
    assert!(result["error"].as_str().unwrap().contains("exit code 1"));
    assert!(result.get("output_files").is_none());

    let ok = json!({"id": "good", "command": "true", "project_name": "project_good"});
    writer.write_all(ok.to_string().as_bytes()).await.unwrap();
    let result = next_value(&mut reader).await;
    assert_eq!(result["id"], json!("good"));
    assert_eq!(result["success"], json!(true));
}

#[tokio::test]
async fn test_malformed_request_closes_connection() {
    let worker = spawn_worker().await;
    let (mut reader, mut writer) = open(&worker.addr).await;
    next_value(&mut reader).await;
    assert!(
        wait_until(Duration::from_secs(2), || async {
            worker.server.peers().await.len() == 1
        })
        .await
    );

    writer.write_all(b"this is not json\n").await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut reader))
        .await
        .unwrap();
    assert!(matches!(closed, Err(ProtocolError::Closed) | Err(ProtocolError::Io(_))));
    assert!(
        wait_until(Duration::from_secs(2), || async {
            worker.server.peers().await.is_empty()
        })
        .await
    );
}

#[tokio::test]
async fn test_each_connection_gets_its_own_identity_and_jobs() {
    let worker = spawn_worker().await;
    let (mut reader_a, mut writer_a) = open(&worker.addr).await;
    let (mut reader_b, mut writer_b) = open(&worker.addr).await;
    next_value(&mut reader_a).await;
    next_value(&mut reader_b).await;

    writer_a
        .write_all(json!({"id": "a", "command": "echo a", "project_name": "project_a"}).to_string().as_bytes())
        .await
        .unwrap();
    writer_b
        .write_all(json!({"id": "b", "command": "echo b", "project_name": "project_b"}).to_string().as_bytes())
        .await
        .unwrap();

    assert_eq!(next_value(&mut reader_a).await["output"], json!("a\n"));
    assert_eq!(next_value(&mut reader_b).await["output"], json!("b\n"));
}
