//! Tests for the worker binary speaking frames over stdin/stdout.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::Command;

use tether_core::Message;
use tether_core::ipc::{read_frame, write_frame};

/// Test that the worker exits after cleanup even while the host keeps stdin open.
#[tokio::test]
async fn test_exits_after_cleanup_with_stdin_open() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tether-worker"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to start tether-worker");
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    write_frame(&mut stdin, &Message::call("1", "init", None))
        .await
        .unwrap();
    assert_eq!(
        read_frame(&mut stdout).await.unwrap(),
        Some(Message::success("1", None))
    );

    write_frame(&mut stdin, &Message::call("2", "cleanup", None))
        .await
        .unwrap();
    let reply = read_frame(&mut stdout).await.unwrap().unwrap();
    assert_eq!(reply.id, "2");
    assert_eq!(reply.success, Some(true));

    // stdin is still open here.
    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("worker should exit without waiting for stdin to close")
        .unwrap();
    assert!(status.success());
    drop(stdin);
}
