//! Transport supervision against shell scripts standing in for the binary

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use gatehop_engine::{Error, Obfs4Params, TransportConfig, TransportExit, TransportSupervisor};

fn params() -> Obfs4Params {
    Obfs4Params {
        cert: "dGVzdC1jZXJ0".into(),
        iat_mode: 0,
    }
}

fn supervisor(dir: &Path, body: &str) -> TransportSupervisor {
    let bin_dir = dir.join("bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let path = bin_dir.join("piedispatcher");
    std::fs::write(&path, format!("#!/bin/sh\nSTATE=\"$4\"\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    TransportSupervisor::new(TransportConfig {
        bin_dir,
        state_dir: dir.join("state"),
        poll_interval_ms: 50,
        kill_grace_ms: 500,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_port_announced_in_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        dir.path(),
        "sleep 0.2\necho \"[NOTICE]: obfs4 - registered listener: 127.0.0.1:41234\" >> \"$STATE/dispatcher.log\"\nexec sleep 30",
    );

    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();
    assert!(process.pid().is_some());
    assert!(process.is_running());
    assert_eq!(process.local_port(), None);

    let port = process.await_local_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, 41234);
    assert_eq!(process.local_addr(), Some("127.0.0.1:41234".parse().unwrap()));

    process.stop().await;
    assert!(!process.is_running());
}

#[tokio::test]
async fn test_port_announced_on_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        dir.path(),
        "echo \"obfs4 - registered listener: 127.0.0.1:40001\"\nexec sleep 30",
    );

    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();
    let port = process.await_local_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, 40001);
    process.stop().await;
}

#[tokio::test]
async fn test_invalid_utf8_output_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        dir.path(),
        "printf 'caf\\377 starting\\n'\nsleep 0.3\necho \"obfs4 - registered listener: 127.0.0.1:4242\"\nexec sleep 30",
    );

    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();
    let port = process.await_local_port(Duration::from_secs(5)).await.unwrap();
    assert_eq!(port, 4242);
    assert!(process.is_running());

    process.stop().await;
}

#[tokio::test]
async fn test_arguments_passed_to_binary() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(
        dir.path(),
        "printf '%s\\n' \"$@\" > \"$STATE/args\"\necho \"registered listener 127.0.0.1:40002\"\nexec sleep 30",
    );

    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();
    process.await_local_port(Duration::from_secs(5)).await.unwrap();
    process.stop().await;

    let args = std::fs::read_to_string(dir.path().join("state").join("args")).unwrap();
    let args: Vec<&str> = args.lines().collect();
    let state = dir.path().join("state");
    assert_eq!(
        args,
        vec![
            "-transparent",
            "-client",
            "-state",
            state.to_str().unwrap(),
            "-target",
            "198.51.100.4:23050",
            "-transports",
            "obfs4",
            "-options",
            r#"{"cert":"dGVzdC1jZXJ0","iatMode":"0"}"#,
            "-logLevel",
            "DEBUG",
            "-enableLogging",
        ]
    );
}

#[tokio::test]
async fn test_stale_log_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(
        state.join("dispatcher.log"),
        "obfs4 - registered listener: 127.0.0.1:39999\n",
    )
    .unwrap();

    let supervisor = supervisor(dir.path(), "exec sleep 30");
    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();

    let result = process.await_local_port(Duration::from_millis(400)).await;
    assert!(matches!(result, Err(Error::TransportTimeout(_))));
    process.stop().await;
}

#[tokio::test]
async fn test_silent_transport_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "echo starting\nexec sleep 30");
    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();

    let timeout = Duration::from_millis(500);
    let started = Instant::now();
    let result = process.await_local_port(timeout).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(Error::TransportTimeout(t)) if t == timeout));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2));
    assert!(process.is_running());

    process.stop().await;
}

#[tokio::test]
async fn test_crash_before_announcement() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "echo \"bad cert\" >&2\nexit 3");
    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();

    let result = process.await_local_port(Duration::from_secs(5)).await;
    assert!(matches!(result, Err(Error::TransportCrashed(_))));
    assert!(!process.is_running());
    assert!(matches!(process.exited().await, TransportExit::Crashed(_)));

    // nothing left to kill
    process.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "exec sleep 30");
    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();

    let started = Instant::now();
    process.stop().await;
    process.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(!process.is_running());
    assert_eq!(process.exited().await, TransportExit::Stopped);
}

#[tokio::test]
async fn test_stop_while_waiting_for_port() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), "exec sleep 30");
    let process = supervisor.start("198.51.100.4", 23050, &params()).await.unwrap();

    let (waited, _) = tokio::join!(process.await_local_port(Duration::from_secs(10)), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.stop().await;
    });

    assert!(matches!(waited, Err(Error::TransportStopped)));
}
