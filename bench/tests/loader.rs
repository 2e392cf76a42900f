// Background loader lifecycle with shell stand-ins for the data loader.
#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::time::Duration;

use sweep_bench::config::LoaderConfig;
use sweep_bench::runner::{DataLoader, LoadTarget, LoaderExit};

fn shell(script: &str) -> DataLoader {
    DataLoader::from_config(&LoaderConfig {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        ..LoaderConfig::default()
    })
    .unwrap()
}

async fn wait_for_line(log: &Path, needle: &str) {
    for _ in 0..200 {
        if std::fs::read_to_string(log).unwrap_or_default().contains(needle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{needle:?} never appeared in {}", log.display());
}

#[tokio::test]
async fn test_stop_terminates_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("loader.log");
    let mut loader = shell("echo started $LIMIT_POINTS; exec sleep 30")
        .spawn(LoadTarget::rows(2_000), &log)
        .unwrap();
    wait_for_line(&log, "started 2000").await;
    assert!(loader.is_alive());
    assert_eq!(loader.target(), LoadTarget::rows(2_000));

    let started = std::time::Instant::now();
    let exit = loader.stop(Duration::from_secs(5)).await.unwrap();
    match exit {
        LoaderExit::Terminated(status) => assert_eq!(status.signal(), Some(libc::SIGTERM)),
        other => panic!("expected graceful termination, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stop_kills_loader_that_ignores_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("loader.log");
    let loader = shell("trap '' TERM; echo trapped; while true; do sleep 0.05; done")
        .spawn(LoadTarget::rows(10), &log)
        .unwrap();
    wait_for_line(&log, "trapped").await;

    let started = std::time::Instant::now();
    let exit = loader.stop(Duration::from_millis(300)).await.unwrap();
    assert_eq!(exit, LoaderExit::Killed);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_dead_loader_is_observed() {
    let dir = tempfile::tempdir().unwrap();
    let mut loader = shell("exit 7")
        .spawn(LoadTarget::rows(10), &dir.path().join("loader.log"))
        .unwrap();

    let mut status = None;
    for _ in 0..200 {
        status = loader.try_status().unwrap();
        if status.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status.and_then(|s| s.code()), Some(7));
    assert!(!loader.is_alive());
    assert!(matches!(
        loader.stop(Duration::from_secs(1)).await.unwrap(),
        LoaderExit::AlreadyExited(s) if s.code() == Some(7)
    ));
}

/// Live process, not a zombie waiting to be reaped by init.
#[cfg(target_os = "linux")]
fn is_running(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => {
            let state = stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next());
            state != Some("Z")
        }
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
async fn wait_until_gone(pid: i32) {
    for _ in 0..100 {
        if !is_running(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker {pid} is still running");
}

#[cfg(target_os = "linux")]
async fn spawn_forking_loader(dir: &Path) -> (sweep_bench::runner::BackgroundLoader, i32) {
    let log = dir.join("loader.log");
    let pidfile = dir.join("worker.pid");
    let script = format!(
        "sleep 300 & echo $! > {}; echo forked; wait",
        pidfile.display()
    );
    let loader = shell(&script).spawn(LoadTarget::rows(10), &log).unwrap();
    wait_for_line(&log, "forked").await;
    let worker: i32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(is_running(worker));
    (loader, worker)
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_stop_reaches_forked_workers() {
    let dir = tempfile::tempdir().unwrap();
    let (loader, worker) = spawn_forking_loader(dir.path()).await;

    let exit = loader.stop(Duration::from_secs(2)).await.unwrap();
    assert!(matches!(exit, LoaderExit::Terminated(_)), "got {exit:?}");
    wait_until_gone(worker).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropping_loader_kills_forked_workers() {
    let dir = tempfile::tempdir().unwrap();
    let (loader, worker) = spawn_forking_loader(dir.path()).await;

    drop(loader);
    wait_until_gone(worker).await;
}
