// Load generator invocation in direct mode with a shell stand-in.
#![cfg(unix)]

mod common;

use std::time::Duration;

use sweep_bench::config::{BenchmarkConfig, LaunchMode};
use sweep_bench::runner::{BenchmarkError, LoadGenerator};
use sweep_bench::{Knob, SearchParams};

fn params(parallel: u32) -> SearchParams {
    SearchParams {
        parallel,
        threads: 1,
        hnsw_ef: Knob::Value(64),
        search_limit: 10,
    }
}

fn generator(program: &std::path::Path, timeout_secs: Option<u64>) -> LoadGenerator {
    let config = BenchmarkConfig {
        launch: LaunchMode::Direct,
        program: program.to_string_lossy().into_owned(),
        timeout_secs,
        ..BenchmarkConfig::default()
    };
    LoadGenerator::new(&config, "http://127.0.0.1:6334", "bench", None)
}

#[tokio::test]
async fn test_successful_run_parses_result_file() {
    let dir = tempfile::tempdir().unwrap();
    let program = common::fake_load_generator(dir.path());
    let result = dir.path().join("cells/a.json");
    std::fs::create_dir_all(result.parent().unwrap()).unwrap();
    let log = dir.path().join("logs/a.log");

    let output = generator(&program, None)
        .run(&params(1), &result, &log)
        .await
        .unwrap();

    assert_eq!(output.rps, vec![100.0, 200.0]);
    assert_eq!(output.latencies.len(), 3);
    let log_text = std::fs::read_to_string(&log).unwrap();
    assert!(log_text.contains("parallel=1"), "{log_text}");
}

#[tokio::test]
async fn test_non_zero_exit_is_cell_failure() {
    let dir = tempfile::tempdir().unwrap();
    let program = common::fake_load_generator(dir.path());
    let log = dir.path().join("b.log");

    let err = generator(&program, None)
        .run(&params(2), &dir.path().join("b.json"), &log)
        .await
        .unwrap_err();

    assert!(matches!(err, BenchmarkError::Exit { .. }), "got {err:?}");
    assert!(std::fs::read_to_string(&log).unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_missing_output_is_cell_failure() {
    let dir = tempfile::tempdir().unwrap();
    let program = common::fake_load_generator(dir.path());

    let err = generator(&program, None)
        .run(&params(3), &dir.path().join("c.json"), &dir.path().join("c.log"))
        .await
        .unwrap_err();

    assert!(matches!(err, BenchmarkError::MissingOutput(_)), "got {err:?}");
}

#[tokio::test]
async fn test_spawn_failure_is_cell_failure() {
    let dir = tempfile::tempdir().unwrap();
    let err = generator(&dir.path().join("does-not-exist"), None)
        .run(&params(1), &dir.path().join("d.json"), &dir.path().join("d.log"))
        .await
        .unwrap_err();

    assert!(matches!(err, BenchmarkError::Spawn { .. }), "got {err:?}");
}

#[tokio::test]
async fn test_hung_generator_is_killed_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let program = common::script(dir.path(), "hang.sh", "exec sleep 30");

    let started = std::time::Instant::now();
    let err = generator(&program, Some(1))
        .run(&params(1), &dir.path().join("e.json"), &dir.path().join("e.log"))
        .await
        .unwrap_err();

    assert!(matches!(err, BenchmarkError::TimedOut(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_timed_out_container_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let calls = dir.path().join("runtime.calls");
    let runtime = common::script(
        dir.path(),
        "runtime.sh",
        &format!(
            "echo \"$*\" >> {}\nif [ \"$1\" = run ]; then exec sleep 30; fi",
            calls.display()
        ),
    );
    let config = BenchmarkConfig {
        launch: LaunchMode::Container,
        runtime: runtime.to_string_lossy().into_owned(),
        timeout_secs: Some(1),
        ..BenchmarkConfig::default()
    };
    let generator = LoadGenerator::new(&config, "http://127.0.0.1:6334", "bench", None);

    let err = generator
        .run(&params(1), &dir.path().join("cells/f.json"), &dir.path().join("f.log"))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchmarkError::TimedOut(_)), "got {err:?}");

    let lines: Vec<String> = std::fs::read_to_string(&calls)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(lines.len(), 3, "{lines:?}");
    assert_eq!(lines[0], "rm -f sweep-f");
    assert!(lines[1].starts_with("run --rm --name sweep-f "), "{}", lines[1]);
    assert_eq!(lines[2], "rm -f sweep-f");
}
