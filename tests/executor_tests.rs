#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_agent::config::PlatformDefaults;
use fleet_agent::task::{ScriptErrorCode, ScriptTaskRequest, TaskStatus};
use fleet_agent::worker::ScriptTask;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Platform defaults whose scratch files land in `dir`
fn platform_in(dir: &Path) -> PlatformDefaults {
    PlatformDefaults {
        temp_dir: Some(dir.to_path_buf()),
        ..PlatformDefaults::current()
    }
}

fn request(content: &str, timeout_seconds: u64) -> ScriptTaskRequest {
    ScriptTaskRequest {
        content: content.to_string(),
        timeout_seconds,
        ..Default::default()
    }
}

fn scratch_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn test_echo_succeeds() {
    let scratch = TempDir::new().unwrap();
    let task = ScriptTask::new("echo", request("echo hi", 5), platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.task_id, "echo");
    assert_eq!(result.code, ScriptErrorCode::Success);
    assert!(result.stdout.contains("hi\n"));
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.is_empty());
    assert!(result.start_time.is_some());
    assert!(result.end_time >= result.start_time);
    assert_eq!(task.status().await, TaskStatus::Completed);
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_not_failed() {
    let scratch = TempDir::new().unwrap();
    let task = ScriptTask::new(
        "exit1",
        request("echo oops >&2\nexit 1", 5),
        platform_in(scratch.path()),
    );

    let result = task.run().await;

    assert_eq!(result.code, ScriptErrorCode::Success);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.error.is_empty());
    assert_eq!(result.stderr, "oops\n");
    assert_eq!(task.status().await, TaskStatus::Completed);
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let scratch = TempDir::new().unwrap();
    let marker = scratch.path().join("alive");
    // Child writes the marker only if it outlives the timeout
    let content = format!("sleep 5\ntouch {}", marker.display());
    let task = ScriptTask::new("slow", request(&content, 1), platform_in(scratch.path()));

    let started = Instant::now();
    let result = task.run().await;
    let elapsed = started.elapsed();

    assert_eq!(result.code, ScriptErrorCode::Timeout);
    assert!(result.exit_code.is_none());
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "timeout not enforced: {:?}", elapsed);
    assert_eq!(task.status().await, TaskStatus::Failed);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!marker.exists(), "script kept running after timeout");
}

#[tokio::test]
async fn test_temp_files_removed_on_every_path() {
    let scratch = TempDir::new().unwrap();

    let ok = ScriptTask::new("ok", request("echo done", 5), platform_in(scratch.path()));
    ok.run().await;
    assert!(scratch_is_empty(scratch.path()));

    let failing = ScriptTask::new("fail", request("exit 3", 5), platform_in(scratch.path()));
    failing.run().await;
    assert!(scratch_is_empty(scratch.path()));

    let slow = ScriptTask::new("slow", request("sleep 5", 1), platform_in(scratch.path()));
    slow.run().await;
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn test_env_overrides_win() {
    let scratch = TempDir::new().unwrap();
    let mut req = request("echo \"$FLEET_TEST_VALUE:$HOME\"", 5);
    req.env = HashMap::from([
        ("FLEET_TEST_VALUE".to_string(), "override".to_string()),
        ("HOME".to_string(), "/fleet-home".to_string()),
    ]);
    let task = ScriptTask::new("env", req, platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.stdout, "override:/fleet-home\n");
}

#[tokio::test]
async fn test_inherits_process_environment() {
    let scratch = TempDir::new().unwrap();
    let task = ScriptTask::new("path", request("echo \"$PATH\"", 5), platform_in(scratch.path()));

    let result = task.run().await;

    assert!(!result.stdout.trim().is_empty());
}

#[tokio::test]
async fn test_stdin_is_fed() {
    let scratch = TempDir::new().unwrap();
    let mut req = request("cat", 5);
    req.stdin = Some("from stdin\n".to_string());
    let task = ScriptTask::new("stdin", req, platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.stdout, "from stdin\n");
}

#[tokio::test]
async fn test_no_stdin_reads_eof() {
    let scratch = TempDir::new().unwrap();
    let task = ScriptTask::new("nostdin", request("cat; echo end", 5), platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.code, ScriptErrorCode::Success);
    assert_eq!(result.stdout, "end\n");
}

#[tokio::test]
async fn test_params_are_positional() {
    let scratch = TempDir::new().unwrap();
    let mut req = request("echo \"$2-$1\"", 5);
    req.params = vec!["first".to_string(), "second".to_string()];
    let task = ScriptTask::new("params", req, platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.stdout, "second-first\n");
}

#[tokio::test]
async fn test_work_dir_is_used() {
    let scratch = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let mut req = request("pwd", 5);
    req.work_dir = Some(work.path().display().to_string());
    let task = ScriptTask::new("pwd", req, platform_in(scratch.path()));

    let result = task.run().await;

    let reported = std::fs::canonicalize(result.stdout.trim()).unwrap();
    assert_eq!(reported, std::fs::canonicalize(work.path()).unwrap());
}

#[tokio::test]
async fn test_large_output_is_fully_captured() {
    let scratch = TempDir::new().unwrap();
    let task = ScriptTask::new("seq", request("seq 1 1000", 5), platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.stdout.lines().count(), 1000);
    assert!(result.stdout.ends_with("1000\n"));
}

#[tokio::test]
async fn test_missing_interpreter_fails_to_start() {
    let scratch = TempDir::new().unwrap();
    let mut req = request("echo hi", 5);
    req.interpreter = Some("/nonexistent/interpreter".to_string());
    let task = ScriptTask::new("nostart", req, platform_in(scratch.path()));

    let result = task.run().await;

    assert_eq!(result.code, ScriptErrorCode::StartFailed);
    assert!(result.exit_code.is_none());
    assert!(!result.error.is_empty());
    assert_eq!(task.status().await, TaskStatus::Failed);
    assert!(scratch_is_empty(scratch.path()));
}

#[tokio::test]
async fn test_stop_terminates_running_script() {
    let scratch = TempDir::new().unwrap();
    let task = Arc::new(ScriptTask::new(
        "stoppable",
        request("sleep 30", 60),
        platform_in(scratch.path()),
    ));

    let runner = {
        let task = task.clone();
        tokio::spawn(async move { task.run().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(task.status().await, TaskStatus::Running);

    task.stop();
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("stop did not end the run")
        .unwrap();

    assert_eq!(result.code, ScriptErrorCode::Stopped);
    assert!(result.exit_code.is_none());
    assert_eq!(task.status().await, TaskStatus::Failed);

    // Stopping again after exit is a no-op
    task.stop();
    assert_eq!(task.status().await, TaskStatus::Failed);
}

#[tokio::test]
async fn test_parent_cancellation_stops_script() {
    let scratch = TempDir::new().unwrap();
    let parent = CancellationToken::new();
    let task = ScriptTask::new("child", request("sleep 30", 0), platform_in(scratch.path()))
        .with_cancellation(&parent);

    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let result = task.run().await;
    assert_eq!(result.code, ScriptErrorCode::Stopped);
}

#[tokio::test]
async fn test_status_never_regresses() {
    let scratch = TempDir::new().unwrap();
    let task = Arc::new(ScriptTask::new(
        "watched",
        request("sleep 0.2; echo done", 5),
        platform_in(scratch.path()),
    ));

    let watcher = {
        let task = task.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..100 {
                seen.push(task.status().await);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            seen
        })
    };
    task.run().await;
    let seen = watcher.await.unwrap();

    let mut terminal_seen = false;
    for status in seen {
        if terminal_seen {
            assert!(status.is_terminal(), "status regressed to {}", status);
        }
        terminal_seen |= status.is_terminal();
    }
    assert_eq!(task.status().await, TaskStatus::Completed);
}
