use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PlatformDefaults;
use crate::task::model::{
    ScriptErrorCode, ScriptResult, ScriptTaskRecord, ScriptTaskRequest, TaskRecord, TaskStatus,
};

/// How long output readers may keep draining after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ScriptState {
    status: TaskStatus,
    updated_at: DateTime<Utc>,
    result: Option<ScriptResult>,
}

/// A script materialized to a temp file and run through the platform interpreter.
///
/// Runs are bounded by the request timeout and by an optional parent
/// cancellation scope. Every temp file created during a run is removed before
/// [`ScriptTask::run`] returns.
#[derive(Debug)]
pub struct ScriptTask {
    id: String,
    request: ScriptTaskRequest,
    platform: PlatformDefaults,
    created_at: DateTime<Utc>,
    state: RwLock<ScriptState>,
    stop: CancellationToken,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Stopped,
}

impl ScriptTask {
    pub fn new(id: impl Into<String>, request: ScriptTaskRequest, platform: PlatformDefaults) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            request,
            platform,
            created_at: now,
            state: RwLock::new(ScriptState {
                status: TaskStatus::Created,
                updated_at: now,
                result: None,
            }),
            stop: CancellationToken::new(),
        }
    }

    /// Tie this run to `parent`: cancelling it stops the script.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.stop = parent.child_token();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &ScriptTaskRequest {
        &self.request
    }

    pub fn content(&self) -> &[u8] {
        self.request.content.as_bytes()
    }

    pub async fn status(&self) -> TaskStatus {
        self.state.read().await.status
    }

    pub async fn result(&self) -> Option<ScriptResult> {
        self.state.read().await.result.clone()
    }

    pub async fn snapshot(&self) -> TaskRecord {
        let state = self.state.read().await;
        TaskRecord::Script(ScriptTaskRecord {
            id: self.id.clone(),
            status: state.status,
            request: self.request.clone(),
            result: state.result.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
        })
    }

    /// Terminate a running script. No effect once the process has exited.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn advance(&self, next: TaskStatus, result: Option<ScriptResult>) -> bool {
        let mut state = self.state.write().await;
        if !state.status.can_advance_to(next) {
            tracing::debug!(task_id = %self.id, from = %state.status, to = %next, "Ignoring status regression");
            return false;
        }
        state.status = next;
        state.updated_at = Utc::now();
        if result.is_some() {
            state.result = result;
        }
        true
    }

    /// Execute the script once and record the outcome.
    pub async fn run(&self) -> ScriptResult {
        if !self.advance(TaskStatus::Running, None).await {
            return ScriptResult::failed(&self.id, ScriptErrorCode::StartFailed, "task has already run");
        }

        let result = self.execute().await;
        let terminal = if result.is_success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        tracing::info!(
            task_id = %self.id,
            code = %result.code,
            exit_code = ?result.exit_code,
            status = %terminal,
            "Script finished"
        );
        self.advance(terminal, Some(result.clone())).await;
        result
    }

    async fn execute(&self) -> ScriptResult {
        let interpreter = self
            .request
            .interpreter
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| self.platform.interpreter.clone());
        let work_dir = self
            .request
            .work_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.platform.work_dir.clone());
        let scratch = self.platform.scratch_dir();

        let mut script = match tempfile::Builder::new()
            .prefix("fleet-script-")
            .suffix(&self.platform.script_suffix)
            .tempfile_in(&scratch)
        {
            Ok(file) => file,
            Err(e) => return self.fail(ScriptErrorCode::CreateTempFileFailed, e),
        };
        if let Err(e) = script.as_file_mut().write_all(self.content()) {
            return self.fail(ScriptErrorCode::WriteTempFileFailed, e);
        }
        if let Err(e) = script.as_file().sync_all() {
            return self.fail(ScriptErrorCode::CloseTempFileFailed, e);
        }
        // Drops the write handle so the interpreter can open the file.
        let script_path = script.into_temp_path();
        if let Err(e) = make_executable(&script_path) {
            return self.fail(ScriptErrorCode::ChmodTempFileFailed, e);
        }

        let (stdout_spill, _stdout_path) = match spill_file(&scratch, ".stdout") {
            Ok(parts) => parts,
            Err(e) => return self.fail(ScriptErrorCode::CreateTempFileFailed, e),
        };
        let (stderr_spill, _stderr_path) = match spill_file(&scratch, ".stderr") {
            Ok(parts) => parts,
            Err(e) => return self.fail(ScriptErrorCode::CreateTempFileFailed, e),
        };

        let command_line = std::iter::once(script_path.display().to_string())
            .chain(self.request.params.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&self.platform.interpreter_flag)
            .arg(&command_line)
            .current_dir(&work_dir)
            .envs(&self.request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.request.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(task_id = %self.id, interpreter = %interpreter, command = %command_line, work_dir = %work_dir.display(), "Starting script");

        let start_time = Utc::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut result = self.fail(ScriptErrorCode::StartFailed, e);
                result.start_time = Some(start_time);
                result.end_time = Some(Utc::now());
                return result;
            }
        };

        if let (Some(input), Some(mut pipe)) = (self.request.stdin.clone(), child.stdin.take()) {
            let task_id = self.id.clone();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    tracing::debug!(task_id = %task_id, error = %e, "Script closed stdin early");
                }
            });
        }

        let mut stdout_reader = child.stdout.take().map(|out| capture(out, stdout_spill));
        let mut stderr_reader = child.stderr.take().map(|err| capture(err, stderr_spill));

        let timeout = (self.request.timeout_seconds > 0)
            .then(|| Duration::from_secs(self.request.timeout_seconds));
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = expire(timeout) => Outcome::TimedOut,
            _ = self.stop.cancelled() => Outcome::Stopped,
        };
        if !matches!(outcome, Outcome::Exited(_)) {
            terminate(&mut child).await;
        }
        let end_time = Utc::now();

        let stdout = drain(&self.id, &mut stdout_reader).await;
        let stderr = drain(&self.id, &mut stderr_reader).await;

        let (code, exit_code, error) = match outcome {
            Outcome::TimedOut => (ScriptErrorCode::Timeout, None, "script execution timeout".to_string()),
            Outcome::Stopped => (ScriptErrorCode::Stopped, None, "script stopped".to_string()),
            Outcome::Exited(Ok(status)) => match status.code() {
                Some(code) => (ScriptErrorCode::Success, Some(code), String::new()),
                None => (ScriptErrorCode::Success, None, format!("process {}", status)),
            },
            Outcome::Exited(Err(e)) => (ScriptErrorCode::Stopped, None, format!("waiting for script: {}", e)),
        };

        ScriptResult {
            task_id: self.id.clone(),
            code,
            stdout,
            stderr,
            error,
            exit_code,
            start_time: Some(start_time),
            end_time: Some(end_time),
        }
    }

    fn fail(&self, code: ScriptErrorCode, err: std::io::Error) -> ScriptResult {
        tracing::warn!(task_id = %self.id, code = %code, error = %err, "Script could not run");
        ScriptResult::failed(&self.id, code, err.to_string())
    }
}

fn spill_file(dir: &Path, suffix: &str) -> std::io::Result<(tokio::fs::File, tempfile::TempPath)> {
    let file = tempfile::Builder::new()
        .prefix("fleet-output-")
        .suffix(suffix)
        .tempfile_in(dir)?;
    let (file, path) = file.into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

async fn expire(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Kill the child together with anything it spawned, then reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group, so -pid reaches grandchildren.
        // SAFETY: kill(2) with a valid signal has no memory effects.
        let rc = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        if rc == -1 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid, error = %errno, "Failed to kill script process group");
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Script process already gone");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "Failed to reap script process");
    }
}

/// Read `source` line by line into memory, mirroring each line to `spill`.
fn capture<R>(source: R, mut spill: tokio::fs::File) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(source);
        let mut captured = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    captured.push_str(&String::from_utf8_lossy(&line));
                    if let Err(e) = spill.write_all(&line).await {
                        tracing::debug!(error = %e, "Failed to mirror output line");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Output stream closed with error");
                    break;
                }
            }
        }
        let _ = spill.flush().await;
        captured
    })
}

async fn drain(task_id: &str, reader: &mut Option<JoinHandle<String>>) -> String {
    let Some(handle) = reader.as_mut() else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut *handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::warn!(task_id, error = %e, "Output reader failed");
            String::new()
        }
        Err(_) => {
            // A detached grandchild still holds the pipe open.
            handle.abort();
            tracing::warn!(task_id, "Output reader did not finish, discarding output");
            String::new()
        }
    }
}
