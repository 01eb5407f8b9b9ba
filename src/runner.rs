//! Runs the deployment script with a hard wall-clock limit

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum size for captured output per stream before truncation (1MB)
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Time the process group gets between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Background processes may keep the output pipes open after the script exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const SPAWN_ATTEMPTS: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    /// Killed by a signal not sent by the runner
    Signalled(Option<i32>),
}

/// Result of a deployment that ran to completion
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub id: Uuid,
    pub success: bool,
    pub exit: ExitState,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl DeploymentOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ExitState::Exited(code) => Some(code),
            ExitState::Signalled(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Deployment script not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to make deployment script executable: {0}")]
    Permissions(#[source] io::Error),

    #[error("Failed to start deployment script: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed waiting for deployment script: {0}")]
    Wait(#[source] io::Error),

    #[error("Deployment script timed out after {}s", .limit.as_secs_f32())]
    Timeout {
        limit: Duration,
        stdout: String,
        stderr: String,
    },
}

impl ExecutionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }
}

/// Adds owner/group/other execute bits to the script. Leaves the file alone
/// when they are already set.
#[cfg(unix)]
pub fn ensure_executable(script: &Path) -> Result<(), ExecutionError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(script)
        .map_err(ExecutionError::Permissions)?
        .permissions();
    let mode = permissions.mode();
    if mode & 0o111 != 0o111 {
        permissions.set_mode(mode | 0o111);
        std::fs::set_permissions(script, permissions).map_err(ExecutionError::Permissions)?;
        debug!(
            "Changed mode of {} from {:o} to {:o}",
            script.display(),
            mode & 0o7777,
            (mode | 0o111) & 0o7777
        );
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn ensure_executable(_script: &Path) -> Result<(), ExecutionError> {
    Ok(())
}

/// Runs `script` with no arguments and waits at most `max_duration`.
///
/// A script that exits on its own yields an outcome, successful only for
/// exit status zero. A missing script, a spawn failure and a timeout are
/// errors. On timeout the script's whole process group is terminated before
/// this returns.
pub async fn run_deployment(
    script: &Path,
    max_duration: Duration,
) -> Result<DeploymentOutcome, ExecutionError> {
    if !script.exists() {
        error!("Deployment script not found: {}", script.display());
        return Err(ExecutionError::NotFound(script.to_path_buf()));
    }

    ensure_executable(script)?;

    info!("Executing deployment script: {}", script.display());
    let id = Uuid::now_v7();
    let started_at = Utc::now();
    let start = Instant::now();

    let mut cmd = Command::new(script);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a timeout can take the script's children down too
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = spawn(&mut cmd).await.map_err(|e| {
        error!("Deployment script failed to start: {}", e);
        ExecutionError::Spawn(e)
    })?;

    let stdout_reader = OutputReader::spawn(child.stdout.take());
    let stderr_reader = OutputReader::spawn(child.stderr.take());

    let status = match timeout(max_duration, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            error!("Error waiting for deployment script: {}", e);
            terminate(&mut child).await;
            return Err(ExecutionError::Wait(e));
        }
        Err(_) => {
            error!(
                "Deployment script timed out after {:?}, terminating",
                max_duration
            );
            terminate(&mut child).await;
            let (stdout, stderr) = collect_output(stdout_reader, stderr_reader).await;
            return Err(ExecutionError::Timeout {
                limit: max_duration,
                stdout,
                stderr,
            });
        }
    };

    let (stdout, stderr) = collect_output(stdout_reader, stderr_reader).await;

    Ok(DeploymentOutcome {
        id,
        success: status.success(),
        exit: exit_state(status),
        stdout,
        stderr,
        started_at,
        duration: start.elapsed(),
    })
}

/// Retries briefly while the script is still open for writing elsewhere
/// (ETXTBSY), e.g. right after it was replaced on disk.
async fn spawn(cmd: &mut Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Err(e) if is_text_file_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                debug!("Deployment script busy, retrying (attempt {})", attempt);
                attempt += 1;
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
            }
            result => return result,
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_file_busy(_e: &io::Error) -> bool {
    false
}

fn exit_state(status: ExitStatus) -> ExitState {
    match status.code() {
        Some(code) => ExitState::Exited(code),
        None => ExitState::Signalled(signal_of(status)),
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> Option<i32> {
    None
}

/// SIGTERM the process group, give it `KILL_GRACE`, then SIGKILL whatever is
/// left and reap the direct child.
#[cfg(unix)]
async fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("SIGTERM to process group {} failed: {}", pid, e);
        }
        if timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!("Deployment script ignored SIGTERM, sending SIGKILL");
        }
        // Children can outlive the group leader
        let _ = killpg(group, Signal::SIGKILL);
    }
    child.kill().await.ok();
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    child.kill().await.ok();
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn render(&self) -> String {
        let mut output = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            output.push_str("\n... (output truncated)");
        }
        output
    }
}

/// One captured pipe. The buffer outlives the reader task, so whatever was
/// read before an abort is still reported.
struct OutputReader {
    task: JoinHandle<()>,
    captured: Arc<Mutex<Captured>>,
}

impl OutputReader {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let task = tokio::spawn(read_capped(reader, captured.clone()));
        Self { task, captured }
    }

    async fn output(&self) -> String {
        let captured = self.captured.lock().await;
        captured.render()
    }
}

/// Drains a pipe to EOF, keeping at most `MAX_OUTPUT_SIZE` bytes
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, captured: Arc<Mutex<Captured>>) {
    let Some(mut reader) = reader else {
        return;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = captured.lock().await;
                let room = MAX_OUTPUT_SIZE - buf.bytes.len();
                if n > room {
                    buf.truncated = true;
                }
                buf.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

/// Waits for both pipes to close, sharing one `OUTPUT_DRAIN_TIMEOUT`.
/// Background processes still holding a pipe are left running and the
/// output read so far is returned.
async fn collect_output(mut stdout: OutputReader, mut stderr: OutputReader) -> (String, String) {
    let drained = timeout(OUTPUT_DRAIN_TIMEOUT, async {
        tokio::join!(&mut stdout.task, &mut stderr.task)
    })
    .await;

    match drained {
        Ok((out, err)) => {
            for e in [out.err(), err.err()].into_iter().flatten() {
                debug!("Output reader failed: {}", e);
            }
        }
        Err(_) => {
            warn!("Output still open after deployment script exited, keeping what was read");
            stdout.task.abort();
            stderr.task.abort();
        }
    }

    (stdout.output().await, stderr.output().await)
}
