//! Cancellable execution of one external process.
//!
//! The step races the child against a cancellation token. On cancellation the
//! child's process group gets SIGTERM, then SIGKILL once the grace period is
//! spent. Output is streamed into shared buffers while the child runs, so
//! whatever was produced before an interruption is still returned.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Output captured from a step, complete or partial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl StepOutput {
    /// Last `max_lines` lines of stderr, falling back to stdout. Used in error messages.
    pub fn tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let lines: Vec<&str> = source.trim_end().lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T = StepOutput> {
    Completed(T),
    /// The token fired before the step finished. Carries partial output.
    Cancelled(StepOutput),
    Failed { error: String, output: StepOutput },
}

impl<T> StepOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Runs one external command under a cancellation signal.
#[derive(Debug, Clone)]
pub struct InterruptibleStep {
    grace_period: Duration,
}

impl Default for InterruptibleStep {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

type SharedBuf = Arc<Mutex<String>>;

fn spawn_reader<R>(stream: Option<R>, buf: SharedBuf) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(mut b) = buf.lock() {
                b.push_str(&line);
                b.push('\n');
            }
        }
    }))
}

/// Feed `input` to the child without holding up the caller. A child that
/// exits without reading stdin is not an error here.
fn spawn_writer<W>(input: Option<String>, pipe: Option<W>) -> Option<JoinHandle<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (input, mut pipe) = (input?, pipe?);
    Some(tokio::spawn(async move {
        if let Err(e) = pipe.write_all(input.as_bytes()).await {
            debug!(error = %e, "Child closed stdin early");
        }
        // Dropping the pipe sends EOF.
    }))
}

fn snapshot(buf: &SharedBuf) -> String {
    buf.lock().map(|b| b.clone()).unwrap_or_default()
}

impl InterruptibleStep {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Spawn `command` and wait for it, unless `cancel` fires first.
    ///
    /// Non-zero exit is `Failed`; a spawn error is `Failed` with empty output.
    pub async fn run(
        &self,
        command: Command,
        stdin: Option<String>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started = Instant::now();
        let mut command = command;
        command
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        if cancel.is_cancelled() {
            return StepOutcome::Cancelled(StepOutput::default());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepOutcome::Failed {
                    error: format!("Failed to spawn process: {}", e),
                    output: StepOutput::default(),
                };
            }
        };

        let stdout_buf: SharedBuf = Arc::default();
        let stderr_buf: SharedBuf = Arc::default();
        let stdout_task = spawn_reader(child.stdout.take(), stdout_buf.clone());
        let stderr_task = spawn_reader(child.stderr.take(), stderr_buf.clone());
        let stdin_task = spawn_writer(stdin, child.stdin.take());

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let (exit_code, wait_error, cancelled) = match waited {
            Some(Ok(status)) => (status.code(), None, false),
            Some(Err(e)) => (None, Some(format!("Failed to wait for process: {}", e)), false),
            None => (self.terminate(&mut child).await, None, true),
        };
        if let Some(task) = stdin_task {
            task.abort();
        }

        // Pipes close once the process group is gone; don't hang on stragglers.
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if tokio::time::timeout(self.grace_period, task).await.is_err() {
                warn!("Output reader did not finish after process exit");
            }
        }

        let output = StepOutput {
            stdout: snapshot(&stdout_buf),
            stderr: snapshot(&stderr_buf),
            exit_code,
            duration: started.elapsed(),
        };

        if cancelled {
            return StepOutcome::Cancelled(output);
        }
        if let Some(error) = wait_error {
            return StepOutcome::Failed { error, output };
        }
        match exit_code {
            Some(0) => StepOutcome::Completed(output),
            Some(code) => StepOutcome::Failed {
                error: format!("Process exited with code {}", code),
                output,
            },
            None => StepOutcome::Failed {
                error: "Process terminated by signal".to_string(),
                output,
            },
        }
    }

    /// SIGTERM the process group, then SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child) -> Option<i32> {
        if let Some(pid) = child.id() {
            send_terminate(pid);
        }
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process exited after graceful termination");
                status.code()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed waiting for terminated process");
                None
            }
            Err(_) => {
                warn!(
                    grace_secs = self.grace_period.as_secs_f64(),
                    "Process ignored termination signal, killing"
                );
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    send_kill(pid);
                }
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill process");
                }
                None
            }
        }
    }
}

/// `kill(2)` wrapper. A negative `target` addresses a process group.
#[cfg(unix)]
fn signal(target: libc::pid_t, sig: libc::c_int) -> bool {
    // SAFETY: kill(2) takes plain integers and touches no memory owned by
    // this process; failure is reported through the return value only.
    unsafe { libc::kill(target, sig) == 0 }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    // The child leads its own process group; signal the whole group so shell
    // wrappers don't leave grandchildren behind.
    let pid = pid as libc::pid_t;
    if !signal(-pid, libc::SIGTERM) {
        signal(pid, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    signal(-(pid as libc::pid_t), libc::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

/// Build a `sh -c` command rooted at `dir`.
pub fn shell_command(script: &str, dir: &std::path::Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(dir);
    cmd
}
