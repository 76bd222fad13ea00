use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

const MAX_CAPTURE_BYTES: usize = 1024 * 1024;
const DRAIN_AFTER_KILL: Duration = Duration::from_millis(500);

/// A program plus argument vector; never interpreted by a shell unless the
/// program itself is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },
}

/// Runs a command to completion or until `timeout` elapses. On timeout the
/// child's whole process group is killed and the child reaped before return.
pub async fn run_with_timeout(spec: CommandSpec, timeout: Duration) -> Result<CommandOutput, RunError> {
    let started = Instant::now();
    let mut std_command = std::process::Command::new(&spec.program);
    std_command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        std_command.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_command.process_group(0);
    }
    let mut command = tokio::process::Command::from(std_command);
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| RunError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let stdout = Capture::shared();
    let stderr = Capture::shared();
    let mut readers = [
        child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, stdout.clone()))),
        child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, stderr.clone()))),
    ];

    let group = child.id();

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            // Background children may still hold the pipes open.
            let grace = timeout
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(100));
            if tokio::time::timeout(grace, drain(&mut readers)).await.is_err() {
                kill_group(group);
                tracing::warn!(
                    program = %spec.program,
                    "leftover background processes held output open; killed"
                );
                if tokio::time::timeout(DRAIN_AFTER_KILL, drain(&mut readers))
                    .await
                    .is_err()
                {
                    for reader in readers.iter().flatten() {
                        reader.abort();
                    }
                }
            }
            Ok(CommandOutput {
                exit_code: status.code(),
                stdout: Capture::text(&stdout),
                stderr: Capture::text(&stderr),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(source)) => Err(RunError::Wait {
            program: spec.program,
            source,
        }),
        Err(_) => {
            kill_tree(&mut child).await;
            for reader in readers.iter().flatten() {
                reader.abort();
            }
            tracing::warn!(
                program = %spec.program,
                timeout_secs = timeout.as_secs(),
                "command timed out; process group killed"
            );
            Err(RunError::TimedOut {
                program: spec.program,
                after: timeout,
            })
        }
    }
}

async fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    #[cfg(windows)]
    {
        if let Some(pid) = child.id() {
            let _ = tokio::process::Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }
    // kill() also waits, so the child is reaped here.
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "child already exited");
        let _ = child.wait().await;
    }
}

fn kill_group(group: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = group.and_then(|pid| i32::try_from(pid).ok()) {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = group;
}

/// Output read so far from one pipe. Readers append as they go, so a reader
/// cut short still leaves what it got.
#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

impl Capture {
    fn shared() -> SharedCapture {
        Arc::new(Mutex::new(Capture::default()))
    }

    fn text(shared: &SharedCapture) -> String {
        let capture = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let mut text = String::from_utf8_lossy(&capture.bytes).to_string();
        if capture.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

async fn read_capped<R>(mut pipe: R, capture: SharedCapture)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
                let room = MAX_CAPTURE_BYTES.saturating_sub(capture.bytes.len());
                if read > room {
                    capture.truncated = true;
                }
                capture.bytes.extend_from_slice(&buf[..read.min(room)]);
            }
        }
    }
}

/// Waits for the pipe readers; a finished reader is cleared so a cancelled
/// drain can be resumed.
async fn drain(readers: &mut [Option<JoinHandle<()>>; 2]) {
    for slot in readers.iter_mut() {
        if let Some(reader) = slot.as_mut() {
            let _ = reader.await;
            *slot = None;
        }
    }
}

/// Starts a process that outlives the request; returns its pid. A reaper
/// thread waits on it so it never lingers as a zombie.
pub fn spawn_detached(program: &Path, args: &[String], cwd: Option<&Path>) -> io::Result<u32> {
    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command.spawn()?;
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(pid)
}
