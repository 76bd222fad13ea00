//! Thin wrapper over the local model-management CLI (`ollama list|rm|pull`).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use futures::Stream;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const INSTALL_DONE_LINE: &str = "DONE";

#[derive(Debug, Error)]
pub enum ModelManagerError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} {action} failed: {stderr}")]
    CommandFailed {
        binary: String,
        action: &'static str,
        stderr: String,
    },
    #[error("model name is required")]
    EmptyModelName,
}

#[derive(Debug, Clone)]
pub struct ModelManager {
    binary: PathBuf,
}

impl ModelManager {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs `<binary> list` and returns the model names in output order.
    pub fn list(&self) -> Result<Vec<String>, ModelManagerError> {
        let output = self.run(&["list"])?;
        if !output.status.success() {
            return Err(self.failed("list", &output.stderr));
        }
        Ok(parse_list_output(&String::from_utf8_lossy(&output.stdout)))
    }

    pub fn remove(&self, model: &str) -> Result<(), ModelManagerError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ModelManagerError::EmptyModelName);
        }
        let output = self.run(&["rm", model])?;
        if !output.status.success() {
            return Err(self.failed("rm", &output.stderr));
        }
        tracing::info!(model = %model, "model removed");
        Ok(())
    }

    /// Spawns `<binary> pull <model>` and streams merged stdout/stderr lines.
    /// The stream always ends with a `DONE` line once the process exits.
    /// Dropping the stream kills the pull.
    pub fn install(
        &self,
        model: &str,
    ) -> Result<impl Stream<Item = String> + Send + 'static, ModelManagerError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ModelManagerError::EmptyModelName);
        }

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("pull")
            .arg(model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ModelManagerError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;
        tracing::info!(model = %model, pid = child.id().unwrap_or(0), "model install started");

        let (tx, rx) = mpsc::channel::<String>(64);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let model = model.to_string();

        tokio::spawn(async move {
            let out_task = stdout.map(|pipe| tokio::spawn(forward_lines(pipe, tx.clone())));
            let err_task = stderr.map(|pipe| tokio::spawn(forward_lines(pipe, tx.clone())));
            let forwarded = async {
                if let Some(task) = out_task {
                    let _ = task.await;
                }
                if let Some(task) = err_task {
                    let _ = task.await;
                }
            };
            tokio::select! {
                _ = tx.closed() => {
                    if let Err(err) = child.kill().await {
                        tracing::debug!(model = %model, error = %err, "install already exited");
                    }
                    tracing::info!(model = %model, "model install cancelled; client disconnected");
                    return;
                }
                _ = forwarded => {}
            }
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(model = %model, code = status.code(), "model install finished")
                }
                Err(err) => tracing::warn!(model = %model, error = %err, "model install wait failed"),
            }
            let _ = tx.send(INSTALL_DONE_LINE.to_string()).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, ModelManagerError> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ModelManagerError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })
    }

    fn failed(&self, action: &'static str, stderr: &[u8]) -> ModelManagerError {
        ModelManagerError::CommandFailed {
            binary: self.binary.display().to_string(),
            action,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}

async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Parses the tabular `list` output: optional `NAME ...` header, then one
/// model per row with the name in the first column.
pub fn parse_list_output(stdout: &str) -> Vec<String> {
    let mut lines = stdout.trim().lines().peekable();
    if let Some(first) = lines.peek() {
        if first.to_ascii_uppercase().contains("NAME") {
            lines.next();
        }
    }
    lines
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
