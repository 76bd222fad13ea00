//! The currently selected model, shared by the relay and the switch endpoint.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use hostwire_error::HostwireError;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct ModelSession {
    path: PathBuf,
    current: RwLock<String>,
    writer: Mutex<()>,
}

impl ModelSession {
    /// Loads the persisted name; a missing or blank file falls back to
    /// `fallback`, then to the empty string.
    pub fn load(path: impl Into<PathBuf>, fallback: Option<&str>) -> Self {
        let path = path.into();
        let persisted = std::fs::read_to_string(&path)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|name| !name.is_empty());
        let current = persisted
            .or_else(|| {
                fallback
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        tracing::info!(model = %current, path = %path.display(), "model session loaded");
        Self {
            path,
            current: RwLock::new(current),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> String {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Persists `name` and then publishes it. Concurrent switches are
    /// serialised; the in-memory value changes only after the write landed.
    pub async fn switch_to(&self, name: &str) -> Result<String, HostwireError> {
        let name = name.trim().to_string();
        let _writer = self.writer.lock().await;
        let path = self.path.clone();
        let contents = name.clone();
        tokio::task::spawn_blocking(move || persist_line(&path, &contents))
            .await
            .map_err(|err| HostwireError::unexpected(format!("persist task failed: {err}")))?
            .map_err(|err| HostwireError::from_io(err, self.path.display()))?;

        match self.current.write() {
            Ok(mut guard) => *guard = name.clone(),
            Err(poisoned) => *poisoned.into_inner() = name.clone(),
        }
        tracing::info!(model = %name, "model switched");
        Ok(name)
    }
}

/// Writes `contents` plus a newline through a temp file and rename.
pub(crate) fn persist_line(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
