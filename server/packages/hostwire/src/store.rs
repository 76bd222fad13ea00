//! JSON-file persistence for chat transcripts and UI settings.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hostwire_error::HostwireError;
use serde_json::{json, Map, Value};

use crate::session::persist_line;

const MAX_CHAT_ID_LEN: usize = 128;

pub fn is_valid_chat_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CHAT_ID_LEN
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

/// One `<id>.json` file per transcript.
#[derive(Debug, Clone)]
pub struct ChatStore {
    dir: PathBuf,
}

impl ChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, HostwireError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| HostwireError::from_io(err, dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, HostwireError> {
        if !is_valid_chat_id(id) {
            return Err(HostwireError::invalid(format!(
                "chat id `{id}` must be 1-{MAX_CHAT_ID_LEN} characters of [A-Za-z0-9_-]"
            )));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    pub fn list(&self) -> Result<Vec<String>, HostwireError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|err| HostwireError::from_io(err, self.dir.display()))?;
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    return None;
                }
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .filter(|stem| is_valid_chat_id(stem))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, id: &str) -> Result<Value, HostwireError> {
        let path = self.path_for(id)?;
        let raw = fs::read_to_string(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => HostwireError::not_found(format!("chat {id} not found")),
            _ => HostwireError::from_io(err, path.display()),
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            HostwireError::unexpected(format!("chat {id} is not valid JSON: {err}"))
        })
    }

    pub fn save(&self, id: &str, chat: &Value) -> Result<(), HostwireError> {
        let path = self.path_for(id)?;
        let body = serde_json::to_string_pretty(chat)
            .map_err(|err| HostwireError::unexpected(err.to_string()))?;
        persist_line(&path, &body).map_err(|err| HostwireError::from_io(err, path.display()))
    }

    pub fn delete(&self, id: &str) -> Result<(), HostwireError> {
        let path = self.path_for(id)?;
        fs::remove_file(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => HostwireError::not_found(format!("chat {id} not found")),
            _ => HostwireError::from_io(err, path.display()),
        })
    }
}

pub fn default_settings() -> Map<String, Value> {
    match json!({ "language": "en", "default_model": "" }) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// `settings.json`: a flat object merged key by key on update.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl SettingsStore {
    /// Reads the file, or writes the defaults when it is absent or corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, HostwireError> {
        let path = path.into();
        let parsed = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => {
                    tracing::warn!(path = %path.display(), "settings file is corrupt; rewriting defaults");
                    None
                }
            });
        let values = match parsed {
            Some(map) => {
                let mut merged = default_settings();
                merged.extend(map);
                merged
            }
            None => {
                let defaults = default_settings();
                write_settings(&path, &defaults)?;
                defaults
            }
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Map<String, Value> {
        match self.values.lock() {
            Ok(values) => values.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn default_model(&self) -> Option<String> {
        self.get()
            .get("default_model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
    }

    /// Shallow merge; the merged document is persisted before it is returned.
    pub fn merge(&self, update: Map<String, Value>) -> Result<Map<String, Value>, HostwireError> {
        let mut values = match self.values.lock() {
            Ok(values) => values,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = values.clone();
        next.extend(update);
        write_settings(&self.path, &next)?;
        *values = next.clone();
        Ok(next)
    }
}

fn write_settings(path: &Path, values: &Map<String, Value>) -> Result<(), HostwireError> {
    let body = serde_json::to_string_pretty(values)
        .map_err(|err| HostwireError::unexpected(err.to_string()))?;
    persist_line(path, &body).map_err(|err| HostwireError::from_io(err, path.display()))
}
