use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::PolicyConfig;
use crate::tools::ToolLimits;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_BIN: &str = "ollama";
pub const LAST_MODEL_FILE: &str = "last_model.txt";
pub const SETTINGS_FILE: &str = "settings.json";
pub const CHATS_DIR: &str = "chats";

/// Runtime configuration, assembled from CLI flags or built directly in tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub backend_url: String,
    pub ollama_bin: PathBuf,
    pub default_model: Option<String>,
    pub policy: PolicyConfig,
    pub command_timeout: Duration,
    pub max_command_timeout: Duration,
    pub backend_timeout: Duration,
    pub max_concurrent_tools: usize,
    pub max_read_bytes: u64,
}

impl ServerConfig {
    /// Defaults rooted at `workspace`, with state kept in `data_dir`. Only the
    /// workspace is an allowed root and no commands are allow-listed.
    pub fn for_workspace(workspace: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            data_dir: data_dir.into(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            ollama_bin: PathBuf::from(DEFAULT_OLLAMA_BIN),
            default_model: None,
            policy: PolicyConfig {
                allowed_roots: vec![workspace.clone()],
                workspace,
                ..PolicyConfig::default()
            },
            command_timeout: Duration::from_secs(30),
            max_command_timeout: Duration::from_secs(300),
            backend_timeout: Duration::from_secs(120),
            max_concurrent_tools: 16,
            max_read_bytes: 10 * 1024 * 1024,
        }
    }

    pub fn last_model_path(&self) -> PathBuf {
        self.data_dir.join(LAST_MODEL_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.data_dir.join(CHATS_DIR)
    }

    pub fn tool_limits(&self) -> ToolLimits {
        ToolLimits {
            command_timeout: self.command_timeout.min(self.max_command_timeout),
            max_command_timeout: self.max_command_timeout,
            max_read_bytes: self.max_read_bytes,
            ..ToolLimits::default()
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("hostwire"))
        .unwrap_or_else(|| PathBuf::from(".").join(".hostwire"))
}

pub fn default_workspace() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf())
}
