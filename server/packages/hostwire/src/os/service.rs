use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::CommandSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    List,
    Start,
    Stop,
    Restart,
    Status,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
        }
    }

    /// Whether the action changes service state.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Start | Self::Stop | Self::Restart)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Systemd,
    Launchd,
    WindowsSc,
}

/// Builds argument vectors for the platform's service manager.
#[derive(Debug, Clone)]
pub struct ServiceManager {
    backend: Backend,
}

impl ServiceManager {
    pub fn detect() -> Self {
        let backend = if cfg!(windows) {
            Backend::WindowsSc
        } else if cfg!(target_os = "macos") {
            Backend::Launchd
        } else {
            Backend::Systemd
        };
        Self { backend }
    }

    pub fn program(&self) -> &'static str {
        match self.backend {
            Backend::Systemd => "systemctl",
            Backend::Launchd => "launchctl",
            Backend::WindowsSc => "sc",
        }
    }

    /// `Restart` has no single command; callers compose stop + start.
    pub fn command(&self, action: ServiceAction, service: Option<&str>) -> Option<CommandSpec> {
        let program = self.program();
        let name = service.unwrap_or_default();
        let args: Vec<&str> = match (self.backend, action) {
            (_, ServiceAction::Restart) => return None,
            (Backend::Systemd, ServiceAction::List) => vec![
                "list-units",
                "--type=service",
                "--all",
                "--no-pager",
                "--no-legend",
            ],
            (Backend::Systemd, ServiceAction::Start) => vec!["start", name],
            (Backend::Systemd, ServiceAction::Stop) => vec!["stop", name],
            (Backend::Systemd, ServiceAction::Status) => vec!["status", "--no-pager", name],
            (Backend::Launchd, ServiceAction::List) => vec!["list"],
            (Backend::Launchd, ServiceAction::Start) => vec!["start", name],
            (Backend::Launchd, ServiceAction::Stop) => vec!["stop", name],
            (Backend::Launchd, ServiceAction::Status) => vec!["list", name],
            (Backend::WindowsSc, ServiceAction::List) => {
                vec!["query", "type=", "service", "state=", "all"]
            }
            (Backend::WindowsSc, ServiceAction::Start) => vec!["start", name],
            (Backend::WindowsSc, ServiceAction::Stop) => vec!["stop", name],
            (Backend::WindowsSc, ServiceAction::Status) => vec!["query", name],
        };
        Some(CommandSpec::new(program).args(args))
    }
}

/// Service names reach the manager as a plain argument; refuse anything that
/// could read as an option or carries shell/path syntax.
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 256
        && !name.starts_with('-')
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '@' | ':'))
}
