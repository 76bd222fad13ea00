//! Trust boundary for every filesystem path and command the tools touch.
//!
//! Deny by default: a path must land under one of the configured roots after
//! normalisation and symlink resolution, and a command must name an
//! allow-listed program unless the server runs in trusted mode.

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use hostwire_error::HostwireError;

use crate::os::CommandSpec;

#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub workspace: PathBuf,
    pub allowed_roots: Vec<PathBuf>,
    pub allowed_commands: Vec<String>,
    pub trusted: bool,
    pub allow_process_control: bool,
    pub allow_service_control: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ProcessControl,
    ServiceControl,
}

impl Capability {
    fn flag(&self) -> &'static str {
        match self {
            Self::ProcessControl => "--allow-process-control",
            Self::ServiceControl => "--allow-service-control",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::ProcessControl => "process control",
            Self::ServiceControl => "service control",
        }
    }
}

/// How an accepted command string will be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPlan {
    Argv { program: String, args: Vec<String> },
    Shell { command: String },
}

impl CommandPlan {
    pub fn into_spec(self, cwd: Option<PathBuf>) -> CommandSpec {
        match self {
            CommandPlan::Argv { program, args } => CommandSpec::new(program).args(args).cwd(cwd),
            CommandPlan::Shell { command } => {
                let (shell, flag) = if cfg!(windows) {
                    ("cmd", "/C")
                } else {
                    ("sh", "-c")
                };
                CommandSpec::new(shell).args([flag.to_string(), command]).cwd(cwd)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyGuard {
    workspace: PathBuf,
    roots: Vec<PathBuf>,
    commands: HashSet<String>,
    trusted: bool,
    allow_process_control: bool,
    allow_service_control: bool,
}

impl PolicyGuard {
    pub fn new(config: PolicyConfig) -> Self {
        let workspace = canonicalize_existing_prefix(&normalize_path(&config.workspace));
        let mut roots: Vec<PathBuf> = Vec::new();
        for root in &config.allowed_roots {
            let root = if root.is_absolute() {
                root.clone()
            } else {
                workspace.join(root)
            };
            let root = canonicalize_existing_prefix(&normalize_path(&root));
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        if roots.is_empty() {
            tracing::warn!("no allowed roots configured; every filesystem path will be denied");
        }
        Self {
            workspace,
            roots,
            commands: config
                .allowed_commands
                .into_iter()
                .map(|command| command.trim().to_string())
                .filter(|command| !command.is_empty())
                .collect(),
            trusted: config.trusted,
            allow_process_control: config.allow_process_control,
            allow_service_control: config.allow_service_control,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn trusted(&self) -> bool {
        self.trusted
    }

    /// Turns a caller-supplied path into a concrete target inside the allowed roots.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, HostwireError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HostwireError::InvalidPath {
                message: "path is empty".to_string(),
            });
        }
        if trimmed.contains('\0') {
            return Err(HostwireError::InvalidPath {
                message: "path contains a NUL byte".to_string(),
            });
        }
        let candidate = PathBuf::from(trimmed);
        let joined = if candidate.is_absolute() {
            candidate
        } else {
            self.workspace.join(candidate)
        };
        self.check_path(&joined)
    }

    /// Same checks as [`resolve_path`](Self::resolve_path) for a path the
    /// server derived itself (walk entries, backup names).
    pub fn check_path(&self, path: &Path) -> Result<PathBuf, HostwireError> {
        let normalized = normalize_path(path);

        // Resolve the parent so a symlinked final component stays addressable
        // (delete removes the link, not its target).
        let resolved = match (normalized.parent(), normalized.file_name()) {
            (Some(parent), Some(name)) => canonicalize_existing_prefix(parent).join(name),
            _ => canonicalize_existing_prefix(&normalized),
        };
        self.ensure_inside(&resolved)?;

        if let Ok(meta) = fs::symlink_metadata(&resolved) {
            if meta.file_type().is_symlink() {
                let target = match fs::canonicalize(&resolved) {
                    Ok(target) => target,
                    Err(_) => dangling_link_target(&resolved)?,
                };
                self.ensure_inside(&target)?;
            }
        }
        Ok(resolved)
    }

    pub fn is_allowed_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| root == path) || path == self.workspace
    }

    fn ensure_inside(&self, path: &Path) -> Result<(), HostwireError> {
        if self.roots.iter().any(|root| path.starts_with(root)) {
            Ok(())
        } else {
            Err(HostwireError::denied(format!(
                "{} is outside the allowed roots",
                path.display()
            )))
        }
    }

    /// Parses a command string. Outside trusted mode the result is an argument
    /// vector whose program is on the allow-list.
    pub fn resolve_command(&self, raw: &str) -> Result<CommandPlan, HostwireError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(HostwireError::missing("command"));
        }
        if self.trusted {
            return Ok(CommandPlan::Shell {
                command: raw.to_string(),
            });
        }
        let argv = shlex::split(raw)
            .ok_or_else(|| HostwireError::invalid("command has unbalanced quotes or escapes"))?;
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| HostwireError::invalid("command is empty after parsing"))?;
        self.check_program(&program)?;
        Ok(CommandPlan::Argv {
            program,
            args: argv.collect(),
        })
    }

    /// Programs match the allow-list exactly: a bare entry admits the bare
    /// name (PATH lookup), a path entry admits that exact path.
    pub fn check_program(&self, program: &str) -> Result<(), HostwireError> {
        if self.trusted || self.commands.contains(program) {
            return Ok(());
        }
        Err(HostwireError::denied(format!(
            "program `{program}` is not on the command allow-list"
        )))
    }

    pub fn require(&self, capability: Capability) -> Result<(), HostwireError> {
        let allowed = self.trusted
            || match capability {
                Capability::ProcessControl => self.allow_process_control,
                Capability::ServiceControl => self.allow_service_control,
            };
        if allowed {
            Ok(())
        } else {
            Err(HostwireError::denied(format!(
                "{} is disabled; start the server with {}",
                capability.label(),
                capability.flag()
            )))
        }
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(value) => normalized.push(value),
        }
    }
    normalized
}

/// Canonicalises the longest prefix that exists and re-appends the rest.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(&existing) {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|name| name.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn dangling_link_target(link: &Path) -> Result<PathBuf, HostwireError> {
    let target = fs::read_link(link).map_err(|err| HostwireError::from_io(err, link.display()))?;
    let absolute = if target.is_absolute() {
        target
    } else {
        link.parent().unwrap_or(Path::new("/")).join(target)
    };
    Ok(canonicalize_existing_prefix(&normalize_path(&absolute)))
}
