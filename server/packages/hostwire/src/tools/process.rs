use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hostwire_error::HostwireError;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use super::{
    blocking, parse_params, require_text, schema_for, Tool, ToolContext, ToolOutput, ToolRegistry,
};
use crate::os::{self, ProcessInfo, RunError};
use crate::policy::Capability;

const DEFAULT_PROCESS_LIMIT: usize = 15;
const MAX_PROCESS_LIMIT: usize = 200;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(ExecuteCommand);
    registry.register(RunApplication);
    registry.register(ManageProcesses);
}

struct ExecuteCommand;

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecuteCommandParams {
    command: String,
    /// Wall-clock limit in seconds.
    #[serde(default)]
    timeout: Option<u64>,
    /// Working directory; defaults to the workspace.
    #[serde(default)]
    cwd: Option<String>,
}

#[async_trait]
impl Tool for ExecuteCommand {
    fn name(&self) -> &'static str {
        "execute_command"
    }

    fn description(&self) -> &'static str {
        "Run a command and return its stdout, stderr and exit code; it is killed when the timeout expires."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ExecuteCommandParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: ExecuteCommandParams = parse_params(params)?;
        let command = require_text(params.command, "command")?;
        let plan = ctx.policy.resolve_command(&command)?;

        let timeout = match params.timeout {
            Some(0) => return Err(HostwireError::invalid("timeout must be at least 1 second")),
            Some(secs) => Duration::from_secs(secs).min(ctx.limits.max_command_timeout),
            None => ctx.limits.command_timeout,
        };
        let cwd = match params.cwd.filter(|cwd| !cwd.trim().is_empty()) {
            Some(raw) => {
                let policy = ctx.policy.clone();
                blocking(move || {
                    let dir = policy.resolve_path(&raw)?;
                    if !dir.is_dir() {
                        return Err(HostwireError::InvalidPath {
                            message: format!("{} is not a directory", dir.display()),
                        });
                    }
                    Ok(dir)
                })
                .await?
            }
            None => ctx.policy.workspace().to_path_buf(),
        };

        let spec = plan.into_spec(Some(cwd));
        tracing::debug!(command = %spec.display(), timeout_secs = timeout.as_secs(), "executing command");
        match os::run_with_timeout(spec, timeout).await {
            Ok(output) => {
                let exit = output
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "terminated by signal".to_string());
                let text = format!(
                    "Exit code: {exit}\n--- stdout ---\n{}\n--- stderr ---\n{}",
                    output.stdout.trim_end(),
                    output.stderr.trim_end()
                );
                Ok(ToolOutput::with_structured(text, &output))
            }
            Err(RunError::TimedOut { after, .. }) => Err(HostwireError::Timeout {
                message: command,
                seconds: after.as_secs(),
            }),
            Err(RunError::Spawn { program, source }) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(HostwireError::not_found(format!("command not found: {program}")))
            }
            Err(RunError::Spawn { program, source }) | Err(RunError::Wait { program, source }) => {
                Err(HostwireError::from_io(source, program))
            }
        }
    }
}

struct RunApplication;

#[derive(Debug, Deserialize, JsonSchema)]
struct RunApplicationParams {
    /// Absolute path, or a program name looked up on PATH.
    application: String,
    #[serde(default)]
    args: Vec<String>,
}

#[async_trait]
impl Tool for RunApplication {
    fn name(&self) -> &'static str {
        "run_application"
    }

    fn description(&self) -> &'static str {
        "Start an application in the background and return its process id."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<RunApplicationParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: RunApplicationParams = parse_params(params)?;
        let application = require_text(params.application, "application")?;
        let application = application.trim().to_string();
        ctx.policy.check_program(&application)?;

        let policy = ctx.policy.clone();
        let args = params.args;
        blocking(move || {
            let program = locate_application(&application, policy.workspace())?;
            let pid = os::spawn_detached(&program, &args, Some(policy.workspace()))
                .map_err(|err| HostwireError::from_io(err, program.display()))?;
            tracing::info!(program = %program.display(), pid, "application started");
            Ok(ToolOutput::with_structured(
                format!("Started {} (pid {pid})", program.display()),
                json!({ "program": program, "pid": pid }),
            ))
        })
        .await
    }
}

fn locate_application(application: &str, workspace: &Path) -> Result<PathBuf, HostwireError> {
    let candidate = Path::new(application);
    let has_separator = application.contains('/') || application.contains('\\');
    if candidate.is_absolute() || has_separator {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            workspace.join(candidate)
        };
        if path.is_file() {
            return Ok(path);
        }
        return Err(HostwireError::not_found(format!(
            "application not found: {}",
            path.display()
        )));
    }
    which::which(application)
        .map_err(|_| HostwireError::not_found(format!("application not found on PATH: {application}")))
}

struct ManageProcesses;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum ProcessAction {
    List,
    Kill,
    Info,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ManageProcessesParams {
    action: ProcessAction,
    #[serde(default, deserialize_with = "lenient_pid")]
    #[schemars(with = "Option<u32>")]
    process_id: Option<u32>,
    /// Case-insensitive process name; may match several processes.
    #[serde(default)]
    process_name: Option<String>,
    /// Rows returned by `list` (default 15).
    #[serde(default)]
    limit: Option<usize>,
}

/// Accepts `1234` or `"1234"`; models frequently quote ids.
fn lenient_pid<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(pid)) => Ok(Some(pid)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("process_id `{text}` is not a number"))),
    }
}

#[async_trait]
impl Tool for ManageProcesses {
    fn name(&self) -> &'static str {
        "manage_processes"
    }

    fn description(&self) -> &'static str {
        "List the busiest processes, show one process in detail, or terminate processes by id or name (action: list|kill|info)."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ManageProcessesParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: ManageProcessesParams = parse_params(params)?;
        match params.action {
            ProcessAction::List => {
                let limit = params
                    .limit
                    .unwrap_or(DEFAULT_PROCESS_LIMIT)
                    .clamp(1, MAX_PROCESS_LIMIT);
                blocking(move || list_processes(limit)).await
            }
            ProcessAction::Kill => {
                ctx.policy.require(Capability::ProcessControl)?;
                let name = params.process_name.filter(|name| !name.trim().is_empty());
                match (params.process_id, name) {
                    (Some(pid), _) => blocking(move || kill_pid(pid)).await,
                    (None, Some(name)) => blocking(move || kill_by_name(&name)).await,
                    (None, None) => Err(HostwireError::missing("process_id")),
                }
            }
            ProcessAction::Info => {
                let name = params.process_name.filter(|name| !name.trim().is_empty());
                let target = params.process_id;
                if target.is_none() && name.is_none() {
                    return Err(HostwireError::missing("process_id"));
                }
                blocking(move || process_info(target, name.as_deref())).await
            }
        }
    }
}

fn snapshot() -> Result<Vec<ProcessInfo>, HostwireError> {
    os::processes().map_err(|err| HostwireError::from_io(err, "process table"))
}

fn list_processes(limit: usize) -> Result<ToolOutput, HostwireError> {
    let mut processes = snapshot()?;
    processes.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
    processes.truncate(limit);
    let mut text = format!(
        "Top {} processes by CPU:\n{:>8} {:>6} {:>6} {:<12} NAME\n",
        processes.len(),
        "PID",
        "CPU%",
        "MEM%",
        "USER"
    );
    for process in &processes {
        text.push_str(&format!(
            "{:>8} {:>6.1} {:>6.1} {:<12} {}\n",
            process.pid, process.cpu_percent, process.memory_percent, process.user, process.name
        ));
    }
    Ok(ToolOutput::with_structured(text, json!({ "processes": processes })))
}

fn validate_target(pid: u32) -> Result<(), HostwireError> {
    if pid == 0 || i32::try_from(pid).is_err() {
        return Err(HostwireError::invalid(format!("{pid} is not a valid process id")));
    }
    if pid == std::process::id() {
        return Err(HostwireError::invalid("refusing to terminate the server itself"));
    }
    Ok(())
}

fn kill_pid(pid: u32) -> Result<ToolOutput, HostwireError> {
    validate_target(pid)?;
    if !os::process_exists(pid) {
        return Err(HostwireError::not_found(format!("no process with id {pid}")));
    }
    os::terminate(pid).map_err(|err| HostwireError::from_io(err, format!("process {pid}")))?;
    tracing::info!(pid, "process terminated");
    Ok(ToolOutput::with_structured(
        format!("Sent termination signal to process {pid}"),
        json!({ "killed": [pid] }),
    ))
}

fn name_matches(process: &ProcessInfo, wanted: &str) -> bool {
    let wanted = wanted.trim();
    let strip = |name: &str| {
        let lower = name.to_ascii_lowercase();
        lower.strip_suffix(".exe").map(str::to_string).unwrap_or(lower)
    };
    let base = Path::new(&process.name)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| process.name.clone());
    strip(&base) == strip(wanted)
}

fn kill_by_name(name: &str) -> Result<ToolOutput, HostwireError> {
    let own_pid = std::process::id();
    let targets: Vec<ProcessInfo> = snapshot()?
        .into_iter()
        .filter(|process| process.pid != own_pid && name_matches(process, name))
        .collect();
    if targets.is_empty() {
        return Err(HostwireError::not_found(format!("no process named {name}")));
    }

    let mut killed = Vec::new();
    let mut failed = Vec::new();
    let mut first_error = None;
    for target in &targets {
        match os::terminate(target.pid) {
            Ok(()) => killed.push(target.pid),
            Err(err) => {
                failed.push(json!({ "pid": target.pid, "error": err.to_string() }));
                first_error
                    .get_or_insert_with(|| HostwireError::from_io(err, format!("process {}", target.pid)));
            }
        }
    }
    if killed.is_empty() {
        if let Some(err) = first_error {
            return Err(err);
        }
    }
    tracing::info!(name = %name, killed = killed.len(), failed = failed.len(), "processes terminated by name");
    let mut text = format!(
        "Sent termination signal to {} process{} named {name}: {:?}",
        killed.len(),
        if killed.len() == 1 { "" } else { "es" },
        killed
    );
    if !failed.is_empty() {
        text.push_str(&format!("\n{} could not be terminated", failed.len()));
    }
    Ok(ToolOutput::with_structured(
        text,
        json!({ "killed": killed, "failed": failed }),
    ))
}

fn process_info(pid: Option<u32>, name: Option<&str>) -> Result<ToolOutput, HostwireError> {
    let pid = match (pid, name) {
        (Some(pid), _) => pid,
        (None, Some(name)) => snapshot()?
            .into_iter()
            .find(|process| name_matches(process, name))
            .map(|process| process.pid)
            .ok_or_else(|| HostwireError::not_found(format!("no process named {name}")))?,
        (None, None) => return Err(HostwireError::missing("process_id")),
    };
    let detail = os::process_detail(pid)
        .map_err(|err| HostwireError::from_io(err, "process table"))?
        .ok_or_else(|| HostwireError::not_found(format!("no process with id {pid}")))?;
    let text = format!(
        "Process {} ({})\n  parent: {}\n  user: {}\n  cpu: {:.1}%\n  memory: {:.1}% ({} KB)\n  threads: {}\n  open files: {}\n  exe: {}\n  cwd: {}\n  cmdline: {}",
        detail.info.pid,
        detail.info.name,
        detail.info.ppid,
        detail.info.user,
        detail.info.cpu_percent,
        detail.info.memory_percent,
        detail.info.rss_kb,
        detail.threads,
        detail.open_files,
        detail.exe,
        detail.cwd,
        detail.cmdline
    );
    Ok(ToolOutput::with_structured(text, &detail))
}
