use async_trait::async_trait;
use hostwire_error::HostwireError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{blocking, format_size, parse_params, schema_for, Tool, ToolContext, ToolOutput, ToolRegistry};
use crate::os::{
    self, is_valid_service_name, CommandOutput, ConnectionInfo, DiskUsage, InterfaceInfo,
    LoadAverage, MemoryInfo, RunError, ServiceAction,
};
use crate::policy::Capability;

const DEFAULT_CONNECTION_LIMIT: usize = 20;
const MAX_CONNECTION_LIMIT: usize = 500;

pub fn register(registry: &mut ToolRegistry) {
    registry.register(GetSystemInfo);
    registry.register(NetworkInfo);
    registry.register(ManageServices);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub hostname: String,
    pub os: String,
    pub kernel: Option<String>,
    pub arch: String,
    pub cpu_count: usize,
    pub cpu_model: Option<String>,
    pub load_average: Option<LoadAverage>,
    pub uptime_secs: Option<u64>,
    pub memory: Option<MemoryInfo>,
    pub disks: Vec<DiskUsage>,
}

impl SystemSnapshot {
    fn take() -> Self {
        Self {
            hostname: os::hostname(),
            os: os::os_description(),
            kernel: os::kernel_release(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: os::cpu_count(),
            cpu_model: os::cpu_model(),
            load_average: os::load_average(),
            uptime_secs: os::uptime_secs(),
            memory: os::memory(),
            disks: os::disks().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "volume table unavailable");
                Vec::new()
            }),
        }
    }

    fn render(&self) -> String {
        let mut text = format!("Host: {}\nOS: {}", self.hostname, self.os);
        if let Some(kernel) = &self.kernel {
            text.push_str(&format!(" (kernel {kernel})"));
        }
        text.push_str(&format!("\nArchitecture: {}\nCPUs: {}", self.arch, self.cpu_count));
        if let Some(model) = &self.cpu_model {
            text.push_str(&format!(" x {model}"));
        }
        if let Some(load) = &self.load_average {
            text.push_str(&format!(
                "\nLoad average: {:.2} {:.2} {:.2}",
                load.one, load.five, load.fifteen
            ));
        }
        if let Some(uptime) = self.uptime_secs {
            text.push_str(&format!(
                "\nUptime: {}d {}h {}m",
                uptime / 86_400,
                (uptime % 86_400) / 3_600,
                (uptime % 3_600) / 60
            ));
        }
        match &self.memory {
            Some(memory) => text.push_str(&format!(
                "\nMemory: {} used of {} ({:.1}%), {} available",
                format_size(memory.used_bytes),
                format_size(memory.total_bytes),
                memory.used_percent,
                format_size(memory.available_bytes)
            )),
            None => text.push_str(&format!("\nMemory: {}", os::UNAVAILABLE)),
        }
        text.push_str("\nVolumes:");
        for disk in &self.disks {
            match (disk.used_bytes, disk.total_bytes, disk.use_percent) {
                (Some(used), Some(total), percent) => text.push_str(&format!(
                    "\n  {}: {} used of {}{}",
                    disk.mount_point,
                    format_size(used),
                    format_size(total),
                    percent.map(|p| format!(" ({p:.0}%)")).unwrap_or_default()
                )),
                _ => text.push_str(&format!("\n  {}", disk.mount_point)),
            }
        }
        text
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NoParams {}

struct GetSystemInfo;

#[async_trait]
impl Tool for GetSystemInfo {
    fn name(&self) -> &'static str {
        "get_system_info"
    }

    fn description(&self) -> &'static str {
        "Report OS, CPU, load, memory and per-volume disk usage."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<NoParams>()
    }

    async fn call(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let snapshot = blocking(|| Ok(SystemSnapshot::take())).await?;
        Ok(ToolOutput::with_structured(snapshot.render(), &snapshot))
    }
}

struct NetworkInfo;

#[derive(Debug, Deserialize, JsonSchema)]
struct NetworkInfoParams {
    /// Maximum number of active connections to report (default 20).
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for NetworkInfo {
    fn name(&self) -> &'static str {
        "network_info"
    }

    fn description(&self) -> &'static str {
        "List network interface addresses and the first active connections."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<NetworkInfoParams>()
    }

    async fn call(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: NetworkInfoParams = parse_params(params)?;
        let limit = params
            .limit
            .unwrap_or(DEFAULT_CONNECTION_LIMIT)
            .min(MAX_CONNECTION_LIMIT);
        blocking(move || {
            let interfaces = os::interfaces()
                .map_err(|err| HostwireError::from_io(err, "interface table"))?;
            let connections = os::connections(limit).unwrap_or_else(|err| {
                tracing::warn!(error = %err, "connection table unavailable");
                Vec::new()
            });
            Ok(ToolOutput::with_structured(
                render_network(&interfaces, &connections),
                json!({ "interfaces": interfaces, "connections": connections }),
            ))
        })
        .await
    }
}

fn render_network(interfaces: &[InterfaceInfo], connections: &[ConnectionInfo]) -> String {
    let mut text = String::from("Interfaces:");
    for interface in interfaces {
        text.push_str(&format!(
            "\n  {} {} {}{}",
            interface.name,
            interface.family.as_deref().unwrap_or("-"),
            interface.address.as_deref().unwrap_or("-"),
            interface
                .state
                .as_deref()
                .map(|state| format!(" [{state}]"))
                .unwrap_or_default()
        ));
    }
    text.push_str(&format!("\nActive connections ({}):", connections.len()));
    for connection in connections {
        text.push_str(&format!(
            "\n  {} {} {} -> {}",
            connection.protocol, connection.state, connection.local, connection.peer
        ));
    }
    text
}

struct ManageServices;

#[derive(Debug, Deserialize, JsonSchema)]
struct ManageServicesParams {
    action: ServiceAction,
    /// Required for every action except `list`.
    #[serde(default)]
    service_name: Option<String>,
}

#[async_trait]
impl Tool for ManageServices {
    fn name(&self) -> &'static str {
        "manage_services"
    }

    fn description(&self) -> &'static str {
        "List services or start, stop, restart or query one through the platform service manager (action: list|start|stop|restart|status)."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<ManageServicesParams>()
    }

    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError> {
        let params: ManageServicesParams = parse_params(params)?;
        let action = params.action;
        if action.is_mutating() {
            ctx.policy.require(Capability::ServiceControl)?;
        }
        let service = match action {
            ServiceAction::List => None,
            _ => {
                let name = params
                    .service_name
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| HostwireError::missing("service_name"))?;
                if !is_valid_service_name(&name) {
                    return Err(HostwireError::invalid(format!(
                        "`{name}` is not a valid service name"
                    )));
                }
                Some(name)
            }
        };

        if action == ServiceAction::Restart {
            let stop = run_service(ctx, ServiceAction::Stop, service.as_deref()).await?;
            tokio::time::sleep(ctx.limits.service_settle).await;
            let start = run_service(ctx, ServiceAction::Start, service.as_deref()).await?;
            let name = service.unwrap_or_default();
            tracing::info!(service = %name, "service restarted");
            return Ok(ToolOutput::with_structured(
                format!("Restarted {name}"),
                json!({ "service": name, "stop": stop, "start": start }),
            ));
        }

        let output = run_service(ctx, action, service.as_deref()).await?;
        let text = match (&service, output.stdout.trim().is_empty()) {
            (Some(name), true) => format!("{} {name}: done", action.as_str()),
            (_, _) => output.stdout.trim_end().to_string(),
        };
        Ok(ToolOutput::with_structured(
            text,
            json!({ "service": service, "action": action.as_str(), "output": output }),
        ))
    }
}

async fn run_service(
    ctx: &ToolContext,
    action: ServiceAction,
    service: Option<&str>,
) -> Result<CommandOutput, HostwireError> {
    let spec = ctx
        .services
        .command(action, service)
        .ok_or_else(|| HostwireError::unexpected(format!("no command for {}", action.as_str())))?;
    let program = spec.program.clone();
    let output = os::run_with_timeout(spec, ctx.limits.command_timeout)
        .await
        .map_err(|err| match err {
            RunError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                HostwireError::not_found(format!("service manager `{program}` is not available"))
            }
            RunError::TimedOut { after, .. } => HostwireError::Timeout {
                message: format!("{program} {}", action.as_str()),
                seconds: after.as_secs(),
            },
            RunError::Spawn { source, .. } | RunError::Wait { source, .. } => {
                HostwireError::from_io(source, &program)
            }
        })?;
    if action.is_mutating() && output.exit_code != Some(0) {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim()
        } else {
            output.stderr.trim()
        };
        return Err(HostwireError::unexpected(format!(
            "{program} {} {} failed: {detail}",
            action.as_str(),
            service.unwrap_or_default()
        )));
    }
    Ok(output)
}
