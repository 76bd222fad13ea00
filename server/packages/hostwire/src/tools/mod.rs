//! Capability registry: named host operations behind one `Tool` interface.

pub mod filesystem;
pub mod process;
pub mod system;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hostwire_error::{ErrorKind, HostwireError};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use utoipa::ToSchema;

use crate::os::ServiceManager;
use crate::policy::PolicyGuard;

#[derive(Debug, Clone)]
pub struct ToolLimits {
    pub command_timeout: Duration,
    pub max_command_timeout: Duration,
    pub max_read_bytes: u64,
    pub service_settle: Duration,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            max_command_timeout: Duration::from_secs(300),
            max_read_bytes: 10 * 1024 * 1024,
            service_settle: Duration::from_secs(2),
        }
    }
}

/// Everything a handler may reach besides its parameters.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub policy: Arc<PolicyGuard>,
    pub limits: ToolLimits,
    pub services: ServiceManager,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub text: String,
    pub structured: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
        }
    }

    pub fn with_structured(text: impl Into<String>, structured: impl Serialize) -> Self {
        Self {
            text: text.into(),
            structured: serde_json::to_value(structured).ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure(err: &HostwireError) -> Self {
        Self::Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<Result<ToolOutput, HostwireError>> for ToolResult {
    fn from(value: Result<ToolOutput, HostwireError>) -> Self {
        match value {
            Ok(output) => Self::Success {
                text: output.text,
                structured: output.structured,
            },
            Err(err) => Self::failure(&err),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters_schema(&self) -> Value;
    async fn call(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, HostwireError>;
}

pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tools: BTreeMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// The full built-in tool set.
    pub fn builtin(max_concurrent: usize) -> Self {
        let mut registry = Self::new(max_concurrent);
        filesystem::register(&mut registry);
        process::register(&mut registry);
        system::register(&mut registry);
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name();
        if self.tools.insert(name, Arc::new(tool)).is_some() {
            tracing::warn!(tool = name, "tool registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn describe(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// Routes a call to its handler on a dedicated task. Never fails: every
    /// error, including a handler panic, comes back as `ToolResult::Failure`.
    pub async fn dispatch(&self, call: ToolCall, ctx: Arc<ToolContext>) -> ToolResult {
        let started = Instant::now();
        let name = call.name.trim().to_string();
        let Some(tool) = self.get(&name) else {
            tracing::warn!(tool = %name, "unknown tool requested");
            return ToolResult::failure(&HostwireError::UnknownTool { name });
        };
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ToolResult::failure(&HostwireError::unexpected(
                    "tool dispatcher is shutting down",
                ))
            }
        };

        let params = Value::Object(call.parameters);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            tool.call(params, &ctx).await
        });
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(HostwireError::unexpected(join_error_message(err))),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => tracing::info!(tool = %name, outcome = "success", elapsed_ms, "tool dispatched"),
            Err(err) => tracing::warn!(
                tool = %name,
                outcome = %err.kind(),
                elapsed_ms,
                error = %err,
                "tool dispatched"
            ),
        }
        ToolResult::from(outcome)
    }
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return format!("tool task cancelled: {err}");
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("tool panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("tool panicked: {message}")
    } else {
        "tool panicked".to_string()
    }
}

/// Deserialises tool parameters. Null values count as absent, absent required
/// fields become `MissingParameter`, any other mismatch `InvalidParameter`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, HostwireError> {
    let params = match params {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
        ),
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params).map_err(|err| {
        let message = err.to_string();
        match missing_field_name(&message) {
            Some(name) => HostwireError::missing(name),
            None => HostwireError::invalid(message),
        }
    })
}

fn missing_field_name(message: &str) -> Option<&str> {
    let rest = message.strip_prefix("missing field `")?;
    rest.split('`').next()
}

/// Required string parameters must also be non-blank.
pub fn require_text(value: String, name: &str) -> Result<String, HostwireError> {
    if value.trim().is_empty() {
        Err(HostwireError::missing(name))
    } else {
        Ok(value)
    }
}

pub fn schema_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// Runs synchronous filesystem/OS work off the async workers.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, HostwireError>
where
    F: FnOnce() -> Result<T, HostwireError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| HostwireError::unexpected(format!("blocking task failed: {err}")))?
}

/// `B`/`KB`/`MB`/`GB` bands with one decimal above bytes.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{bytes} B")
    } else if value < MB {
        format!("{:.1} KB", value / KB)
    } else if value < GB {
        format!("{:.1} MB", value / MB)
    } else {
        format!("{:.1} GB", value / GB)
    }
}
