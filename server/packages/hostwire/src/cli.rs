use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

// Include the generated version constant
mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}
use crate::config::{self, ServerConfig, DEFAULT_BACKEND_URL, DEFAULT_OLLAMA_BIN};
use crate::policy::PolicyConfig;
use crate::router::{build_router_with_state, AppState};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5000;

#[derive(Parser, Debug)]
#[command(name = "hostwire", bin_name = "hostwire")]
#[command(about = "Host capability dispatcher and model relay", version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct HostwireCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hostwire HTTP server.
    Server(ServerArgs),
    /// List or invoke tools on a running server.
    Tools(ToolsArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "HOSTWIRE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "HOSTWIRE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, env = "HOSTWIRE_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    #[arg(long, env = "HOSTWIRE_OLLAMA_BIN", default_value = DEFAULT_OLLAMA_BIN)]
    ollama_bin: PathBuf,

    /// Where the selected model, settings and chats are kept.
    #[arg(long, env = "HOSTWIRE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Base for relative tool paths. Defaults to the current directory.
    #[arg(long, env = "HOSTWIRE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Directory tools may touch. Repeatable; defaults to the workspace.
    #[arg(long = "allow-root", env = "HOSTWIRE_ALLOW_ROOTS", value_delimiter = ',')]
    allow_roots: Vec<PathBuf>,

    /// Program execute_command and run_application may start. Repeatable.
    #[arg(long = "allow-command", env = "HOSTWIRE_ALLOW_COMMANDS", value_delimiter = ',')]
    allow_commands: Vec<String>,

    /// Run commands through the platform shell without the allow-list.
    #[arg(long, env = "HOSTWIRE_TRUSTED")]
    trusted: bool,

    #[arg(long, env = "HOSTWIRE_ALLOW_PROCESS_CONTROL")]
    allow_process_control: bool,

    #[arg(long, env = "HOSTWIRE_ALLOW_SERVICE_CONTROL")]
    allow_service_control: bool,

    #[arg(long, env = "HOSTWIRE_DEFAULT_MODEL")]
    default_model: Option<String>,

    #[arg(long, env = "HOSTWIRE_COMMAND_TIMEOUT_SECS", default_value_t = 30)]
    command_timeout_secs: u64,

    #[arg(long, env = "HOSTWIRE_MAX_COMMAND_TIMEOUT_SECS", default_value_t = 300)]
    max_command_timeout_secs: u64,

    #[arg(long, env = "HOSTWIRE_BACKEND_TIMEOUT_SECS", default_value_t = 120)]
    backend_timeout_secs: u64,

    #[arg(long, env = "HOSTWIRE_MAX_CONCURRENT_TOOLS", default_value_t = 16)]
    max_concurrent_tools: usize,

    #[arg(long, env = "HOSTWIRE_MAX_READ_BYTES", default_value_t = 10 * 1024 * 1024)]
    max_read_bytes: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

impl ServerArgs {
    fn to_config(&self) -> ServerConfig {
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(config::default_workspace);
        let allowed_roots = if self.allow_roots.is_empty() {
            vec![workspace.clone()]
        } else {
            self.allow_roots.clone()
        };
        ServerConfig {
            data_dir: self
                .data_dir
                .clone()
                .unwrap_or_else(config::default_data_dir),
            backend_url: self.backend_url.clone(),
            ollama_bin: self.ollama_bin.clone(),
            default_model: self.default_model.clone(),
            policy: PolicyConfig {
                workspace,
                allowed_roots,
                allowed_commands: self.allow_commands.clone(),
                trusted: self.trusted,
                allow_process_control: self.allow_process_control,
                allow_service_control: self.allow_service_control,
            },
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            max_command_timeout: Duration::from_secs(self.max_command_timeout_secs),
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
            max_concurrent_tools: self.max_concurrent_tools,
            max_read_bytes: self.max_read_bytes,
        }
    }
}

#[derive(Args, Debug)]
pub struct ToolsArgs {
    #[command(subcommand)]
    command: ToolsCommand,
}

#[derive(Subcommand, Debug)]
pub enum ToolsCommand {
    /// List registered tools with their parameter schemas.
    List(ClientArgs),
    /// Invoke one tool.
    Call(ToolCallArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e', env = "HOSTWIRE_ENDPOINT")]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct ToolCallArgs {
    name: String,

    /// Parameters as a JSON object.
    #[arg(long, short = 'P')]
    params: Option<String>,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub fn run_hostwire() -> Result<(), CliError> {
    let cli = HostwireCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))?;
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Tools(subcommand) => run_tools(&subcommand.command),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = server.to_config();
    let state = AppState::new(&config).map_err(|err| CliError::Server(err.to_string()))?;
    let (mut router, _state) = build_router_with_state(Arc::new(state));

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            data_dir = %config.data_dir.display(),
            workspace = %config.policy.workspace.display(),
            "server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_tools(command: &ToolsCommand) -> Result<(), CliError> {
    match command {
        ToolsCommand::List(args) => {
            let ctx = ClientContext::new(args)?;
            let response = ctx.get("/tools")?;
            print_json_response::<Value>(response)
        }
        ToolsCommand::Call(args) => {
            let ctx = ClientContext::new(&args.client)?;
            let parameters = parse_params_arg(args.params.as_deref())?;
            let body = json!({ "tool_name": args.name, "parameters": parameters });
            let response = ctx.post("/tools", &body)?;
            print_json_response::<Value>(response)
        }
    }
}

fn parse_params_arg(raw: Option<&str>) -> Result<Map<String, Value>, CliError> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(CliError::InvalidParams(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    if server.cors_allow_origin.iter().any(|origin| origin == "*") {
        if server.cors_allow_credentials {
            return Err(CliError::InvalidCorsOrigin(
                "* cannot be combined with --cors-allow-credentials".to_string(),
            ));
        }
        cors = cors.allow_origin(Any);
    } else {
        let mut origins = Vec::new();
        for origin in &server.cors_allow_origin {
            let value = origin
                .parse()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
            origins.push(value);
        }
        if origins.is_empty() {
            // No origins configured: cross-origin requests are refused.
            cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
        } else {
            cors = cors.allow_origin(origins);
        }
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    client: HttpClient,
}

impl ClientContext {
    fn new(args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let client = HttpClient::builder().build()?;
        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path).send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
