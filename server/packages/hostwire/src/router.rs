use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use futures::StreamExt;
use hostwire_error::{ErrorBody, ErrorKind, HostwireError};
use hostwire_model_management::{ModelManager, ModelManagerError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::config::ServerConfig;
use crate::os::ServiceManager;
use crate::policy::PolicyGuard;
use crate::relay::{ChatMessage, ChatRole, ModelBackend, Relay, RelayEvent, RelayRequest};
use crate::session::ModelSession;
use crate::store::{ChatStore, SettingsStore};
use crate::tools::{blocking, ToolCall, ToolContext, ToolDescriptor, ToolRegistry, ToolResult};

mod types;

pub use types::*;

const SERVER_INFO: &str = "\
This is a hostwire server.

Tools: GET /tools, POST /tools
Chat: POST /generate, POST /generate-stream, POST /generate-title
Models: GET /current-model, POST /switch-model, GET /installed-models
API description: GET /openapi.json";

#[derive(Debug)]
pub struct AppState {
    registry: Arc<ToolRegistry>,
    tool_context: Arc<ToolContext>,
    relay: Arc<Relay>,
    session: Arc<ModelSession>,
    models: ModelManager,
    chats: ChatStore,
    settings: Arc<SettingsStore>,
}

impl AppState {
    /// Loads persisted state from the data dir and wires the registry, relay
    /// and model session together.
    pub fn new(config: &ServerConfig) -> Result<Self, HostwireError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|err| HostwireError::from_io(err, config.data_dir.display()))?;
        let settings = Arc::new(SettingsStore::load(config.settings_path())?);
        let fallback = settings
            .default_model()
            .or_else(|| config.default_model.clone());
        let session = Arc::new(ModelSession::load(
            config.last_model_path(),
            fallback.as_deref(),
        ));

        let registry = Arc::new(ToolRegistry::builtin(config.max_concurrent_tools));
        let tool_context = Arc::new(ToolContext {
            policy: Arc::new(PolicyGuard::new(config.policy.clone())),
            limits: config.tool_limits(),
            services: ServiceManager::detect(),
        });
        let backend = ModelBackend::new(config.backend_url.clone(), config.backend_timeout)?;
        let relay = Arc::new(Relay::new(backend, session.clone(), &registry));

        tracing::info!(
            tools = registry.names().len(),
            roots = tool_context.policy.roots().len(),
            trusted = tool_context.policy.trusted(),
            backend = %config.backend_url,
            "app state ready"
        );
        Ok(Self {
            registry,
            tool_context,
            relay,
            session,
            models: ModelManager::new(&config.ollama_bin),
            chats: ChatStore::new(config.chats_dir())?,
            settings,
        })
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn session(&self) -> Arc<ModelSession> {
        self.session.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/api/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/tools", get(list_tools).post(post_tool))
        .route("/api/tools", post(post_tool))
        .route("/generate", post(post_generate))
        .route("/generate-stream", post(post_generate_stream))
        .route("/generate-title", post(post_generate_title))
        .route("/current-model", get(get_current_model))
        .route("/switch-model", post(post_switch_model))
        .route("/installed-models", get(get_installed_models))
        .route("/delete-model", post(post_delete_model))
        .route("/install-model-stream", post(post_install_model_stream))
        .route("/settings", get(get_settings).post(post_settings))
        .route("/chats", get(list_chats))
        .route("/chats/:chat_id", get(get_chat).put(put_chat))
        .route("/delete-chat/:chat_id", delete(delete_chat))
        .fallback(not_found)
        .with_state(shared.clone());

    let http_logging = match std::env::var("HOSTWIRE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_tools,
        post_tool,
        post_generate,
        post_generate_stream,
        post_generate_title,
        get_current_model,
        post_switch_model,
        get_installed_models,
        post_delete_model,
        post_install_model_stream,
        get_settings,
        post_settings,
        list_chats,
        get_chat,
        put_chat,
        delete_chat
    ),
    components(
        schemas(
            HealthResponse,
            StatusResponse,
            ToolRequest,
            ToolResponse,
            ToolDescriptor,
            GenerateRequest,
            TitleRequest,
            TitleResponse,
            ChatMessage,
            ChatRole,
            ModelRequest,
            SwitchModelResponse,
            CurrentModelResponse,
            SettingsUpdateResponse,
            ErrorBody,
            ErrorKind
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "tools", description = "Host capability dispatch"),
        (name = "chat", description = "Model backend relay"),
        (name = "models", description = "Model selection and management"),
        (name = "store", description = "Chat transcripts and settings")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Hostwire(#[from] HostwireError),
    #[error(transparent)]
    Models(#[from] ModelManagerError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Hostwire(HostwireError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: ErrorBody = match &self {
            ApiError::Hostwire(err) => err.to_error_body(),
            ApiError::Models(err) => model_error(err).to_error_body(),
        };
        error_response(body)
    }
}

fn model_error(err: &ModelManagerError) -> HostwireError {
    match err {
        ModelManagerError::EmptyModelName => HostwireError::missing("model"),
        ModelManagerError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
            HostwireError::BackendUnavailable {
                message: err.to_string(),
            }
        }
        _ => HostwireError::unexpected(err.to_string()),
    }
}

fn error_response(body: ErrorBody) -> Response {
    let status = StatusCode::from_u16(body.type_.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

/// SSE data may not carry carriage returns; progress output often does.
fn sse_data(line: &str) -> Event {
    Event::default().data(line.replace('\r', ""))
}

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Server is up", body = HealthResponse)
    ),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/tools",
    responses(
        (status = 200, description = "Registered tools with their parameter schemas", body = [ToolDescriptor])
    ),
    tag = "tools"
)]
async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolDescriptor>> {
    Json(state.registry.describe())
}

#[utoipa::path(
    post,
    path = "/tools",
    request_body = ToolRequest,
    responses(
        (status = 200, description = "Tool succeeded", body = ToolResponse),
        (status = 400, description = "Missing or invalid parameter, or unknown tool", body = ErrorBody),
        (status = 403, description = "Denied by policy", body = ErrorBody),
        (status = 404, description = "Target not found", body = ErrorBody),
        (status = 408, description = "Operation timed out", body = ErrorBody),
        (status = 500, description = "Unexpected failure", body = ErrorBody)
    ),
    tag = "tools"
)]
async fn post_tool(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ToolRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let call: ToolCall = request.into_call()?;
    let tool = call.name.clone();
    let result = state
        .registry
        .dispatch(call, state.tool_context.clone())
        .await;
    let response = match result {
        ToolResult::Success { text, structured } => Json(ToolResponse {
            result: text,
            tool,
            data: structured,
        })
        .into_response(),
        ToolResult::Failure { kind, message } => error_response(ErrorBody::new(kind, message)),
    };
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/generate",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "Complete backend chat response, passed through"),
        (status = 502, description = "Model backend unavailable", body = ErrorBody)
    ),
    tag = "chat"
)]
async fn post_generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    let reply = state.relay.generate(request.into_relay_request()).await?;
    Ok(Json(reply))
}

#[utoipa::path(
    post,
    path = "/generate-stream",
    request_body = GenerateRequest,
    responses(
        (status = 200, description = "One SSE event per backend output line", content_type = "text/event-stream")
    ),
    tag = "chat"
)]
async fn post_generate_stream(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Json(request) = payload?;
    let relay_request: RelayRequest = request.into_relay_request();
    let stream = state.relay.stream(relay_request).map(|event| {
        let event = match event {
            RelayEvent::Line(line) => sse_data(&line),
            RelayEvent::Failure(err) => {
                let body = serde_json::to_string(&err.to_error_body())
                    .unwrap_or_else(|_| json!({ "error": err.to_string() }).to_string());
                sse_data(&body)
            }
        };
        Ok::<Event, Infallible>(event)
    });
    Ok(Sse::new(stream))
}

#[utoipa::path(
    post,
    path = "/generate-title",
    request_body = TitleRequest,
    responses(
        (status = 200, description = "Short title for the conversation", body = TitleResponse),
        (status = 502, description = "Model backend unavailable", body = ErrorBody)
    ),
    tag = "chat"
)]
async fn post_generate_title(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TitleRequest>, JsonRejection>,
) -> Result<Json<TitleResponse>, ApiError> {
    let Json(request) = payload?;
    let title = state.relay.title(request.history, request.model).await?;
    Ok(Json(TitleResponse { title }))
}

#[utoipa::path(
    get,
    path = "/current-model",
    responses(
        (status = 200, description = "Currently selected model", body = CurrentModelResponse)
    ),
    tag = "models"
)]
async fn get_current_model(State(state): State<Arc<AppState>>) -> Json<CurrentModelResponse> {
    Json(CurrentModelResponse {
        model: state.session.current(),
    })
}

#[utoipa::path(
    post,
    path = "/switch-model",
    request_body = ModelRequest,
    responses(
        (status = 200, description = "Model switched and persisted", body = SwitchModelResponse),
        (status = 500, description = "Could not persist the selection", body = ErrorBody)
    ),
    tag = "models"
)]
async fn post_switch_model(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ModelRequest>, JsonRejection>,
) -> Result<Json<SwitchModelResponse>, ApiError> {
    let Json(request) = payload?;
    let model = state.session.switch_to(&request.model).await?;
    Ok(Json(SwitchModelResponse {
        status: "success".to_string(),
        model,
    }))
}

#[utoipa::path(
    get,
    path = "/installed-models",
    responses(
        (status = 200, description = "Installed model names; empty when the model manager fails", body = [String])
    ),
    tag = "models"
)]
async fn get_installed_models(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let models = state.models.clone();
    let listed = tokio::task::spawn_blocking(move || models.list()).await;
    match listed {
        Ok(Ok(names)) => Json(names),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "model list failed");
            Json(Vec::new())
        }
        Err(err) => {
            tracing::warn!(error = %err, "model list task failed");
            Json(Vec::new())
        }
    }
}

#[utoipa::path(
    post,
    path = "/delete-model",
    request_body = ModelRequest,
    responses(
        (status = 200, description = "Model removed", body = StatusResponse),
        (status = 400, description = "Missing model name", body = ErrorBody),
        (status = 500, description = "Model manager failed", body = ErrorBody)
    ),
    tag = "models"
)]
async fn post_delete_model(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ModelRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = payload?;
    let models = state.models.clone();
    tokio::task::spawn_blocking(move || models.remove(&request.model))
        .await
        .map_err(|err| HostwireError::unexpected(format!("model removal task failed: {err}")))??;
    Ok(Json(StatusResponse::success()))
}

#[utoipa::path(
    post,
    path = "/install-model-stream",
    request_body = ModelRequest,
    responses(
        (status = 200, description = "Installer output lines, ending with DONE", content_type = "text/event-stream"),
        (status = 400, description = "Missing model name", body = ErrorBody)
    ),
    tag = "models"
)]
async fn post_install_model_stream(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ModelRequest>, JsonRejection>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Json(request) = payload?;
    let lines = state.models.install(&request.model)?;
    Ok(Sse::new(
        lines.map(|line| Ok::<Event, Infallible>(sse_data(&line))),
    ))
}

#[utoipa::path(
    get,
    path = "/settings",
    responses(
        (status = 200, description = "Current settings object")
    ),
    tag = "store"
)]
async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Map<String, Value>> {
    Json(state.settings.get())
}

#[utoipa::path(
    post,
    path = "/settings",
    request_body = Object,
    responses(
        (status = 200, description = "Merged settings", body = SettingsUpdateResponse),
        (status = 400, description = "Body is not a JSON object", body = ErrorBody)
    ),
    tag = "store"
)]
async fn post_settings(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<SettingsUpdateResponse>, ApiError> {
    let Json(update) = payload?;
    let default_model = match update.get("default_model") {
        None => None,
        Some(Value::String(model)) => Some(model.clone()),
        Some(_) => {
            return Err(HostwireError::invalid("default_model must be a string").into());
        }
    };
    // Switch first so a failed switch leaves settings.json untouched.
    let previous = state.session.current();
    let switched = match default_model.filter(|model| !model.trim().is_empty()) {
        Some(model) => {
            state.session.switch_to(&model).await?;
            true
        }
        None => false,
    };
    let settings = state.settings.clone();
    let merged = match blocking(move || settings.merge(update)).await {
        Ok(merged) => merged,
        Err(err) => {
            if switched {
                if let Err(restore) = state.session.switch_to(&previous).await {
                    tracing::warn!(error = %restore, "could not restore the previous model");
                }
            }
            return Err(err.into());
        }
    };
    Ok(Json(SettingsUpdateResponse {
        status: "success".to_string(),
        settings: merged,
    }))
}

#[utoipa::path(
    get,
    path = "/chats",
    responses(
        (status = 200, description = "Stored chat ids, sorted", body = [String])
    ),
    tag = "store"
)]
async fn list_chats(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, ApiError> {
    let chats = state.chats.clone();
    Ok(Json(blocking(move || chats.list()).await?))
}

#[utoipa::path(
    get,
    path = "/chats/{chat_id}",
    params(("chat_id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Stored transcript"),
        (status = 404, description = "No such chat", body = ErrorBody)
    ),
    tag = "store"
)]
async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let chats = state.chats.clone();
    Ok(Json(blocking(move || chats.load(&chat_id)).await?))
}

#[utoipa::path(
    put,
    path = "/chats/{chat_id}",
    params(("chat_id" = String, Path, description = "Chat id")),
    request_body = Object,
    responses(
        (status = 200, description = "Transcript stored", body = StatusResponse),
        (status = 400, description = "Invalid chat id or body", body = ErrorBody)
    ),
    tag = "store"
)]
async fn put_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(chat) = payload?;
    let chats = state.chats.clone();
    blocking(move || chats.save(&chat_id, &chat)).await?;
    Ok(Json(StatusResponse::success()))
}

#[utoipa::path(
    delete,
    path = "/delete-chat/{chat_id}",
    params(("chat_id" = String, Path, description = "Chat id")),
    responses(
        (status = 200, description = "Transcript deleted", body = StatusResponse),
        (status = 404, description = "No such chat", body = ErrorBody)
    ),
    tag = "store"
)]
async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let chats = state.chats.clone();
    blocking(move || chats.delete(&chat_id)).await?;
    Ok(Json(StatusResponse::success()))
}
