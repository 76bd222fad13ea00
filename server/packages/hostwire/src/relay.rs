//! Streaming chat relay between callers and the model backend.
//!
//! Requests are assembled from history plus the new user turn (and, when tools
//! are enabled, a generated system prompt), sent to `{backend}/api/chat`, and
//! the backend's newline-delimited reply is forwarded line by line.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hostwire_error::HostwireError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;

use crate::session::ModelSession;
use crate::tools::ToolRegistry;

const RELAY_CHANNEL_CAPACITY: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TITLE_HISTORY_LIMIT: usize = 10;
const TITLE_MAX_CHARS: usize = 60;
const TITLE_INSTRUCTION: &str = "Write a short title, at most six words, for the conversation above. \
Reply with the title only, without quotes or punctuation at the end.";
pub const FALLBACK_TITLE: &str = "New chat";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat` on the backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RelayRequest {
    pub model: Option<String>,
    pub history: Vec<ChatMessage>,
    pub new_user_text: Option<String>,
    pub tools_enabled: bool,
}

/// One item of a relayed stream.
#[derive(Debug)]
pub enum RelayEvent {
    Line(String),
    Failure(HostwireError),
}

#[derive(Debug, Clone)]
pub struct ModelBackend {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl ModelBackend {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, HostwireError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| HostwireError::unexpected(format!("http client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Single complete response (`stream: false`), passed through as JSON.
    pub async fn chat(&self, request: &BackendChatRequest) -> Result<Value, HostwireError> {
        let response = self
            .client
            .post(self.chat_url())
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(|err| backend_error(&err))?;
        let response = ensure_success(response).await?;
        response.json::<Value>().await.map_err(|err| HostwireError::BackendUnavailable {
            message: format!("backend returned an unreadable body: {err}"),
        })
    }

    /// Opens the incremental variant; the caller drains the body.
    pub async fn chat_stream(&self, request: &BackendChatRequest) -> Result<reqwest::Response, HostwireError> {
        let response = self
            .client
            .post(self.chat_url())
            .json(request)
            .send()
            .await
            .map_err(|err| backend_error(&err))?;
        ensure_success(response).await
    }
}

fn backend_error(err: &reqwest::Error) -> HostwireError {
    HostwireError::BackendUnavailable {
        message: err.to_string(),
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, HostwireError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HostwireError::BackendUnavailable {
        message: format!("backend returned {status}: {}", body.trim()),
    })
}

/// Fixed preamble listing every registered tool.
pub fn system_prompt(registry: &ToolRegistry) -> String {
    let mut prompt = String::from(
        "You are an assistant running on a host that exposes tools through an HTTP API.\n\
         To use a tool, reply with a single JSON object on its own line:\n\
         {\"tool_name\": \"<name>\", \"parameters\": {...}}\n\
         Wait for the tool result before continuing. Available tools:\n",
    );
    for tool in registry.describe() {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    prompt
}

/// Appends the new user turn and, when tools are enabled and no leading system
/// message exists, prepends `system_prompt`.
pub fn build_messages(
    history: Vec<ChatMessage>,
    new_user_text: Option<String>,
    tools_enabled: bool,
    system_prompt: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    let has_system = history
        .first()
        .map(|message| message.role == ChatRole::System)
        .unwrap_or(false);
    if tools_enabled && !has_system {
        messages.push(ChatMessage::system(system_prompt));
    }
    messages.extend(history);
    if let Some(text) = new_user_text.filter(|text| !text.trim().is_empty()) {
        messages.push(ChatMessage::user(text));
    }
    messages
}

#[derive(Debug)]
pub struct Relay {
    backend: ModelBackend,
    session: Arc<ModelSession>,
    system_prompt: String,
}

impl Relay {
    pub fn new(backend: ModelBackend, session: Arc<ModelSession>, registry: &ToolRegistry) -> Self {
        Self {
            backend,
            session,
            system_prompt: system_prompt(registry),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn prepare(&self, request: RelayRequest, stream: bool) -> BackendChatRequest {
        let model = request
            .model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.session.current());
        BackendChatRequest {
            model,
            messages: build_messages(
                request.history,
                request.new_user_text,
                request.tools_enabled,
                &self.system_prompt,
            ),
            stream,
        }
    }

    pub async fn generate(&self, request: RelayRequest) -> Result<Value, HostwireError> {
        let request = self.prepare(request, false);
        tracing::info!(
            model = %request.model,
            messages = request.messages.len(),
            "relaying chat request"
        );
        self.backend.chat(&request).await
    }

    /// Asks the backend for a short title summarising `history`. Only the
    /// most recent turns are sent and the system prompt is never added.
    pub async fn title(&self, history: Vec<ChatMessage>, model: Option<String>) -> Result<String, HostwireError> {
        let skip = history.len().saturating_sub(TITLE_HISTORY_LIMIT);
        let recent: Vec<ChatMessage> = history
            .into_iter()
            .skip(skip)
            .filter(|message| message.role != ChatRole::System)
            .collect();
        let request = self.prepare(
            RelayRequest {
                model,
                history: recent,
                new_user_text: Some(TITLE_INSTRUCTION.to_string()),
                tools_enabled: false,
            },
            false,
        );
        let reply = self.backend.chat(&request).await?;
        let content = reply
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| HostwireError::BackendUnavailable {
                message: "backend reply has no message content".to_string(),
            })?;
        let title = clean_title(content);
        tracing::debug!(model = %request.model, title = %title, "generated chat title");
        Ok(title)
    }

    /// Lazy line stream fed by a producer task. Dropping the stream stops the
    /// producer, which drops the upstream response and its connection.
    pub fn stream(&self, request: RelayRequest) -> ReceiverStream<RelayEvent> {
        let request = self.prepare(request, true);
        let backend = self.backend.clone();
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let model = request.model.clone();
            let messages = request.messages.len();
            let (forwarded, reason) = pump(&backend, &request, &tx).await;
            tracing::info!(
                model = %model,
                messages,
                forwarded,
                reason,
                "relay stream finished"
            );
        });
        ReceiverStream::new(rx)
    }
}

/// First non-blank line of a model reply, unquoted and capped.
fn clean_title(raw: &str) -> String {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let line = line.strip_prefix("Title:").unwrap_or(line);
    let title: String = line
        .trim()
        .trim_end_matches(['.', '!'])
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '`'))
        .trim_end_matches(['.', '!'])
        .trim()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect();
    let title = title.trim_end().to_string();
    if title.is_empty() {
        FALLBACK_TITLE.to_string()
    } else {
        title
    }
}

async fn pump(
    backend: &ModelBackend,
    request: &BackendChatRequest,
    tx: &mpsc::Sender<RelayEvent>,
) -> (usize, &'static str) {
    let response = match backend.chat_stream(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(error = %err, "model backend unavailable");
            let _ = tx.send(RelayEvent::Failure(err)).await;
            return (0, "backend_unavailable");
        }
    };
    let mut upstream = Box::pin(response.bytes_stream());
    let mut buffer: Vec<u8> = Vec::new();
    let mut forwarded = 0usize;
    loop {
        tokio::select! {
            _ = tx.closed() => return (forwarded, "client_disconnected"),
            chunk = upstream.next() => match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|byte| *byte == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        if !send_line(tx, &line, &mut forwarded).await {
                            return (forwarded, "client_disconnected");
                        }
                    }
                }
                Some(Err(err)) => {
                    let _ = tx
                        .send(RelayEvent::Failure(HostwireError::BackendUnavailable {
                            message: format!("stream interrupted: {err}"),
                        }))
                        .await;
                    return (forwarded, "upstream_error");
                }
                None => {
                    let tail = std::mem::take(&mut buffer);
                    if !send_line(tx, &tail, &mut forwarded).await {
                        return (forwarded, "client_disconnected");
                    }
                    return (forwarded, "completed");
                }
            }
        }
    }
}

/// Sends one trimmed, non-empty line; false once the receiver is gone.
async fn send_line(tx: &mpsc::Sender<RelayEvent>, raw: &[u8], forwarded: &mut usize) -> bool {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return true;
    }
    if tx.send(RelayEvent::Line(line.to_string())).await.is_err() {
        return false;
    }
    *forwarded += 1;
    true
}
