use crate::error::{LlmError, Result, parse_error_body};
use crate::events::{CanonicalEvent, EventStream, collect_response};
use crate::ids::{IdGenerator, UuidIds};
use crate::eventstream::decode_event_stream;
use crate::ndjson::decode_ndjson;
use crate::normalize::{ChunkStream, RunContext, failed_run, normalize};
use crate::providers::{self, decoder_for};
use crate::sse::decode_sse;
use crate::types::{ChatMessage, ChatRequest, ChatResponse, Role, ToolDefinition};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_TOOL_NAME_LEN: usize = 64;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_responses")]
    OpenAiResponses,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "grok")]
    Grok,
    #[serde(rename = "zai")]
    Zai,
    #[serde(rename = "nebius")]
    Nebius,
    #[serde(rename = "bedrock")]
    Bedrock,
}

/// How a provider frames its streamed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Sse,
    Ndjson,
    /// AWS binary event-stream messages.
    EventStream,
}

impl Provider {
    pub const ALL: [Provider; 10] = [
        Provider::OpenAi,
        Provider::OpenAiResponses,
        Provider::Anthropic,
        Provider::Gemini,
        Provider::Ollama,
        Provider::OpenRouter,
        Provider::Grok,
        Provider::Zai,
        Provider::Nebius,
        Provider::Bedrock,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenAiResponses => "openai_responses",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::OpenRouter => "openrouter",
            Self::Grok => "grok",
            Self::Zai => "zai",
            Self::Nebius => "nebius",
            Self::Bedrock => "bedrock",
        }
    }

    /// Best guess from a model name. Falls back to OpenAI.
    pub fn detect(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        if m.starts_with("claude-") {
            return Self::Anthropic;
        }
        if m.starts_with("gemini-") {
            return Self::Gemini;
        }
        if m.starts_with("grok-") {
            return Self::Grok;
        }
        if m.starts_with("glm-") {
            return Self::Zai;
        }
        // Bedrock model ids are vendor-qualified, optionally with a region prefix.
        if m.starts_with("amazon.") || m.contains("anthropic.claude") {
            return Self::Bedrock;
        }
        Self::OpenAi
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi | Self::OpenAiResponses => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Ollama => "http://localhost:11434",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Grok => "https://api.x.ai/v1",
            Self::Zai => "https://api.z.ai/api/paas/v4",
            Self::Nebius => "https://api.tokenfactory.nebius.com/v1",
            Self::Bedrock => "https://bedrock-runtime.us-east-1.amazonaws.com",
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }

    pub fn framing(self) -> Framing {
        match self {
            Self::Ollama => Framing::Ndjson,
            Self::Bedrock => Framing::EventStream,
            _ => Framing::Sse,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "openai_responses" | "openai-responses" | "responses" => Ok(Self::OpenAiResponses),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "openrouter" => Ok(Self::OpenRouter),
            "grok" | "xai" => Ok(Self::Grok),
            "zai" | "z.ai" | "zhipu" => Ok(Self::Zai),
            "nebius" => Ok(Self::Nebius),
            "bedrock" | "aws" | "amazon_bedrock" | "amazon-bedrock" => Ok(Self::Bedrock),
            other => Err(LlmError::InvalidInput(format!("unknown provider: {other}"))),
        }
    }
}

/// Everything needed to reach one provider. Built by the caller; nothing here
/// reads the environment.
#[derive(Clone)]
pub struct ClientConfig {
    pub provider: Provider,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            api_key: None,
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(self.provider.default_base_url())
    }

    pub(crate) fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                LlmError::InvalidInput(format!("missing API key for provider {}", self.provider))
            })
    }
}

/// Opens a provider stream for one request.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<ChunkStream>;
}

/// Streams over HTTP with `reqwest`.
pub struct HttpSource {
    config: ClientConfig,
    http: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { config, http }
    }
}

#[async_trait]
impl UpstreamSource for HttpSource {
    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.config.provider))]
    async fn open(&self, request: &ChatRequest) -> Result<ChunkStream> {
        let builder = providers::request_builder(&self.http, &self.config, request)?;
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, message) = parse_error_body(&body);
            tracing::warn!(%status, code = ?code, "provider rejected stream request");
            return Err(LlmError::Status {
                status: status.as_u16(),
                code,
                message: message.unwrap_or_else(|| {
                    format!("{} stream status={status}", self.config.provider)
                }),
            });
        }

        let bytes = response.bytes_stream();
        Ok(match self.config.provider.framing() {
            Framing::Sse => Box::pin(decode_sse(bytes)),
            Framing::Ndjson => Box::pin(decode_ndjson(bytes)),
            Framing::EventStream => Box::pin(decode_event_stream(bytes)),
        })
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    source: Arc<dyn UpstreamSource>,
    ids: Arc<dyn IdGenerator>,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: ClientConfig) -> Self {
        let provider = config.provider;
        Self::with_source(provider, Arc::new(HttpSource::new(config)))
    }

    /// A client over any upstream, e.g. a recorded stream.
    pub fn with_source(provider: Provider, source: Arc<dyn UpstreamSource>) -> Self {
        Self {
            provider,
            source,
            ids: Arc::new(UuidIds),
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Streams one run as canonical events.
    ///
    /// Never fails: invalid requests, connection failures and cancellation all
    /// surface as a `RUN_ERROR` after `RUN_STARTED`.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(provider = %self.provider, model = %request.model)
    )]
    pub fn chat_stream(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream {
        let ctx = RunContext {
            model: request.model.clone(),
            provider: self.provider.to_string(),
            ids: Arc::clone(&self.ids),
        };
        if let Err(e) = validate_request(&request) {
            return failed_run(ctx, e.descriptor());
        }

        let (request, reverse) = sanitize_request(request);
        let provider = self.provider;
        let source = Arc::clone(&self.source);
        let opened = async move {
            let upstream = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LlmError::Aborted),
                opened = source.open(&request) => opened,
            };
            match upstream {
                Ok(upstream) => normalize(upstream, decoder_for(provider), ctx, cancel),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open upstream stream");
                    failed_run(ctx, e.descriptor())
                }
            }
        };

        let events = futures_util::stream::once(opened).flatten();
        Box::pin(events.map(move |event| restore_tool_name(event, &reverse)))
    }

    /// Runs to completion and folds the events into one response.
    pub async fn chat(&self, request: ChatRequest) -> ChatResponse {
        collect_response(self.chat_stream(request, CancellationToken::new())).await
    }
}

fn validate_request(request: &ChatRequest) -> Result<()> {
    if request.model.trim().is_empty() {
        return Err(LlmError::InvalidInput("model is required".to_string()));
    }
    if !request.messages.iter().any(|m| m.role != Role::System) {
        return Err(LlmError::InvalidInput(
            "at least one non-system message is required".to_string(),
        ));
    }
    Ok(())
}

/// Checks a tool name against every provider's constraints: 1 to 64 characters
/// of `[a-zA-Z0-9_-]`.
pub fn validate_tool_name_all_providers(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name must be 1-{MAX_TOOL_NAME_LEN} characters: {name:?}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Rewrites tool names so every provider accepts them. Returns the sanitized
/// request and the sanitized -> original mapping.
fn sanitize_request(mut request: ChatRequest) -> (ChatRequest, HashMap<String, String>) {
    let (tools, forward, reverse) = sanitize_tools(&request.tools);
    request.messages = sanitize_messages(&request.messages, &forward);
    request.tools = tools;
    (request, reverse)
}

fn sanitize_tools(
    tools: &[ToolDefinition],
) -> (Vec<ToolDefinition>, HashMap<String, String>, HashMap<String, String>) {
    let mut used: HashSet<String> = HashSet::new();
    let mut forward: HashMap<String, String> = HashMap::new(); // original -> sanitized
    let mut reverse: HashMap<String, String> = HashMap::new(); // sanitized -> original
    let mut out = Vec::with_capacity(tools.len());

    for t in tools {
        let base = sanitize_tool_name(&t.name);
        let mut name = base.clone();
        let mut n = 0;
        while used.contains(&name) {
            n += 1;
            let suffix = format!("_{n}");
            let keep = base.len().min(MAX_TOOL_NAME_LEN - suffix.len());
            name = format!("{}{suffix}", &base[..keep]);
        }
        used.insert(name.clone());
        forward.insert(t.name.clone(), name.clone());
        reverse.insert(name.clone(), t.name.clone());
        out.push(ToolDefinition {
            name,
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        });
    }

    (out, forward, reverse)
}

fn sanitize_messages(
    messages: &[ChatMessage],
    forward: &HashMap<String, String>,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        let mut m2 = m.clone();
        for tc in m2.tool_calls.iter_mut() {
            tc.name = match forward.get(&tc.name) {
                Some(s) => s.clone(),
                // Not in the current tool list; still has to pass validation.
                None => sanitize_tool_name(&tc.name),
            };
        }
        out.push(m2);
    }
    out
}

fn sanitize_tool_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect();
    if out.is_empty() { "tool".to_string() } else { out }
}

fn restore_tool_name(event: CanonicalEvent, reverse: &HashMap<String, String>) -> CanonicalEvent {
    match event {
        CanonicalEvent::ToolCallStart {
            tool_call_id,
            tool_name,
            model,
            timestamp,
            index,
        } => CanonicalEvent::ToolCallStart {
            tool_name: reverse.get(&tool_name).cloned().unwrap_or(tool_name),
            tool_call_id,
            model,
            timestamp,
            index,
        },
        CanonicalEvent::ToolCallEnd {
            tool_call_id,
            tool_name,
            model,
            timestamp,
            input,
        } => CanonicalEvent::ToolCallEnd {
            tool_name: reverse.get(&tool_name).cloned().unwrap_or(tool_name),
            tool_call_id,
            model,
            timestamp,
            input,
        },
        other => other,
    }
}
