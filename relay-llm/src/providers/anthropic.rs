use crate::client::ClientConfig;
use crate::error::{ErrorDescriptor, Result};
use crate::normalize::{ChunkDecoder, ChunkDelta, RawChunk, ToolCallDelta, map_stop_reason};
use crate::types::{ChatMessage, ChatRequest, Role, ToolDefinition};
use crate::usage::{TokenDetails, UsageRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    let url = format!("{}/v1/messages", config.base_url().trim_end_matches('/'));
    Ok(http
        .post(url)
        .header("x-api-key", config.require_api_key()?)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&AnthropicRequest::new(request)))
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

impl AnthropicRequest {
    fn new(request: &ChatRequest) -> Self {
        let mut messages: Vec<AnthropicMessage> = Vec::new();
        for m in request.conversation() {
            let next = match m.role {
                Role::Assistant => to_anthropic_assistant_message(m),
                Role::Tool => to_anthropic_tool_result_message(m),
                Role::User | Role::System => to_anthropic_user_message(m),
            };
            // Consecutive same-role turns (e.g. several tool results) merge into one.
            match messages.last_mut() {
                Some(last) if last.role == next.role => last.content.extend(next.content),
                _ => messages.push(next),
            }
        }

        Self {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system_prompt(),
            messages,
            tools: request.tools.iter().map(to_anthropic_tool).collect(),
            temperature: request.temperature,
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

fn to_anthropic_tool(t: &ToolDefinition) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.parameters.clone(),
    }
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    #[serde(other)]
    Unsupported,
}

fn to_anthropic_user_message(m: &ChatMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: "user",
        content: vec![AnthropicContentBlock::Text {
            text: m.content.clone(),
        }],
    }
}

fn to_anthropic_tool_result_message(m: &ChatMessage) -> AnthropicMessage {
    AnthropicMessage {
        role: "user",
        content: vec![AnthropicContentBlock::ToolResult {
            tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
            content: m.content.clone(),
        }],
    }
}

fn to_anthropic_assistant_message(m: &ChatMessage) -> AnthropicMessage {
    let mut blocks = Vec::new();
    if !m.content.trim().is_empty() {
        blocks.push(AnthropicContentBlock::Text {
            text: m.content.clone(),
        });
    }
    for tc in &m.tool_calls {
        let input = serde_json::from_str::<Value>(&tc.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Map::new()));
        blocks.push(AnthropicContentBlock::ToolUse {
            id: tc.id.clone(),
            name: tc.name.clone(),
            input,
        });
    }
    AnthropicMessage {
        role: "assistant",
        content: blocks,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStartMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: AnthropicMessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: AnthropicError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStartMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicMessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    server_tool_use: Option<AnthropicServerToolUse>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all(serialize = "camelCase"))]
struct AnthropicServerToolUse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    web_search_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    web_fetch_requests: Option<u64>,
}

/// Anthropic splits usage across `message_start` (input, cache) and
/// `message_delta` (output). The decoder keeps the former for the run.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    input_tokens: u64,
    cache_read_tokens: Option<u64>,
    cache_write_tokens: Option<u64>,
    server_tool_use: Option<AnthropicServerToolUse>,
}

impl AnthropicDecoder {
    fn remember(&mut self, usage: &AnthropicUsage) {
        if let Some(n) = usage.input_tokens.filter(|n| *n > 0) {
            self.input_tokens = n;
        }
        if let Some(n) = usage.cache_read_input_tokens {
            self.cache_read_tokens = Some(n);
        }
        if let Some(n) = usage.cache_creation_input_tokens {
            self.cache_write_tokens = Some(n);
        }
        if let Some(s) = &usage.server_tool_use {
            self.server_tool_use = Some(s.clone());
        }
    }

    fn usage(&self, output_tokens: u64) -> UsageRecord {
        let mut provider = Map::new();
        if let Some(value) = self
            .server_tool_use
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok())
        {
            provider.insert("serverToolUse".to_string(), value);
        }
        UsageRecord::new(self.input_tokens, output_tokens, None)
            .with_prompt_details(Some(TokenDetails {
                cached_tokens: self.cache_read_tokens.filter(|n| *n > 0),
                cache_write_tokens: self.cache_write_tokens.filter(|n| *n > 0),
                ..TokenDetails::default()
            }))
            .with_provider_details(provider)
    }
}

impl ChunkDecoder for AnthropicDecoder {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        let event: AnthropicStreamEvent = match serde_json::from_str(&chunk.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%e, event = ?chunk.event, "skipping unparseable anthropic event");
                return ChunkDelta::default();
            }
        };

        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = &message.usage {
                    self.remember(usage);
                }
                ChunkDelta::default()
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: AnthropicContentBlock::ToolUse { id, name, .. },
            } => ChunkDelta {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: Some(id),
                    name: Some(name),
                    arguments: None,
                }],
                ..ChunkDelta::default()
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicDelta::TextDelta { text } => ChunkDelta::content(text),
                AnthropicDelta::ThinkingDelta { thinking } => ChunkDelta::reasoning(thinking),
                AnthropicDelta::InputJsonDelta { partial_json } => ChunkDelta {
                    tool_calls: vec![ToolCallDelta {
                        index,
                        arguments: Some(partial_json),
                        ..ToolCallDelta::default()
                    }],
                    ..ChunkDelta::default()
                },
                AnthropicDelta::Other => ChunkDelta::default(),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                let usage = usage.map(|u| {
                    self.remember(&u);
                    self.usage(u.output_tokens.unwrap_or(0))
                });
                ChunkDelta {
                    finish: delta.stop_reason.as_deref().and_then(map_stop_reason),
                    usage,
                    ..ChunkDelta::default()
                }
            }
            AnthropicStreamEvent::MessageStop => ChunkDelta::done(),
            AnthropicStreamEvent::Error { error } => ChunkDelta::error(ErrorDescriptor::classify(
                error.message.unwrap_or_default(),
                error.kind.as_deref(),
                None,
            )),
            AnthropicStreamEvent::ContentBlockStart { .. } | AnthropicStreamEvent::Other => {
                ChunkDelta::default()
            }
        }
    }
}
