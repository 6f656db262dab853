//! Amazon Bedrock ConverseStream.
//!
//! Requests authenticate with a Bedrock API key as a bearer token. The body
//! arrives in AWS event-stream framing; each message is one Converse event
//! named by its `:event-type` header.

use crate::client::ClientConfig;
use crate::error::{ErrorDescriptor, LlmError, Result};
use crate::events::FinishReason;
use crate::normalize::{ChunkDecoder, ChunkDelta, RawChunk, ToolCallDelta, map_stop_reason};
use crate::types::{ChatMessage, ChatRequest, Role, ToolDefinition};
use crate::usage::{TokenDetails, UsageRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    let url = converse_stream_url(config.base_url(), &request.model)?;
    Ok(http
        .post(url)
        .bearer_auth(config.require_api_key()?)
        .header(reqwest::header::ACCEPT, "application/vnd.amazon.eventstream")
        .json(&ConverseRequest::new(request)))
}

/// `{base}/model/{model}/converse-stream`, with the model id as one
/// percent-encoded path segment.
fn converse_stream_url(base: &str, model: &str) -> Result<reqwest::Url> {
    let invalid = |detail: String| LlmError::InvalidInput(format!("bedrock base URL: {detail}"));
    let mut url = reqwest::Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid(format!("{base} cannot carry a path")))?
        .pop_if_empty()
        .extend(["model", model, "converse-stream"]);
    Ok(url)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseRequest {
    messages: Vec<ConverseMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "InferenceConfig::is_empty")]
    inference_config: InferenceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
}

impl ConverseRequest {
    fn new(request: &ChatRequest) -> Self {
        let mut messages: Vec<ConverseMessage> = Vec::new();
        for m in request.conversation() {
            let next = to_converse_message(m);
            if next.content.is_empty() {
                continue;
            }
            match messages.last_mut() {
                Some(last) if last.role == next.role => last.content.extend(next.content),
                _ => messages.push(next),
            }
        }

        Self {
            messages,
            system: request
                .system_prompt()
                .map(|text| vec![ContentBlock::Text(text)])
                .unwrap_or_default(),
            inference_config: InferenceConfig {
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            },
            tool_config: (!request.tools.is_empty()).then(|| ToolConfig {
                tools: request.tools.iter().map(to_converse_tool).collect(),
            }),
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

impl InferenceConfig {
    fn is_empty(&self) -> bool {
        self.max_tokens.is_none() && self.temperature.is_none()
    }
}

#[derive(Debug, Serialize)]
struct ToolConfig {
    tools: Vec<ConverseTool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConverseTool {
    tool_spec: ToolSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSpec {
    name: String,
    description: String,
    input_schema: InputSchema,
}

#[derive(Debug, Serialize)]
struct InputSchema {
    json: Value,
}

fn to_converse_tool(t: &ToolDefinition) -> ConverseTool {
    ConverseTool {
        tool_spec: ToolSpec {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: InputSchema {
                json: t.parameters.clone(),
            },
        },
    }
}

#[derive(Debug, Serialize)]
struct ConverseMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ContentBlock {
    Text(String),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseBlock {
    tool_use_id: String,
    name: String,
    input: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultBlock {
    tool_use_id: String,
    content: Vec<TextOnly>,
}

#[derive(Debug, Serialize)]
struct TextOnly {
    text: String,
}

fn to_converse_message(m: &ChatMessage) -> ConverseMessage {
    let text = |s: &str| ContentBlock::Text(s.to_string());
    match m.role {
        Role::Tool => ConverseMessage {
            role: "user",
            content: vec![ContentBlock::ToolResult(ToolResultBlock {
                tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                content: vec![TextOnly {
                    text: m.content.clone(),
                }],
            })],
        },
        Role::Assistant => {
            let mut content = Vec::new();
            if !m.content.trim().is_empty() {
                content.push(text(&m.content));
            }
            for tc in &m.tool_calls {
                let input = serde_json::from_str::<Value>(&tc.arguments)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                content.push(ContentBlock::ToolUse(ToolUseBlock {
                    tool_use_id: tc.id.clone(),
                    name: tc.name.clone(),
                    input,
                }));
            }
            ConverseMessage {
                role: "assistant",
                content,
            }
        }
        Role::User | Role::System => ConverseMessage {
            role: "user",
            content: if m.content.trim().is_empty() {
                Vec::new()
            } else {
                vec![text(&m.content)]
            },
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockStart {
    #[serde(default)]
    content_block_index: u32,
    #[serde(default)]
    start: Option<BlockStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStart {
    #[serde(default)]
    tool_use: Option<ToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseStart {
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentBlockDelta {
    #[serde(default)]
    content_block_index: u32,
    #[serde(default)]
    delta: BlockDelta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    reasoning_content: Option<ReasoningDelta>,
    #[serde(default)]
    tool_use: Option<ToolUseDelta>,
}

#[derive(Debug, Deserialize)]
struct ReasoningDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolUseDelta {
    #[serde(default)]
    input: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStop {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    usage: Option<BedrockUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_write_input_tokens: Option<u64>,
}

fn to_usage(u: BedrockUsage) -> UsageRecord {
    UsageRecord::new(
        u.input_tokens.unwrap_or(0),
        u.output_tokens.unwrap_or(0),
        u.total_tokens,
    )
    .with_prompt_details(Some(TokenDetails {
        cached_tokens: u.cache_read_input_tokens.filter(|n| *n > 0),
        cache_write_tokens: u.cache_write_input_tokens.filter(|n| *n > 0),
        ..TokenDetails::default()
    }))
}

/// Bedrock reports usage in a `metadata` event after `messageStop`, so the
/// run completes on `metadata`, or on stream end if it never comes.
#[derive(Debug, Default)]
pub struct BedrockDecoder {
    saw_tool_use: bool,
}

impl BedrockDecoder {
    /// Event name and body. Unnamed chunks use the `{"<event>": {...}}` shape
    /// the AWS SDKs expose.
    fn split(chunk: &RawChunk) -> Option<(String, Value)> {
        let value: Value = serde_json::from_str(&chunk.data).ok()?;
        match chunk.event.as_deref().filter(|e| !e.is_empty()) {
            Some(name) => Some((name.to_string(), value)),
            None => match value {
                Value::Object(map) => map.into_iter().next(),
                _ => None,
            },
        }
    }

    fn finish_reason(&self, stop_reason: Option<&str>) -> FinishReason {
        if self.saw_tool_use {
            return FinishReason::ToolCalls;
        }
        stop_reason
            .and_then(map_stop_reason)
            .unwrap_or(FinishReason::Stop)
    }
}

impl ChunkDecoder for BedrockDecoder {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        let Some((name, body)) = Self::split(chunk) else {
            tracing::debug!(event = ?chunk.event, "skipping unparseable bedrock event");
            return ChunkDelta::default();
        };

        match name.as_str() {
            "contentBlockStart" => {
                let Ok(start) = serde_json::from_value::<ContentBlockStart>(body) else {
                    return ChunkDelta::default();
                };
                let Some(tool) = start.start.and_then(|s| s.tool_use) else {
                    return ChunkDelta::default();
                };
                self.saw_tool_use = true;
                ChunkDelta {
                    tool_calls: vec![ToolCallDelta {
                        index: start.content_block_index,
                        id: tool.tool_use_id,
                        name: tool.name,
                        arguments: None,
                    }],
                    ..ChunkDelta::default()
                }
            }
            "contentBlockDelta" => {
                let Ok(block) = serde_json::from_value::<ContentBlockDelta>(body) else {
                    return ChunkDelta::default();
                };
                let delta = block.delta;
                ChunkDelta {
                    content: delta.text.filter(|t| !t.is_empty()),
                    reasoning: delta
                        .reasoning_content
                        .and_then(|r| r.text)
                        .filter(|t| !t.is_empty()),
                    tool_calls: delta
                        .tool_use
                        .and_then(|t| t.input)
                        .map(|input| ToolCallDelta {
                            index: block.content_block_index,
                            arguments: Some(input),
                            ..ToolCallDelta::default()
                        })
                        .into_iter()
                        .collect(),
                    ..ChunkDelta::default()
                }
            }
            "messageStop" => {
                let stop = serde_json::from_value::<MessageStop>(body).ok();
                let reason = stop.as_ref().and_then(|s| s.stop_reason.as_deref());
                ChunkDelta {
                    finish: Some(self.finish_reason(reason)),
                    ..ChunkDelta::default()
                }
            }
            "metadata" => {
                let usage = serde_json::from_value::<Metadata>(body)
                    .ok()
                    .and_then(|m| m.usage)
                    .map(to_usage);
                ChunkDelta {
                    usage,
                    done: true,
                    ..ChunkDelta::default()
                }
            }
            exception if exception.ends_with("Exception") => {
                let message = ["message", "Message"]
                    .iter()
                    .find_map(|k| body.get(*k).and_then(Value::as_str))
                    .unwrap_or_default();
                let code = match exception {
                    "throttlingException" => "rate_limit_error",
                    other => other,
                };
                ChunkDelta::error(ErrorDescriptor::classify(message, Some(code), None))
            }
            _ => ChunkDelta::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use serde_json::json;

    fn decode(decoder: &mut BedrockDecoder, event: &str, data: Value) -> ChunkDelta {
        decoder.decode(&RawChunk::named(event, data.to_string()))
    }

    #[test]
    fn request_uses_converse_shapes() {
        let mut req = ChatRequest::new(
            "anthropic.claude-3-5-sonnet-20240620-v1:0",
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("weather?"),
                ChatMessage {
                    role: Role::Assistant,
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "t1".to_string(),
                        name: "get_weather".to_string(),
                        arguments: "{\"city\":\"SF\"}".to_string(),
                    }],
                    tool_call_id: None,
                },
                ChatMessage::tool_result("t1", "sunny"),
            ],
        );
        req.max_tokens = Some(256);
        req.tools = vec![ToolDefinition {
            name: "get_weather".to_string(),
            description: "weather".to_string(),
            parameters: json!({"type": "object"}),
        }];

        let body = serde_json::to_value(ConverseRequest::new(&req)).expect("serializes");
        assert_eq!(body["system"], json!([{"text": "be brief"}]));
        assert_eq!(body["inferenceConfig"], json!({"maxTokens": 256}));
        assert_eq!(body["messages"][0], json!({"role": "user", "content": [{"text": "weather?"}]}));
        assert_eq!(
            body["messages"][1]["content"][0]["toolUse"],
            json!({"toolUseId": "t1", "name": "get_weather", "input": {"city": "SF"}})
        );
        assert_eq!(
            body["messages"][2]["content"][0]["toolResult"],
            json!({"toolUseId": "t1", "content": [{"text": "sunny"}]})
        );
        assert_eq!(
            body["toolConfig"]["tools"][0]["toolSpec"]["inputSchema"]["json"],
            json!({"type": "object"})
        );
    }

    #[test]
    fn model_id_is_one_encoded_segment() {
        let url = converse_stream_url(
            "https://bedrock-runtime.us-west-2.amazonaws.com/",
            "us.anthropic.claude-3-7-sonnet/v1:0",
        )
        .expect("valid url");
        assert_eq!(
            url.as_str(),
            "https://bedrock-runtime.us-west-2.amazonaws.com/model/\
             us.anthropic.claude-3-7-sonnet%2Fv1:0/converse-stream"
        );
    }

    #[test]
    fn decodes_text_reasoning_and_tool_use() {
        let mut d = BedrockDecoder::default();
        assert!(decode(&mut d, "messageStart", json!({"role": "assistant"})).is_empty());

        let text = decode(
            &mut d,
            "contentBlockDelta",
            json!({"contentBlockIndex": 0, "delta": {"text": "Hi"}, "p": "abcd"}),
        );
        assert_eq!(text.content.as_deref(), Some("Hi"));

        let thinking = decode(
            &mut d,
            "contentBlockDelta",
            json!({"contentBlockIndex": 0, "delta": {"reasoningContent": {"text": "hmm"}}}),
        );
        assert_eq!(thinking.reasoning.as_deref(), Some("hmm"));

        let start = decode(
            &mut d,
            "contentBlockStart",
            json!({
                "contentBlockIndex": 1,
                "start": {"toolUse": {"toolUseId": "tooluse_1", "name": "get_weather"}}
            }),
        );
        assert_eq!(
            start.tool_calls,
            vec![ToolCallDelta {
                index: 1,
                id: Some("tooluse_1".to_string()),
                name: Some("get_weather".to_string()),
                arguments: None,
            }]
        );

        let args = decode(
            &mut d,
            "contentBlockDelta",
            json!({"contentBlockIndex": 1, "delta": {"toolUse": {"input": "{\"city\":"}}}),
        );
        assert_eq!(args.tool_calls[0].index, 1);
        assert_eq!(args.tool_calls[0].arguments.as_deref(), Some("{\"city\":"));

        assert!(decode(&mut d, "contentBlockStop", json!({"contentBlockIndex": 1})).is_empty());

        let stop = decode(&mut d, "messageStop", json!({"stopReason": "end_turn"}));
        assert_eq!(stop.finish, Some(FinishReason::ToolCalls));
        assert!(!stop.done);
    }

    #[test]
    fn stop_reasons_and_metadata_usage() {
        let mut d = BedrockDecoder::default();
        let stop = decode(&mut d, "messageStop", json!({"stopReason": "max_tokens"}));
        assert_eq!(stop.finish, Some(FinishReason::Length));
        let stop = decode(
            &mut d,
            "messageStop",
            json!({"stopReason": "model_context_window_exceeded"}),
        );
        assert_eq!(stop.finish, Some(FinishReason::Length));
        let stop = decode(&mut d, "messageStop", json!({"stopReason": "guardrail_intervened"}));
        assert_eq!(stop.finish, Some(FinishReason::Stop));

        let meta = decode(
            &mut d,
            "metadata",
            json!({
                "usage": {
                    "inputTokens": 12,
                    "outputTokens": 4,
                    "totalTokens": 16,
                    "cacheReadInputTokens": 8
                },
                "metrics": {"latencyMs": 300}
            }),
        );
        assert!(meta.done);
        let usage = meta.usage.expect("usage");
        assert_eq!(
            (usage.prompt_tokens, usage.completion_tokens, usage.total_tokens),
            (12, 4, 16)
        );
        assert_eq!(
            usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
            Some(8)
        );
    }

    #[test]
    fn sdk_shaped_chunks_carry_the_event_name_as_key() {
        let mut d = BedrockDecoder::default();
        let delta = d.decode(&RawChunk::data(
            json!({"contentBlockDelta": {"contentBlockIndex": 0, "delta": {"text": "x"}}})
                .to_string(),
        ));
        assert_eq!(delta.content.as_deref(), Some("x"));
    }

    #[test]
    fn exceptions_map_through_taxonomy() {
        let mut d = BedrockDecoder::default();
        let err = decode(&mut d, "throttlingException", json!({"message": "Too many requests"}))
            .error
            .expect("error");
        assert_eq!(err.code.as_deref(), Some("rate_limit"));
        assert_eq!(err.message, "Too many requests");

        let err = decode(&mut d, "validationException", json!({"Message": "bad input"}))
            .error
            .expect("error");
        assert_eq!(err.code.as_deref(), Some("validationException"));
        assert_eq!(err.message, "bad input");
    }

    #[test]
    fn garbage_decodes_to_nothing() {
        let mut d = BedrockDecoder::default();
        assert!(d.decode(&RawChunk::named("contentBlockDelta", "not json")).is_empty());
        assert!(d.decode(&RawChunk::data("[1,2]")).is_empty());
    }
}
