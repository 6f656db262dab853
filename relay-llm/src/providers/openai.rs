//! OpenAI Chat Completions, plus the OpenRouter, xAI, Z.ai and Nebius dialects
//! that share its wire format.

use crate::client::ClientConfig;
use crate::error::{ErrorDescriptor, Result};
use crate::normalize::{
    ChunkDecoder, ChunkDelta, CompleteToolCall, RawChunk, ToolCallDelta, map_stop_reason,
};
use crate::types::{ChatMessage, ChatRequest, Role, ToolDefinition};
use crate::usage::{TokenDetails, UsageRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    let url = format!("{}/chat/completions", config.base_url().trim_end_matches('/'));
    let body = OpenAiChatRequest::new(request);
    Ok(http
        .post(url)
        .bearer_auth(config.require_api_key()?)
        .json(&body))
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    stream_options: OpenAiStreamOptions,
}

#[derive(Debug, Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

impl OpenAiChatRequest {
    fn new(request: &ChatRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system_prompt() {
            messages.push(OpenAiMessage {
                role: Role::System.as_str().to_string(),
                content: Some(system),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.extend(request.conversation().map(to_openai_message));

        let tools: Vec<OpenAiTool> = request.tools.iter().map(to_openai_tool).collect();
        Self {
            model: request.model.clone(),
            messages,
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
            tools,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: OpenAiStreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function".to_string(),
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiToolFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunctionCall {
    name: String,
    arguments: String,
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    OpenAiMessage {
        role: m.role.as_str().to_string(),
        content: Some(m.content.clone()).filter(|s| !s.is_empty()),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| OpenAiToolCall {
                id: tc.id.clone(),
                r#type: "function".to_string(),
                function: OpenAiToolFunctionCall {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<OpenAiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamError {
    #[serde(default)]
    message: Option<String>,
    /// OpenRouter sends the HTTP status here as a number.
    #[serde(default)]
    code: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: Option<OpenAiStreamDelta>,
    #[serde(default)]
    message: Option<OpenAiStreamMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_details: Vec<OpenAiReasoningDetail>,
    #[serde(default)]
    images: Vec<OpenAiImage>,
    #[serde(default)]
    tool_calls: Vec<OpenAiStreamDeltaToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiReasoningDetail {
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiImage {
    image_url: OpenAiImageUrl,
}

#[derive(Debug, Deserialize)]
struct OpenAiImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiStreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Whole message, as some OpenRouter upstreams send on the final chunk.
#[derive(Debug, Deserialize)]
struct OpenAiStreamMessage {
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    images: Vec<OpenAiImage>,
    #[serde(default)]
    tool_calls: Vec<OpenAiMessageToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessageToolCall {
    #[serde(default)]
    id: Option<String>,
    function: OpenAiMessageToolFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessageToolFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptTokensDetails>,
    #[serde(default)]
    completion_tokens_details: Option<OpenAiCompletionTokensDetails>,
    /// OpenRouter only.
    #[serde(default)]
    cost: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiPromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
    #[serde(default)]
    audio_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
    #[serde(default)]
    audio_tokens: Option<u64>,
    #[serde(default)]
    accepted_prediction_tokens: Option<u64>,
    #[serde(default)]
    rejected_prediction_tokens: Option<u64>,
}

fn to_usage(u: OpenAiUsage) -> UsageRecord {
    let mut provider = Map::new();
    let prompt = u.prompt_tokens_details.map(|d| TokenDetails {
        cached_tokens: d.cached_tokens.filter(|n| *n > 0),
        audio_tokens: d.audio_tokens.filter(|n| *n > 0),
        ..TokenDetails::default()
    });
    let completion = u.completion_tokens_details.map(|d| {
        if let Some(n) = d.accepted_prediction_tokens.filter(|n| *n > 0) {
            provider.insert("acceptedPredictionTokens".to_string(), n.into());
        }
        if let Some(n) = d.rejected_prediction_tokens.filter(|n| *n > 0) {
            provider.insert("rejectedPredictionTokens".to_string(), n.into());
        }
        TokenDetails {
            reasoning_tokens: d.reasoning_tokens.filter(|n| *n > 0),
            audio_tokens: d.audio_tokens.filter(|n| *n > 0),
            ..TokenDetails::default()
        }
    });
    if let Some(cost) = u.cost {
        provider.insert("cost".to_string(), cost);
    }

    UsageRecord::new(
        u.prompt_tokens.unwrap_or(0),
        u.completion_tokens.unwrap_or(0),
        u.total_tokens,
    )
        .with_prompt_details(prompt)
        .with_completion_details(completion)
        .with_provider_details(provider)
}

/// Decoder for `chat.completion.chunk` SSE payloads.
#[derive(Debug, Default)]
pub struct OpenAiChatDecoder;

impl ChunkDecoder for OpenAiChatDecoder {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        let data = chunk.data.trim();
        if data == "[DONE]" {
            return ChunkDelta::done();
        }
        let parsed: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%e, "skipping unparseable openai chunk");
                return ChunkDelta::default();
            }
        };

        let mut out = ChunkDelta::default();
        if let Some(err) = parsed.error {
            let (code, status) = match err.code {
                Some(Value::String(code)) => (Some(code), None),
                Some(Value::Number(n)) => (None, n.as_u64().and_then(|n| u16::try_from(n).ok())),
                _ => (err.kind, None),
            };
            out.error = Some(ErrorDescriptor::classify(
                err.message.unwrap_or_default(),
                code.as_deref(),
                status,
            ));
            return out;
        }
        out.usage = parsed.usage.map(to_usage);

        let Some(choice) = parsed.choices.into_iter().next() else {
            return out;
        };

        let delta = choice.delta.unwrap_or_default();
        let reasoning = delta
            .reasoning_content
            .filter(|s| !s.is_empty())
            .or(delta.reasoning.filter(|s| !s.is_empty()))
            .or_else(|| {
                let joined: String = delta
                    .reasoning_details
                    .iter()
                    .filter_map(|d| d.thinking.as_deref().or(d.text.as_deref()))
                    .collect();
                (!joined.is_empty()).then_some(joined)
            });
        out.reasoning = reasoning;

        let mut content = delta.content.unwrap_or_default();
        for image in &delta.images {
            content.push_str(&format!("![Generated Image]({})", image.image_url.url));
        }

        out.tool_calls = delta
            .tool_calls
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: tc.index.unwrap_or(0),
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect();

        if let Some(message) = choice.message {
            for image in &message.images {
                content.push_str(&format!("![Generated Image]({})", image.image_url.url));
            }
            out.complete_tool_calls = message
                .tool_calls
                .into_iter()
                .map(|tc| CompleteToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    input: Value::String(tc.function.arguments),
                })
                .collect();
            if let Some(refusal) = message.refusal.filter(|r| !r.is_empty()) {
                out.error = Some(ErrorDescriptor::new(refusal, Some("refusal".to_string())));
            }
        }

        out.content = (!content.is_empty()).then_some(content);
        out.finish = choice.finish_reason.as_deref().and_then(map_stop_reason);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FinishReason;
    use crate::types::ToolCall;
    use serde_json::json;

    fn decode(data: Value) -> ChunkDelta {
        OpenAiChatDecoder.decode(&RawChunk::data(data.to_string()))
    }

    #[test]
    fn request_body_carries_system_tools_and_stream_options() {
        let mut req = ChatRequest::new(
            "gpt-4o-mini",
            vec![
                ChatMessage::user("weather?"),
                ChatMessage {
                    role: Role::Assistant,
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "c1".to_string(),
                        name: "get_weather".to_string(),
                        arguments: "{}".to_string(),
                    }],
                    tool_call_id: None,
                },
                ChatMessage::tool_result("c1", "sunny"),
            ],
        );
        req.system = Some("be brief".to_string());
        req.tools = vec![ToolDefinition {
            name: "get_weather".to_string(),
            description: "weather".to_string(),
            parameters: json!({"type": "object"}),
        }];

        let body = serde_json::to_value(OpenAiChatRequest::new(&req)).expect("serializes");
        assert_eq!(body["messages"][0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(body["messages"][2]["tool_calls"][0]["function"]["name"], "get_weather");
        assert!(body["messages"][2].get("content").is_none());
        assert_eq!(body["messages"][3]["tool_call_id"], "c1");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn decodes_content_tool_fragments_and_finish() {
        let d = decode(json!({"choices": [{"delta": {"content": "Hi"}, "finish_reason": null}]}));
        assert_eq!(d.content.as_deref(), Some("Hi"));
        assert_eq!(d.finish, None);

        let d = decode(json!({"choices": [{"delta": {"tool_calls": [
            {"index": 1, "id": "call_1", "function": {"name": "lookup", "arguments": "{\"q\""}}
        ]}}]}));
        assert_eq!(
            d.tool_calls,
            vec![ToolCallDelta {
                index: 1,
                id: Some("call_1".to_string()),
                name: Some("lookup".to_string()),
                arguments: Some("{\"q\"".to_string()),
            }]
        );

        let d = decode(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}));
        assert_eq!(d.finish, Some(FinishReason::ToolCalls));

        assert!(OpenAiChatDecoder.decode(&RawChunk::data("[DONE]")).done);
        assert!(OpenAiChatDecoder.decode(&RawChunk::data("not json")).is_empty());
    }

    #[test]
    fn decodes_reasoning_dialects_without_duplication() {
        let d = decode(json!({"choices": [{"delta": {"reasoning_content": "deep"}}]}));
        assert_eq!(d.reasoning.as_deref(), Some("deep"));

        let d = decode(json!({"choices": [{"delta": {
            "reasoning": "plan",
            "reasoning_details": [{"type": "reasoning.text", "text": "plan"}]
        }}]}));
        assert_eq!(d.reasoning.as_deref(), Some("plan"));

        let d = decode(json!({"choices": [{"delta": {
            "reasoning_details": [{"thinking": "a"}, {"text": "b"}]
        }}]}));
        assert_eq!(d.reasoning.as_deref(), Some("ab"));
    }

    #[test]
    fn decodes_usage_with_details() {
        let d = decode(json!({
            "choices": [],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 20,
                "total_tokens": 120,
                "prompt_tokens_details": {"cached_tokens": 40, "audio_tokens": 0},
                "completion_tokens_details": {
                    "reasoning_tokens": 8,
                    "accepted_prediction_tokens": 3,
                    "rejected_prediction_tokens": 0
                }
            }
        }));
        let usage = d.usage.expect("usage decoded");
        assert_eq!(usage.total_tokens, 120);
        assert_eq!(
            usage.prompt_tokens_details.and_then(|p| p.cached_tokens),
            Some(40)
        );
        assert_eq!(
            usage.completion_tokens_details.and_then(|c| c.reasoning_tokens),
            Some(8)
        );
        let provider = usage.provider_usage_details.expect("provider details");
        assert_eq!(provider["acceptedPredictionTokens"], 3);
        assert!(!provider.contains_key("rejectedPredictionTokens"));
    }

    #[test]
    fn decodes_mid_stream_errors_and_whole_messages() {
        let d = decode(json!({"error": {"message": "Rate limited", "code": 429}}));
        let err = d.error.expect("error decoded");
        assert_eq!(err.code.as_deref(), Some("rate_limit"));
        assert_eq!(err.message, "Rate limited");

        let d = decode(json!({"error": {"message": "bad", "code": "invalid_api_key"}}));
        assert_eq!(d.error.and_then(|e| e.code).as_deref(), Some("auth_error"));

        let d = decode(json!({"choices": [{"message": {"tool_calls": [
            {"id": "x", "function": {"name": "search", "arguments": "{\"q\":1}"}}
        ]}, "finish_reason": "tool_calls"}]}));
        assert_eq!(d.complete_tool_calls.len(), 1);
        assert_eq!(d.complete_tool_calls[0].input, Value::String("{\"q\":1}".to_string()));

        let d = decode(json!({"choices": [{"message": {"refusal": "no"}}]}));
        assert_eq!(d.error.and_then(|e| e.code).as_deref(), Some("refusal"));
    }

    #[test]
    fn usage_edge_values_do_not_break_the_chunk() {
        let d = decode(json!({"choices": [], "usage": {
            "prompt_tokens": u64::MAX, "completion_tokens": 1
        }}));
        assert_eq!(d.usage.map(|u| u.total_tokens), Some(u64::MAX));

        let d = decode(json!({
            "choices": [{"delta": {"content": "tail"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": null, "completion_tokens": 4}
        }));
        assert_eq!(d.content.as_deref(), Some("tail"));
        assert_eq!(d.finish, Some(FinishReason::Stop));
        let usage = d.usage.expect("usage kept");
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.total_tokens, 4);
    }
}
