use crate::client::ClientConfig;
use crate::error::{ErrorDescriptor, Result};
use crate::events::FinishReason;
use crate::normalize::{ChunkDecoder, ChunkDelta, CompleteToolCall, RawChunk, map_stop_reason};
use crate::types::{ChatMessage, ChatRequest, Role};
use crate::usage::UsageRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    let url = format!("{}/api/chat", config.base_url().trim_end_matches('/'));
    let mut builder = http.post(url).json(&OllamaRequest::new(request));
    // A key is optional; hosted Ollama endpoints accept a bearer token.
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        builder = builder.bearer_auth(key);
    }
    Ok(builder)
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaRequestToolCall>,
}

#[derive(Debug, Serialize)]
struct OllamaRequestToolCall {
    function: OllamaRequestFunction,
}

#[derive(Debug, Serialize)]
struct OllamaRequestFunction {
    name: String,
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    r#type: &'static str,
    function: OllamaToolFunction,
}

#[derive(Debug, Serialize)]
struct OllamaToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

fn to_ollama_message(m: &ChatMessage) -> OllamaMessage {
    OllamaMessage {
        role: m.role.as_str(),
        content: m.content.clone(),
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| OllamaRequestToolCall {
                function: OllamaRequestFunction {
                    name: tc.name.clone(),
                    arguments: serde_json::from_str(&tc.arguments)
                        .unwrap_or_else(|_| Value::Object(Map::new())),
                },
            })
            .collect(),
    }
}

impl OllamaRequest {
    fn new(request: &ChatRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system_prompt() {
            messages.push(OllamaMessage {
                role: Role::System.as_str(),
                content: system,
                tool_calls: Vec::new(),
            });
        }
        messages.extend(request.conversation().map(to_ollama_message));

        Self {
            model: request.model.clone(),
            messages,
            tools: request
                .tools
                .iter()
                .map(|t| OllamaTool {
                    r#type: "function",
                    function: OllamaToolFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
            stream: true,
            options: (request.temperature.is_some() || request.max_tokens.is_some()).then_some(
                OllamaOptions {
                    temperature: request.temperature,
                    num_predict: request.max_tokens,
                },
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaStreamLine {
    #[serde(default)]
    message: Option<OllamaStreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OllamaStreamToolCall>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamToolCall {
    #[serde(default)]
    id: Option<String>,
    function: OllamaStreamFunction,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn to_usage(line: &OllamaStreamLine) -> Option<UsageRecord> {
    let prompt = line.prompt_eval_count.unwrap_or(0);
    let completion = line.eval_count.unwrap_or(0);
    if prompt == 0 && completion == 0 {
        return None;
    }
    let mut provider = Map::new();
    for (key, value) in [
        ("loadDuration", line.load_duration),
        ("promptEvalDuration", line.prompt_eval_duration),
        ("evalDuration", line.eval_duration),
        ("totalDuration", line.total_duration),
    ] {
        if let Some(value) = value.filter(|v| *v > 0) {
            provider.insert(key.to_string(), value.into());
        }
    }
    Some(
        UsageRecord::new(prompt, completion, None)
            .with_provider_details(provider),
    )
}

#[derive(Debug, Default)]
pub struct OllamaDecoder;

impl ChunkDecoder for OllamaDecoder {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        let line: OllamaStreamLine = match serde_json::from_str(&chunk.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%e, "skipping unparseable ollama line");
                return ChunkDelta::default();
            }
        };

        if let Some(error) = line.error.as_deref().filter(|e| !e.is_empty()) {
            return ChunkDelta::error(ErrorDescriptor::classify(error, None, None));
        }

        let mut out = ChunkDelta::default();
        if line.done {
            out.usage = to_usage(&line);
            out.finish = Some(
                line.done_reason
                    .as_deref()
                    .and_then(map_stop_reason)
                    .unwrap_or(FinishReason::Stop),
            );
            out.done = true;
        }
        if let Some(message) = line.message {
            out.reasoning = message.thinking.filter(|t| !t.is_empty());
            out.content = (!message.content.is_empty()).then_some(message.content);
            out.complete_tool_calls = message
                .tool_calls
                .into_iter()
                .map(|tc| CompleteToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    input: tc.function.arguments,
                })
                .collect();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use serde_json::json;

    fn decode(data: Value) -> ChunkDelta {
        OllamaDecoder.decode(&RawChunk::data(data.to_string()))
    }

    #[test]
    fn request_sends_structured_tool_arguments() {
        let mut req = ChatRequest::new(
            "llama3.2",
            vec![
                ChatMessage::user("hi"),
                ChatMessage {
                    role: Role::Assistant,
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "c".to_string(),
                        name: "f".to_string(),
                        arguments: "{\"n\":2}".to_string(),
                    }],
                    tool_call_id: None,
                },
            ],
        );
        req.system = Some("sys".to_string());
        req.max_tokens = Some(10);

        let body = serde_json::to_value(OllamaRequest::new(&req)).expect("serializes");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["tool_calls"][0]["function"]["arguments"], json!({"n": 2}));
        assert_eq!(body["options"], json!({"num_predict": 10}));
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn decodes_content_thinking_and_tool_calls() {
        let d = decode(json!({
            "model": "m",
            "message": {"role": "assistant", "content": "Hi", "thinking": "hmm"},
            "done": false
        }));
        assert_eq!(d.content.as_deref(), Some("Hi"));
        assert_eq!(d.reasoning.as_deref(), Some("hmm"));
        assert!(!d.done);

        let d = decode(json!({"message": {"role": "assistant", "content": "", "tool_calls": [
            {"function": {"name": "get_weather", "arguments": {"loc": "SF"}}}
        ]}, "done": false}));
        assert_eq!(d.content, None);
        assert_eq!(d.complete_tool_calls[0].input, json!({"loc": "SF"}));
    }

    #[test]
    fn final_line_carries_usage_and_finish() {
        let d = decode(json!({
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": "length",
            "prompt_eval_count": 12,
            "eval_count": 8,
            "total_duration": 5000,
            "load_duration": 0
        }));
        assert!(d.done);
        assert_eq!(d.finish, Some(FinishReason::Length));
        let usage = d.usage.expect("usage");
        assert_eq!(usage.total_tokens, 20);
        let provider = usage.provider_usage_details.expect("provider details");
        assert_eq!(provider["totalDuration"], 5000);
        assert!(!provider.contains_key("loadDuration"));

        let d = decode(json!({
            "message": {"content": ""},
            "done": true,
            "prompt_eval_count": 0,
            "eval_count": 0
        }));
        assert_eq!(d.usage, None);
        assert_eq!(d.finish, Some(FinishReason::Stop));
    }

    #[test]
    fn decodes_error_lines() {
        let d = decode(json!({"error": "model \"nope\" not found"}));
        let err = d.error.expect("error");
        assert_eq!(err.code.as_deref(), Some("unknown_error"));
        assert!(err.message.contains("not found"));
    }
}
