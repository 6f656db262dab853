use crate::client::ClientConfig;
use crate::error::{ErrorDescriptor, Result};
use crate::normalize::{ChunkDecoder, ChunkDelta, CompleteToolCall, RawChunk, map_stop_reason};
use crate::types::{ChatRequest, Role};
use crate::usage::{ModalityTokenCount, UsageRecord, flatten_modality_token_counts};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    let url = format!(
        "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
        config.base_url().trim_end_matches('/'),
        request.model
    );
    Ok(http
        .post(url)
        .header("x-goog-api-key", config.require_api_key()?)
        .json(&GeminiRequest::new(request)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTools>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiRequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiRequestPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCallPart,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponsePart,
    },
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallPart {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionResponsePart {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTools {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

impl GeminiRequest {
    fn new(request: &ChatRequest) -> Self {
        // Function responses are addressed by name, not by call id.
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        let mut contents: Vec<GeminiContent> = Vec::new();

        for m in request.conversation() {
            let (role, parts) = match m.role {
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !m.content.is_empty() {
                        parts.push(GeminiRequestPart::Text {
                            text: m.content.clone(),
                        });
                    }
                    for tc in &m.tool_calls {
                        call_names.insert(tc.id.as_str(), tc.name.as_str());
                        parts.push(GeminiRequestPart::FunctionCall {
                            function_call: GeminiFunctionCallPart {
                                name: tc.name.clone(),
                                args: serde_json::from_str(&tc.arguments)
                                    .unwrap_or_else(|_| Value::Object(Map::new())),
                            },
                        });
                    }
                    ("model", parts)
                }
                Role::Tool => {
                    let id = m.tool_call_id.as_deref().unwrap_or_default();
                    let name = call_names.get(id).copied().unwrap_or(id);
                    (
                        "user",
                        vec![GeminiRequestPart::FunctionResponse {
                            function_response: GeminiFunctionResponsePart {
                                name: name.to_string(),
                                response: serde_json::json!({ "content": m.content }),
                            },
                        }],
                    )
                }
                Role::User | Role::System => (
                    "user",
                    vec![GeminiRequestPart::Text {
                        text: m.content.clone(),
                    }],
                ),
            };
            match contents.last_mut() {
                Some(last) if last.role == Some(role) => last.parts.extend(parts),
                _ => contents.push(GeminiContent {
                    role: Some(role),
                    parts,
                }),
            }
        }

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTools {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| GeminiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        let generation_config = (request.temperature.is_some() || request.max_tokens.is_some())
            .then_some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            });

        Self {
            contents,
            system_instruction: request.system_prompt().map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiRequestPart::Text { text }],
            }),
            tools,
            generation_config,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiCandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    total_token_count: Option<u64>,
    #[serde(default)]
    cached_content_token_count: Option<u64>,
    #[serde(default)]
    thoughts_token_count: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Vec<ModalityTokenCount>,
    #[serde(default)]
    candidates_tokens_details: Vec<ModalityTokenCount>,
    #[serde(default)]
    cache_tokens_details: Vec<ModalityTokenCount>,
    #[serde(default)]
    tool_use_prompt_token_count: Option<u64>,
    #[serde(default)]
    tool_use_prompt_tokens_details: Vec<ModalityTokenCount>,
    #[serde(default)]
    traffic_type: Option<String>,
}

fn modality_list(counts: &[ModalityTokenCount]) -> Value {
    Value::Array(
        counts
            .iter()
            .map(|c| {
                serde_json::json!({
                    "modality": c.modality.as_deref().unwrap_or("UNKNOWN"),
                    "tokenCount": c.token_count.unwrap_or(0),
                })
            })
            .collect(),
    )
}

fn to_usage(u: GeminiUsageMetadata) -> UsageRecord {
    let mut prompt = flatten_modality_token_counts(&u.prompt_tokens_details).unwrap_or_default();
    prompt.cached_tokens = u.cached_content_token_count.filter(|n| *n > 0);

    let mut completion =
        flatten_modality_token_counts(&u.candidates_tokens_details).unwrap_or_default();
    completion.reasoning_tokens = u.thoughts_token_count.filter(|n| *n > 0);

    let mut provider = Map::new();
    if let Some(traffic) = u.traffic_type.filter(|t| !t.is_empty()) {
        provider.insert("trafficType".to_string(), Value::String(traffic));
    }
    if let Some(n) = u.tool_use_prompt_token_count.filter(|n| *n > 0) {
        provider.insert("toolUsePromptTokenCount".to_string(), n.into());
    }
    if !u.tool_use_prompt_tokens_details.is_empty() {
        provider.insert(
            "toolUsePromptTokensDetails".to_string(),
            modality_list(&u.tool_use_prompt_tokens_details),
        );
    }
    if !u.cache_tokens_details.is_empty() {
        provider.insert(
            "cacheTokensDetails".to_string(),
            modality_list(&u.cache_tokens_details),
        );
    }

    UsageRecord::new(
        u.prompt_token_count.unwrap_or(0),
        u.candidates_token_count.unwrap_or(0),
        u.total_token_count,
    )
        .with_prompt_details(Some(prompt))
        .with_completion_details(Some(completion))
        .with_provider_details(provider)
}

#[derive(Debug, Default)]
pub struct GeminiDecoder;

impl ChunkDecoder for GeminiDecoder {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        let parsed: GeminiStreamChunk = match serde_json::from_str(&chunk.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%e, "skipping unparseable gemini chunk");
                return ChunkDelta::default();
            }
        };

        if let Some(err) = parsed.error {
            return ChunkDelta::error(ErrorDescriptor::classify(
                err.message.unwrap_or_default(),
                None,
                err.code,
            ));
        }

        let mut out = ChunkDelta {
            usage: parsed.usage_metadata.map(to_usage),
            ..ChunkDelta::default()
        };
        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return out;
        };

        let mut text = String::new();
        let mut thoughts = String::new();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                out.complete_tool_calls.push(CompleteToolCall {
                    id: call.id,
                    name: call.name,
                    input: call.args,
                });
                continue;
            }
            if let Some(t) = part.text {
                if part.thought {
                    thoughts.push_str(&t);
                } else {
                    text.push_str(&t);
                }
            }
        }
        out.reasoning = (!thoughts.is_empty()).then_some(thoughts);
        out.content = (!text.is_empty()).then_some(text);
        out.finish = candidate.finish_reason.as_deref().and_then(map_stop_reason);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FinishReason;
    use crate::types::{ChatMessage, ToolCall, ToolDefinition};
    use serde_json::json;

    fn decode(data: Value) -> ChunkDelta {
        GeminiDecoder.decode(&RawChunk::data(data.to_string()))
    }

    #[test]
    fn request_maps_roles_and_function_responses() {
        let mut req = ChatRequest::new(
            "gemini-2.5-flash",
            vec![
                ChatMessage::system("terse"),
                ChatMessage::user("weather in SF?"),
                ChatMessage {
                    role: Role::Assistant,
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "c1".to_string(),
                        name: "get_weather".to_string(),
                        arguments: "{\"loc\":\"SF\"}".to_string(),
                    }],
                    tool_call_id: None,
                },
                ChatMessage::tool_result("c1", "foggy"),
            ],
        );
        req.tools = vec![ToolDefinition {
            name: "get_weather".to_string(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }];
        req.temperature = Some(0.2);

        let body = serde_json::to_value(GeminiRequest::new(&req)).expect("serializes");
        assert_eq!(body["systemInstruction"], json!({"parts": [{"text": "terse"}]}));
        assert_eq!(
            body["contents"][0],
            json!({"role": "user", "parts": [{"text": "weather in SF?"}]})
        );
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["args"], json!({"loc": "SF"}));
        assert_eq!(body["contents"][2]["parts"][0]["functionResponse"]["name"], "get_weather");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "get_weather");
        assert!(body["generationConfig"].get("maxOutputTokens").is_none());
    }

    #[test]
    fn decodes_parts_and_finish() {
        let d = decode(json!({"candidates": [{"content": {"role": "model", "parts": [
            {"text": "pondering", "thought": true},
            {"text": "Hello"},
            {"text": " there"}
        ]}}]}));
        assert_eq!(d.reasoning.as_deref(), Some("pondering"));
        assert_eq!(d.content.as_deref(), Some("Hello there"));

        let d = decode(json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "get_weather", "args": {"loc": "SF"}}}
        ]}, "finishReason": "STOP"}]}));
        assert_eq!(d.complete_tool_calls.len(), 1);
        assert_eq!(d.complete_tool_calls[0].id, None);
        assert_eq!(d.finish, Some(FinishReason::Stop));

        let d = decode(json!({"candidates": [{"finishReason": "MAX_TOKENS"}]}));
        assert_eq!(d.finish, Some(FinishReason::Length));
    }

    #[test]
    fn decodes_usage_metadata() {
        let d = decode(json!({"usageMetadata": {
            "promptTokenCount": 150,
            "candidatesTokenCount": 30,
            "totalTokenCount": 200,
            "cachedContentTokenCount": 40,
            "thoughtsTokenCount": 20,
            "promptTokensDetails": [
                {"modality": "TEXT", "tokenCount": 100},
                {"modality": "text", "tokenCount": 50},
                {"modality": "DOCUMENT", "tokenCount": 9}
            ],
            "trafficType": "ON_DEMAND",
            "toolUsePromptTokenCount": 0
        }}));
        let usage = d.usage.expect("usage");
        assert_eq!(usage.total_tokens, 200);
        let prompt = usage.prompt_tokens_details.expect("prompt details");
        assert_eq!(prompt.text_tokens, Some(150));
        assert_eq!(prompt.cached_tokens, Some(40));
        assert_eq!(
            usage.completion_tokens_details.and_then(|c| c.reasoning_tokens),
            Some(20)
        );
        let provider = usage.provider_usage_details.expect("provider details");
        assert_eq!(provider["trafficType"], "ON_DEMAND");
        assert!(!provider.contains_key("toolUsePromptTokenCount"));
    }

    #[test]
    fn decodes_error_objects() {
        let d = decode(json!({
            "error": {"code": 429, "message": "quota", "status": "RESOURCE_EXHAUSTED"}
        }));
        let err = d.error.expect("error");
        assert_eq!(err.code.as_deref(), Some("rate_limit"));
        assert_eq!(err.message, "quota");
    }

    #[test]
    fn null_counts_keep_the_rest_of_the_chunk() {
        let d = decode(json!({
            "candidates": [{"content": {"parts": [{"text": "done"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": null, "candidatesTokenCount": 3}
        }));
        assert_eq!(d.content.as_deref(), Some("done"));
        assert_eq!(d.finish, Some(FinishReason::Stop));
        assert_eq!(d.usage.map(|u| u.total_tokens), Some(3));
    }
}
