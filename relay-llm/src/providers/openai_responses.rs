//! OpenAI Responses API (`/v1/responses`), typed SSE events.

use crate::client::ClientConfig;
use crate::error::{ErrorDescriptor, Result};
use crate::events::FinishReason;
use crate::normalize::{ChunkDecoder, ChunkDelta, RawChunk, ResultFailure, ToolCallDelta};
use crate::types::{ChatRequest, Role};
use crate::usage::{TokenDetails, UsageRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) fn request_builder(
    http: &reqwest::Client,
    config: &ClientConfig,
    request: &ChatRequest,
) -> Result<reqwest::RequestBuilder> {
    let url = format!("{}/responses", config.base_url().trim_end_matches('/'));
    Ok(http
        .post(url)
        .bearer_auth(config.require_api_key()?)
        .json(&ResponsesRequest::new(request)))
}

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<ResponsesInputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ResponsesTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ResponsesInputItem {
    Message {
        role: String,
        content: String,
    },
    FunctionCall {
        r#type: &'static str,
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        r#type: &'static str,
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize)]
struct ResponsesTool {
    r#type: &'static str,
    name: String,
    description: String,
    parameters: Value,
}

impl ResponsesRequest {
    fn new(request: &ChatRequest) -> Self {
        let mut input = Vec::new();
        for m in request.conversation() {
            match m.role {
                Role::Tool => input.push(ResponsesInputItem::FunctionCallOutput {
                    r#type: "function_call_output",
                    call_id: m.tool_call_id.clone().unwrap_or_default(),
                    output: m.content.clone(),
                }),
                role => {
                    if !m.content.is_empty() {
                        input.push(ResponsesInputItem::Message {
                            role: role.as_str().to_string(),
                            content: m.content.clone(),
                        });
                    }
                    input.extend(m.tool_calls.iter().map(|tc| ResponsesInputItem::FunctionCall {
                        r#type: "function_call",
                        call_id: tc.id.clone(),
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    }));
                }
            }
        }

        Self {
            model: request.model.clone(),
            input,
            instructions: request.system_prompt(),
            tools: request
                .tools
                .iter()
                .map(|t| ResponsesTool {
                    r#type: "function",
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
            stream: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponsesEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.reasoning_text.delta")]
    ReasoningTextDelta { delta: String },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta { delta: String },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        output_index: u32,
        item: ResponsesOutputItem,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { output_index: u32, delta: String },
    #[serde(rename = "response.completed")]
    Completed { response: ResponsesBody },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponsesBody },
    #[serde(rename = "response.failed")]
    Failed { response: ResponsesBody },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    usage: Option<ResponsesUsage>,
    #[serde(default)]
    incomplete_details: Option<ResponsesIncompleteDetails>,
    #[serde(default)]
    error: Option<ResponsesError>,
}

#[derive(Debug, Deserialize)]
struct ResponsesIncompleteDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default)]
    input_tokens_details: Option<ResponsesInputTokensDetails>,
    #[serde(default)]
    output_tokens_details: Option<ResponsesOutputTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct ResponsesInputTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponsesOutputTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

fn to_usage(u: ResponsesUsage) -> UsageRecord {
    UsageRecord::new(
        u.input_tokens.unwrap_or(0),
        u.output_tokens.unwrap_or(0),
        u.total_tokens,
    )
        .with_prompt_details(u.input_tokens_details.map(|d| TokenDetails {
            cached_tokens: d.cached_tokens.filter(|n| *n > 0),
            ..TokenDetails::default()
        }))
        .with_completion_details(u.output_tokens_details.map(|d| TokenDetails {
            reasoning_tokens: d.reasoning_tokens.filter(|n| *n > 0),
            ..TokenDetails::default()
        }))
}

#[derive(Debug, Default)]
pub struct OpenAiResponsesDecoder;

impl ChunkDecoder for OpenAiResponsesDecoder {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        let event: ResponsesEvent = match serde_json::from_str(&chunk.data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(%e, event = ?chunk.event, "skipping unparseable responses event");
                return ChunkDelta::default();
            }
        };

        match event {
            ResponsesEvent::OutputTextDelta { delta } => ChunkDelta::content(delta),
            ResponsesEvent::ReasoningTextDelta { delta }
            | ResponsesEvent::ReasoningSummaryTextDelta { delta } => ChunkDelta::reasoning(delta),
            ResponsesEvent::OutputItemAdded { output_index, item }
                if item.kind == "function_call" =>
            {
                ChunkDelta {
                    tool_calls: vec![ToolCallDelta {
                        index: output_index,
                        id: item.call_id.or(item.id),
                        name: item.name,
                        arguments: None,
                    }],
                    ..ChunkDelta::default()
                }
            }
            ResponsesEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
            } => ChunkDelta {
                tool_calls: vec![ToolCallDelta {
                    index: output_index,
                    arguments: Some(delta),
                    ..ToolCallDelta::default()
                }],
                ..ChunkDelta::default()
            },
            ResponsesEvent::Completed { response } => ChunkDelta {
                usage: response.usage.map(to_usage),
                finish: Some(FinishReason::Stop),
                done: true,
                ..ChunkDelta::default()
            },
            ResponsesEvent::Incomplete { response } => {
                let reason = response
                    .incomplete_details
                    .and_then(|d| d.reason)
                    .unwrap_or_else(|| "incomplete".to_string());
                let usage = response.usage.map(to_usage);
                if reason == "max_output_tokens" {
                    ChunkDelta {
                        usage,
                        finish: Some(FinishReason::Length),
                        done: true,
                        ..ChunkDelta::default()
                    }
                } else {
                    ChunkDelta {
                        usage,
                        result_failure: Some(ResultFailure {
                            reason,
                            errors: Vec::new(),
                        }),
                        ..ChunkDelta::default()
                    }
                }
            }
            ResponsesEvent::Failed { response } => {
                let (code, message) = response
                    .error
                    .map(|e| (e.code, e.message))
                    .unwrap_or_default();
                ChunkDelta::error(ErrorDescriptor::classify(
                    message.unwrap_or_default(),
                    code.as_deref(),
                    None,
                ))
            }
            ResponsesEvent::Error { code, message } => ChunkDelta::error(
                ErrorDescriptor::classify(message.unwrap_or_default(), code.as_deref(), None),
            ),
            ResponsesEvent::OutputItemAdded { .. } | ResponsesEvent::Other => ChunkDelta::default(),
        }
    }
}
