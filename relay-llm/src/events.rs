//! Canonical event vocabulary.
//!
//! Serialized as one JSON object per event with a `type` tag and camelCase
//! fields, ready to be relayed verbatim as SSE `data:` frames.

use crate::error::ErrorDescriptor;
use crate::types::{ChatResponse, CollectedToolCall, Role};
use crate::usage::UsageRecord;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub type EventStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum CanonicalEvent {
    RunStarted {
        run_id: String,
        model: String,
        timestamp: i64,
    },
    TextMessageStart {
        message_id: String,
        model: String,
        timestamp: i64,
        role: Role,
    },
    TextMessageContent {
        message_id: String,
        model: String,
        timestamp: i64,
        delta: String,
        content: String,
    },
    TextMessageEnd {
        message_id: String,
        model: String,
        timestamp: i64,
    },
    #[serde(rename = "STEP_STARTED")]
    ReasoningStepStarted {
        step_id: String,
        model: String,
        timestamp: i64,
        step_type: StepType,
    },
    #[serde(rename = "STEP_FINISHED")]
    ReasoningStepContent {
        step_id: String,
        model: String,
        timestamp: i64,
        delta: String,
        content: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
        model: String,
        timestamp: i64,
        index: u32,
    },
    ToolCallArgs {
        tool_call_id: String,
        model: String,
        timestamp: i64,
        delta: String,
    },
    ToolCallEnd {
        tool_call_id: String,
        tool_name: String,
        model: String,
        timestamp: i64,
        input: serde_json::Value,
    },
    RunFinished {
        run_id: String,
        model: String,
        timestamp: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageRecord>,
        finish_reason: FinishReason,
    },
    RunError {
        run_id: String,
        model: String,
        timestamp: i64,
        error: ErrorDescriptor,
    },
}

impl CanonicalEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RUN_STARTED",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ReasoningStepStarted { .. } => "STEP_STARTED",
            Self::ReasoningStepContent { .. } => "STEP_FINISHED",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
        }
    }
}

/// Drains a canonical stream into a single [`ChatResponse`].
pub async fn collect_response<S>(stream: S) -> ChatResponse
where
    S: Stream<Item = CanonicalEvent>,
{
    let mut stream = std::pin::pin!(stream);
    let mut out = ChatResponse::default();
    while let Some(event) = stream.next().await {
        match event {
            CanonicalEvent::TextMessageContent { content, .. } => out.text = content,
            CanonicalEvent::ReasoningStepContent { content, .. } => out.reasoning = content,
            CanonicalEvent::ToolCallEnd {
                tool_call_id,
                tool_name,
                input,
                ..
            } => out.tool_calls.push(CollectedToolCall {
                id: tool_call_id,
                name: tool_name,
                input,
            }),
            CanonicalEvent::RunFinished {
                usage,
                finish_reason,
                ..
            } => {
                out.usage = usage;
                out.finish_reason = Some(finish_reason);
                break;
            }
            CanonicalEvent::RunError { error, .. } => {
                out.error = Some(error);
                break;
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_finished_without_usage_has_no_usage_key() {
        let event = CanonicalEvent::RunFinished {
            run_id: "run_1".to_string(),
            model: "gpt-4o".to_string(),
            timestamp: 1,
            usage: None,
            finish_reason: FinishReason::Stop,
        };
        let value = serde_json::to_value(&event).expect("serializes");
        assert_eq!(
            value,
            json!({
                "type": "RUN_FINISHED",
                "runId": "run_1",
                "model": "gpt-4o",
                "timestamp": 1,
                "finishReason": "stop"
            })
        );
        assert!(value.get("usage").is_none());
    }

    #[test]
    fn reasoning_events_use_step_tags() {
        let event = CanonicalEvent::ReasoningStepStarted {
            step_id: "step_1".to_string(),
            model: "m".to_string(),
            timestamp: 0,
            step_type: StepType::Thinking,
        };
        let value = serde_json::to_value(&event).expect("serializes");
        assert_eq!(value["type"], "STEP_STARTED");
        assert_eq!(value["stepType"], "thinking");
        assert_eq!(value["stepId"], "step_1");

        let parsed: CanonicalEvent = serde_json::from_value(json!({
            "type": "TOOL_CALL_START",
            "toolCallId": "t1",
            "toolName": "get_weather",
            "model": "m",
            "timestamp": 5,
            "index": 0
        }))
        .expect("parses");
        assert_eq!(parsed.kind(), "TOOL_CALL_START");
    }

    #[tokio::test]
    async fn collect_response_folds_events() {
        let events = vec![
            CanonicalEvent::RunStarted {
                run_id: "r".to_string(),
                model: "m".to_string(),
                timestamp: 0,
            },
            CanonicalEvent::TextMessageContent {
                message_id: "msg".to_string(),
                model: "m".to_string(),
                timestamp: 0,
                delta: "Hel".to_string(),
                content: "Hel".to_string(),
            },
            CanonicalEvent::TextMessageContent {
                message_id: "msg".to_string(),
                model: "m".to_string(),
                timestamp: 0,
                delta: "lo".to_string(),
                content: "Hello".to_string(),
            },
            CanonicalEvent::ToolCallEnd {
                tool_call_id: "t1".to_string(),
                tool_name: "lookup".to_string(),
                model: "m".to_string(),
                timestamp: 0,
                input: json!({"q": 1}),
            },
            CanonicalEvent::RunFinished {
                run_id: "r".to_string(),
                model: "m".to_string(),
                timestamp: 0,
                usage: Some(UsageRecord::new(3, 4, None)),
                finish_reason: FinishReason::ToolCalls,
            },
        ];

        let response = collect_response(futures_util::stream::iter(events)).await;
        assert_eq!(response.text, "Hello");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "lookup");
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(7));
        assert_eq!(response.error, None);
    }
}
