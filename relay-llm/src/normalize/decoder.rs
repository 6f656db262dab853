use crate::error::{ErrorDescriptor, Result};
use crate::events::FinishReason;
use crate::usage::UsageRecord;
use futures_util::Stream;
use std::pin::Pin;

/// One framed unit from an upstream: an SSE event or an NDJSON line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    /// SSE `event:` name, if the frame had one.
    pub event: Option<String>,
    pub data: String,
}

impl RawChunk {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<RawChunk>> + Send>>;

/// Streamed tool-call fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Tool call delivered whole in one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteToolCall {
    pub id: Option<String>,
    pub name: String,
    pub input: serde_json::Value,
}

/// Stream completed, but with a non-success terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFailure {
    pub reason: String,
    pub errors: Vec<String>,
}

/// Typed, provider-independent reading of one raw chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkDelta {
    pub reasoning: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub complete_tool_calls: Vec<CompleteToolCall>,
    pub finish: Option<FinishReason>,
    pub usage: Option<UsageRecord>,
    pub error: Option<ErrorDescriptor>,
    pub result_failure: Option<ResultFailure>,
    pub done: bool,
}

impl ChunkDelta {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    pub fn error(error: ErrorDescriptor) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Provider-specific reading of raw chunks. One instance per run.
///
/// Must not panic: unparseable or unknown chunks decode to an empty delta.
pub trait ChunkDecoder: Send {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta;
}

impl<T: ChunkDecoder + ?Sized> ChunkDecoder for Box<T> {
    fn decode(&mut self, chunk: &RawChunk) -> ChunkDelta {
        (**self).decode(chunk)
    }
}

/// Maps a provider's native stop reason onto a canonical one.
///
/// Returns `None` for values that do not signal the end of generation.
pub fn map_stop_reason(reason: &str) -> Option<FinishReason> {
    match reason.trim().to_ascii_lowercase().as_str() {
        "" | "null" | "finish_reason_unspecified" => None,
        "length"
        | "max_tokens"
        | "max_output_tokens"
        | "model_length"
        | "model_context_window_exceeded" => {
            Some(FinishReason::Length)
        }
        "tool_calls" | "tool_use" | "function_call" => Some(FinishReason::ToolCalls),
        _ => Some(FinishReason::Stop),
    }
}
