//! Streaming LLM response normalization.
//!
//! Every supported provider streams in its own shape. This crate turns each
//! of them into one canonical event sequence: a single `RUN_STARTED`, text and
//! reasoning deltas with running accumulations, reassembled tool calls, and
//! exactly one terminal `RUN_FINISHED` or `RUN_ERROR`.

mod client;
mod error;
mod events;
mod eventstream;
mod ids;
mod ndjson;
pub mod normalize;
pub mod providers;
mod sse;
mod types;
mod usage;

pub use client::{
    ClientConfig, Framing, HttpSource, LlmClient, Provider, UpstreamSource,
    validate_tool_name_all_providers,
};
pub use error::{ErrorDescriptor, LlmError, Result, map_error_code, parse_error_body};
pub use events::{CanonicalEvent, EventStream, FinishReason, StepType, collect_response};
pub use eventstream::decode_event_stream;
pub use ids::{IdGenerator, SequentialIds, UuidIds};
pub use ndjson::decode_ndjson;
pub use normalize::{
    ChunkDecoder, ChunkDelta, ChunkStream, RawChunk, RunContext, failed_run, normalize,
};
pub use sse::decode_sse;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, CollectedToolCall, Role, ToolCall, ToolDefinition,
};
pub use usage::{ModalityTokenCount, TokenDetails, UsageRecord, flatten_modality_token_counts};
pub use tokio_util::sync::CancellationToken;
