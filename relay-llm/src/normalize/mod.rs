//! Streaming normalization core.
//!
//! [`normalize`] turns a provider's raw chunk stream into the canonical event
//! stream. It is pull-based: the upstream is polled only when the consumer
//! asks for an event and nothing is queued. Events produced by one chunk are
//! queued and drained in order. Cancellation is checked before every pull and
//! raced against the pull itself; queued events are drained first.

mod accumulator;
mod decoder;
mod sequencer;
mod tool_calls;

pub use accumulator::DeltaAccumulator;
pub use decoder::{
    ChunkDecoder, ChunkDelta, ChunkStream, CompleteToolCall, RawChunk, ResultFailure,
    ToolCallDelta, map_stop_reason,
};
pub use sequencer::{RunPhase, RunState};
pub use tool_calls::{ToolCallBuffer, ToolCallEmission, ToolCallReconstructor, parse_tool_input};

use crate::error::ErrorDescriptor;
use crate::events::{CanonicalEvent, EventStream};
use crate::ids::IdGenerator;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-run inputs that are not part of the upstream.
#[derive(Clone)]
pub struct RunContext {
    pub model: String,
    /// Provider label, for logs.
    pub provider: String,
    pub ids: Arc<dyn IdGenerator>,
}

struct Driver {
    upstream: Option<ChunkStream>,
    decoder: Box<dyn ChunkDecoder>,
    run: RunState,
    queue: VecDeque<CanonicalEvent>,
    cancel: CancellationToken,
}

impl Driver {
    fn abort(&mut self) {
        // Dropping the upstream drops the HTTP response body.
        self.upstream = None;
        tracing::debug!(run_id = %self.run.run_id(), "run cancelled");
        self.run.fail(ErrorDescriptor::aborted(), &mut self.queue);
    }

    async fn next_event(&mut self) -> Option<CanonicalEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.run.is_terminal() {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.abort();
                continue;
            }
            let Some(upstream) = self.upstream.as_mut() else {
                self.run.upstream_ended(&mut self.queue);
                continue;
            };

            let cancel = self.cancel.clone();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = upstream.next() => Some(next),
            };

            match next {
                None => self.abort(),
                Some(Some(Ok(chunk))) => {
                    let delta = self.decoder.decode(&chunk);
                    if delta.is_empty() {
                        tracing::trace!(event = ?chunk.event, "chunk decoded to nothing");
                    }
                    self.run.process(delta, &mut self.queue);
                }
                Some(Some(Err(e))) => {
                    self.upstream = None;
                    tracing::warn!(error = %e, "upstream stream failed");
                    self.run.fail(e.descriptor(), &mut self.queue);
                }
                Some(None) => {
                    self.upstream = None;
                    self.run.upstream_ended(&mut self.queue);
                }
            }
        }
    }
}

/// Normalizes one run.
///
/// The returned stream always begins with `RUN_STARTED` and ends with exactly
/// one of `RUN_FINISHED` / `RUN_ERROR`. It never yields errors.
pub fn normalize<D>(
    upstream: ChunkStream,
    decoder: D,
    ctx: RunContext,
    cancel: CancellationToken,
) -> EventStream
where
    D: ChunkDecoder + 'static,
{
    let driver = Driver {
        upstream: Some(upstream),
        decoder: Box::new(decoder),
        run: RunState::new(ctx.model, ctx.provider, ctx.ids),
        queue: VecDeque::new(),
        cancel,
    };
    Box::pin(futures_util::stream::unfold(driver, |mut driver| async move {
        let event = driver.next_event().await?;
        Some((event, driver))
    }))
}

/// A run that failed before any chunk arrived: `RUN_STARTED`, `RUN_ERROR`.
pub fn failed_run(ctx: RunContext, error: ErrorDescriptor) -> EventStream {
    let mut run = RunState::new(ctx.model, ctx.provider, ctx.ids);
    let mut queue = VecDeque::new();
    run.fail(error, &mut queue);
    Box::pin(futures_util::stream::iter(queue))
}
