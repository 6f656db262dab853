use super::accumulator::DeltaAccumulator;
use super::decoder::ChunkDelta;
use super::tool_calls::{ToolCallEmission, ToolCallReconstructor};
use crate::error::ErrorDescriptor;
use crate::events::{CanonicalEvent, FinishReason, StepType};
use crate::ids::IdGenerator;
use crate::types::Role;
use crate::usage::UsageRecord;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Running,
    /// A finish signal arrived; waiting for `done` or the end of the upstream.
    Finishing,
    Finished,
    Errored,
}

/// Everything one run owns. Created per call, dropped at the terminal event.
pub struct RunState {
    model: String,
    provider: String,
    ids: Arc<dyn IdGenerator>,
    phase: RunPhase,
    run_id: String,
    message_id: Option<String>,
    step_id: Option<String>,
    text_ended: bool,
    accumulator: DeltaAccumulator,
    tools: ToolCallReconstructor,
    provider_finish: Option<FinishReason>,
    usage: Option<UsageRecord>,
}

impl RunState {
    pub fn new(
        model: impl Into<String>,
        provider: impl Into<String>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let run_id = ids.generate("run");
        Self {
            model: model.into(),
            provider: provider.into(),
            ids,
            phase: RunPhase::NotStarted,
            run_id,
            message_id: None,
            step_id: None,
            text_ended: false,
            accumulator: DeltaAccumulator::default(),
            tools: ToolCallReconstructor::default(),
            provider_finish: None,
            usage: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RunPhase::Finished | RunPhase::Errored)
    }

    /// Applies one decoded chunk. Reasoning is handled before content.
    pub fn process(&mut self, delta: ChunkDelta, out: &mut VecDeque<CanonicalEvent>) {
        if self.is_terminal() {
            return;
        }
        self.ensure_started(out);

        if self.phase == RunPhase::Running {
            if let Some(reasoning) = delta.reasoning.as_deref().filter(|s| !s.is_empty()) {
                self.push_reasoning(reasoning, out);
            }
            if let Some(content) = delta.content.as_deref().filter(|s| !s.is_empty()) {
                self.push_content(content, out);
            }

            let mut emissions = Vec::new();
            for fragment in &delta.tool_calls {
                self.tools.apply(fragment, &mut emissions);
            }
            for call in delta.complete_tool_calls {
                let id = call
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| self.ids.generate("call"));
                self.tools.complete(call, id, &mut emissions);
            }
            self.emit_tool_calls(emissions, out);
        } else if delta.reasoning.is_some()
            || delta.content.is_some()
            || !delta.tool_calls.is_empty()
        {
            tracing::debug!(run_id = %self.run_id, "ignoring output after finish signal");
        }

        if let Some(error) = delta.error {
            self.fail(error, out);
            return;
        }
        if let Some(failure) = delta.result_failure {
            self.fail(
                ErrorDescriptor::result_failure(&failure.reason, &failure.errors),
                out,
            );
            return;
        }
        if let Some(usage) = delta.usage {
            self.usage = Some(usage);
        }
        if let Some(reason) = delta.finish {
            self.begin_finish(Some(reason), out);
        }
        if delta.done {
            self.complete(out);
        }
    }

    /// The upstream ran out. Finishes the run if nothing terminal happened yet.
    pub fn upstream_ended(&mut self, out: &mut VecDeque<CanonicalEvent>) {
        if self.is_terminal() {
            return;
        }
        self.ensure_started(out);
        if self.phase == RunPhase::Running {
            tracing::debug!(run_id = %self.run_id, "upstream ended without a finish signal");
        }
        self.complete(out);
    }

    /// Terminates the run with a `RUN_ERROR`.
    pub fn fail(&mut self, error: ErrorDescriptor, out: &mut VecDeque<CanonicalEvent>) {
        if self.is_terminal() {
            return;
        }
        self.ensure_started(out);
        tracing::info!(
            run_id = %self.run_id,
            provider = %self.provider,
            model = %self.model,
            code = error.code.as_deref().unwrap_or(""),
            message = %error.message,
            "run failed"
        );
        self.phase = RunPhase::Errored;
        out.push_back(CanonicalEvent::RunError {
            run_id: self.run_id.clone(),
            model: self.model.clone(),
            timestamp: now_millis(),
            error,
        });
    }

    fn ensure_started(&mut self, out: &mut VecDeque<CanonicalEvent>) {
        if self.phase != RunPhase::NotStarted {
            return;
        }
        self.phase = RunPhase::Running;
        tracing::info!(
            run_id = %self.run_id,
            provider = %self.provider,
            model = %self.model,
            "run started"
        );
        out.push_back(CanonicalEvent::RunStarted {
            run_id: self.run_id.clone(),
            model: self.model.clone(),
            timestamp: now_millis(),
        });
    }

    fn push_reasoning(&mut self, delta: &str, out: &mut VecDeque<CanonicalEvent>) {
        let step_id = match &self.step_id {
            Some(id) => id.clone(),
            None => {
                let id = self.ids.generate("step");
                self.step_id = Some(id.clone());
                out.push_back(CanonicalEvent::ReasoningStepStarted {
                    step_id: id.clone(),
                    model: self.model.clone(),
                    timestamp: now_millis(),
                    step_type: StepType::Thinking,
                });
                id
            }
        };
        let content = self.accumulator.push_reasoning(delta).to_string();
        out.push_back(CanonicalEvent::ReasoningStepContent {
            step_id,
            model: self.model.clone(),
            timestamp: now_millis(),
            delta: delta.to_string(),
            content,
        });
    }

    fn push_content(&mut self, delta: &str, out: &mut VecDeque<CanonicalEvent>) {
        let message_id = match &self.message_id {
            Some(id) => id.clone(),
            None => {
                let id = self.ids.generate("msg");
                self.message_id = Some(id.clone());
                out.push_back(CanonicalEvent::TextMessageStart {
                    message_id: id.clone(),
                    model: self.model.clone(),
                    timestamp: now_millis(),
                    role: Role::Assistant,
                });
                id
            }
        };
        let content = self.accumulator.push_content(delta).to_string();
        out.push_back(CanonicalEvent::TextMessageContent {
            message_id,
            model: self.model.clone(),
            timestamp: now_millis(),
            delta: delta.to_string(),
            content,
        });
    }

    fn emit_tool_calls(
        &self,
        emissions: Vec<ToolCallEmission>,
        out: &mut VecDeque<CanonicalEvent>,
    ) {
        for emission in emissions {
            let timestamp = now_millis();
            let model = self.model.clone();
            out.push_back(match emission {
                ToolCallEmission::Start { id, name, index } => CanonicalEvent::ToolCallStart {
                    tool_call_id: id,
                    tool_name: name,
                    model,
                    timestamp,
                    index,
                },
                ToolCallEmission::Args { id, delta } => CanonicalEvent::ToolCallArgs {
                    tool_call_id: id,
                    model,
                    timestamp,
                    delta,
                },
                ToolCallEmission::End { id, name, input } => CanonicalEvent::ToolCallEnd {
                    tool_call_id: id,
                    tool_name: name,
                    model,
                    timestamp,
                    input,
                },
            });
        }
    }

    /// Closes tool calls and the text message. Idempotent.
    fn begin_finish(&mut self, reason: Option<FinishReason>, out: &mut VecDeque<CanonicalEvent>) {
        if self.phase != RunPhase::Running {
            return;
        }
        self.provider_finish = reason;

        let mut emissions = Vec::new();
        self.tools.finish(&mut emissions);
        self.emit_tool_calls(emissions, out);

        if let Some(message_id) = self.message_id.clone().filter(|_| !self.text_ended) {
            self.text_ended = true;
            out.push_back(CanonicalEvent::TextMessageEnd {
                message_id,
                model: self.model.clone(),
                timestamp: now_millis(),
            });
        }
        self.phase = RunPhase::Finishing;
    }

    fn complete(&mut self, out: &mut VecDeque<CanonicalEvent>) {
        self.begin_finish(None, out);
        let finish_reason = self.resolve_finish_reason();
        tracing::info!(
            run_id = %self.run_id,
            provider = %self.provider,
            model = %self.model,
            finish_reason = finish_reason.as_str(),
            text_len = self.accumulator.content().len(),
            reasoning_len = self.accumulator.reasoning().len(),
            "run finished"
        );
        self.phase = RunPhase::Finished;
        out.push_back(CanonicalEvent::RunFinished {
            run_id: self.run_id.clone(),
            model: self.model.clone(),
            timestamp: now_millis(),
            usage: self.usage.take(),
            finish_reason,
        });
    }

    fn resolve_finish_reason(&self) -> FinishReason {
        match self.provider_finish {
            Some(FinishReason::Length) => FinishReason::Length,
            Some(FinishReason::ToolCalls) => FinishReason::ToolCalls,
            _ if self.tools.has_seen_calls() => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
