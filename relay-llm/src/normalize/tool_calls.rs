use super::decoder::{CompleteToolCall, ToolCallDelta};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub index: u32,
    pub started: bool,
}

/// What the reconstructor asks the sequencer to emit.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallEmission {
    Start { id: String, name: String, index: u32 },
    Args { id: String, delta: String },
    End { id: String, name: String, input: Value },
}

/// Reassembles fragmented tool calls, keyed by index.
#[derive(Debug, Default)]
pub struct ToolCallReconstructor {
    buffers: BTreeMap<u32, ToolCallBuffer>,
    seen: u32,
}

impl ToolCallReconstructor {
    /// True once any tool call has been started this run.
    pub fn has_seen_calls(&self) -> bool {
        self.seen > 0
    }

    pub fn apply(&mut self, fragment: &ToolCallDelta, out: &mut Vec<ToolCallEmission>) {
        let arguments = fragment.arguments.as_deref().unwrap_or("");
        let buffer = match self.buffers.get_mut(&fragment.index) {
            Some(buffer) => {
                if let Some(name) = fragment.name.as_deref().filter(|n| !n.is_empty()) {
                    buffer.name = name.to_string();
                }
                if buffer.started {
                    if !arguments.is_empty() {
                        buffer.arguments.push_str(arguments);
                        out.push(ToolCallEmission::Args {
                            id: buffer.id.clone(),
                            delta: arguments.to_string(),
                        });
                    }
                    return;
                }
                buffer.arguments.push_str(arguments);
                buffer
            }
            None => {
                let Some(id) = fragment.id.as_deref().filter(|id| !id.is_empty()) else {
                    tracing::debug!(
                        index = fragment.index,
                        "ignoring tool call fragment without id"
                    );
                    return;
                };
                self.buffers.entry(fragment.index).or_insert(ToolCallBuffer {
                    id: id.to_string(),
                    name: fragment.name.clone().unwrap_or_default(),
                    arguments: arguments.to_string(),
                    index: fragment.index,
                    started: false,
                })
            }
        };

        if buffer.name.is_empty() {
            return;
        }
        buffer.started = true;
        self.seen += 1;
        out.push(ToolCallEmission::Start {
            id: buffer.id.clone(),
            name: buffer.name.clone(),
            index: buffer.index,
        });
        if !buffer.arguments.is_empty() {
            out.push(ToolCallEmission::Args {
                id: buffer.id.clone(),
                delta: buffer.arguments.clone(),
            });
        }
    }

    /// Start, args and end for a call that arrived whole. `id` is already resolved.
    pub fn complete(
        &mut self,
        call: CompleteToolCall,
        id: String,
        out: &mut Vec<ToolCallEmission>,
    ) {
        let index = self.next_index();
        self.seen += 1;
        let input = match call.input {
            Value::Object(map) => Value::Object(map),
            Value::String(raw) => parse_tool_input(&raw),
            Value::Null => Value::Object(Map::new()),
            other => {
                tracing::warn!(tool = %call.name, kind = ?other, "tool input is not an object");
                Value::Object(Map::new())
            }
        };
        out.push(ToolCallEmission::Start {
            id: id.clone(),
            name: call.name.clone(),
            index,
        });
        out.push(ToolCallEmission::Args {
            id: id.clone(),
            delta: input.to_string(),
        });
        out.push(ToolCallEmission::End {
            id,
            name: call.name,
            input,
        });
    }

    /// Closes every started call in index order and clears all buffers.
    pub fn finish(&mut self, out: &mut Vec<ToolCallEmission>) {
        for (_, buffer) in std::mem::take(&mut self.buffers) {
            if !buffer.started {
                tracing::warn!(
                    id = %buffer.id,
                    index = buffer.index,
                    "dropping tool call that never received a name"
                );
                continue;
            }
            let input = parse_tool_input(&buffer.arguments);
            out.push(ToolCallEmission::End {
                id: buffer.id,
                name: buffer.name,
                input,
            });
        }
    }

    fn next_index(&self) -> u32 {
        self.buffers
            .keys()
            .next_back()
            .map(|i| i + 1)
            .unwrap_or(0)
            .max(self.seen)
    }
}

/// Parses accumulated argument text. Anything that is not a JSON object becomes `{}`.
pub fn parse_tool_input(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(other) => {
            tracing::warn!(kind = ?other, "tool arguments are not a JSON object");
            Value::Object(Map::new())
        }
        Err(e) => {
            tracing::warn!(%e, "tool arguments are not valid JSON");
            Value::Object(Map::new())
        }
    }
}
