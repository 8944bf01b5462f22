//! Reassembly of streamed tool/function-call arguments.
//!
//! Structured output sometimes arrives as a tool call whose argument text is
//! spread across many frames. Supported wire shapes:
//!
//! - Chat Completions `choices[].delta.tool_calls[]` (incremental, keyed by `index`/`id`)
//! - Responses API `response.output_item.added`,
//!   `response.function_call_arguments.delta` / `.done` (keyed by `output_index`/`item_id`)
//! - Gemini `candidates[].content.parts[].functionCall` (full args every time)
//! - A final `message.tool_calls[]` / `choices[].message.tool_calls[]` snapshot
//!
//! Incremental deltas append to a slot's arguments; snapshots replace them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A reassembled call, in first-appearance order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledToolCall {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgumentMode {
    Append,
    Replace,
}

#[derive(Debug)]
struct CallDelta<'a> {
    index: Option<usize>,
    id: Option<&'a str>,
    name: Option<&'a str>,
    arguments: Option<String>,
    mode: ArgumentMode,
}

/// Accumulates tool-call slots across frames
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    slots: Vec<AssembledToolCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded frame payload
    pub fn push_frame(&mut self, payload: &Value) {
        if let Some(choices) = payload["choices"].as_array() {
            for choice in choices {
                if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
                    for call in calls {
                        self.apply(chat_delta(call, None, ArgumentMode::Append));
                    }
                }
                if let Some(calls) = choice["message"]["tool_calls"].as_array() {
                    for (position, call) in calls.iter().enumerate() {
                        self.apply(chat_delta(call, Some(position), ArgumentMode::Replace));
                    }
                }
            }
        }

        if let Some(calls) = payload["message"]["tool_calls"].as_array() {
            for (position, call) in calls.iter().enumerate() {
                self.apply(chat_delta(call, Some(position), ArgumentMode::Replace));
            }
        }

        if let Some(kind) = payload["type"].as_str() {
            self.push_responses_event(kind, payload);
        }

        if let Some(candidates) = payload["candidates"].as_array() {
            let mut position = 0;
            for candidate in candidates {
                let Some(parts) = candidate["content"]["parts"].as_array() else {
                    continue;
                };
                for part in parts {
                    let call = &part["functionCall"];
                    if !call.is_object() {
                        continue;
                    }
                    self.apply(CallDelta {
                        index: Some(position),
                        id: call["id"].as_str(),
                        name: call["name"].as_str(),
                        arguments: arguments_text(&call["args"]),
                        mode: ArgumentMode::Replace,
                    });
                    position += 1;
                }
            }
        }
    }

    fn push_responses_event(&mut self, kind: &str, payload: &Value) {
        let index = payload["output_index"].as_u64().map(|i| i as usize);
        match kind {
            "response.output_item.added" | "response.output_item.done" => {
                let item = &payload["item"];
                if item["type"].as_str() != Some("function_call") {
                    return;
                }
                self.apply(CallDelta {
                    index,
                    id: item["id"].as_str(),
                    name: item["name"].as_str(),
                    arguments: arguments_text(&item["arguments"]),
                    mode: ArgumentMode::Replace,
                });
            }
            "response.function_call_arguments.delta" => {
                self.apply(CallDelta {
                    index,
                    id: payload["item_id"].as_str(),
                    name: None,
                    arguments: payload["delta"].as_str().map(str::to_string),
                    mode: ArgumentMode::Append,
                });
            }
            "response.function_call_arguments.done" => {
                self.apply(CallDelta {
                    index,
                    id: payload["item_id"].as_str(),
                    name: None,
                    arguments: arguments_text(&payload["arguments"]),
                    mode: ArgumentMode::Replace,
                });
            }
            _ => {}
        }
    }

    fn apply(&mut self, delta: CallDelta<'_>) {
        let slot = self.resolve_slot(delta.index, delta.id);
        let call = &mut self.slots[slot];

        if call.name.is_none() {
            if let Some(name) = delta.name.filter(|n| !n.is_empty()) {
                call.name = Some(name.to_string());
            }
        }

        if let Some(arguments) = delta.arguments {
            match delta.mode {
                ArgumentMode::Append => call.arguments.push_str(&arguments),
                ArgumentMode::Replace => call.arguments = arguments,
            }
        }
    }

    /// Bind by id first, then by index, else open a new slot
    fn resolve_slot(&mut self, index: Option<usize>, id: Option<&str>) -> usize {
        if let Some(id) = id {
            if let Some(pos) = self.slots.iter().position(|s| s.id.as_deref() == Some(id)) {
                return pos;
            }
        }

        if let Some(index) = index {
            if let Some(pos) = self.slots.iter().position(|s| s.index == index) {
                let slot = &mut self.slots[pos];
                match (&slot.id, id) {
                    (None, Some(id)) => {
                        slot.id = Some(id.to_string());
                        return pos;
                    }
                    (Some(_), Some(_)) => {}
                    _ => return pos,
                }
            }
        }

        self.slots.push(AssembledToolCall {
            index: index.unwrap_or(self.slots.len()),
            id: id.map(str::to_string),
            name: None,
            arguments: String::new(),
        });
        self.slots.len() - 1
    }

    pub fn calls(&self) -> &[AssembledToolCall] {
        &self.slots
    }

    pub fn finish(self) -> Vec<AssembledToolCall> {
        self.slots
    }
}

fn chat_delta(call: &Value, position: Option<usize>, mode: ArgumentMode) -> CallDelta<'_> {
    CallDelta {
        index: call["index"]
            .as_u64()
            .map(|i| i as usize)
            .or(position),
        id: call["id"].as_str().filter(|id| !id.is_empty()),
        name: call["function"]["name"].as_str(),
        arguments: arguments_text(&call["function"]["arguments"]),
        mode,
    }
}

/// Arguments arrive either as text or as an already-parsed object
fn arguments_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Assemble every call found in a sequence of frame payloads
pub fn assemble_tool_calls<'a, I>(payloads: I) -> Vec<AssembledToolCall>
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut assembler = ToolCallAssembler::new();
    for payload in payloads {
        assembler.push_frame(payload);
    }
    assembler.finish()
}
