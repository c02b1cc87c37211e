//! The model tool-call loop for one chat turn.
//!
//! Repeatedly calls the model with the session's tool definitions,
//! executes every requested tool through the session bridge, feeds the
//! results back, and stops when the model stops requesting tools. Tool
//! execution failures are reported back to the model as error results and
//! recorded; they never abort the turn.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::bridge::{BridgeError, ToolBridge};
use crate::llm::{LlmError, Message, ModelClient, ModelRequest, ToolSpec, UsageTotals};

/// System prompt for the cost-analysis assistant.
pub const SYSTEM_PROMPT: &str = "You are a cloud cost analysis assistant. \
You have access to tools to query costs, detect anomalies, find waste, and \
explore filters. Use them to ground every answer in actual account data.";

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Model(#[from] LlmError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Full record of one tool execution, including the raw output. Stored
/// out-of-band; only the lean summary travels on the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: Value,
    pub output: String,
    #[serde(default)]
    pub error: bool,
}

impl ToolCallRecord {
    pub fn summary(&self) -> ToolCallSummary {
        ToolCallSummary {
            name: self.name.clone(),
            input: self.input.clone(),
            error: self.error,
        }
    }
}

/// Lean per-tool summary for the terminal stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub name: String,
    pub input: Value,
    pub error: bool,
}

/// One incoming chat turn.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub message: String,
    pub history: Vec<Message>,
    pub model: String,
    pub max_tokens: u32,
}

impl ChatTurn {
    pub fn new(message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Result of a completed tool loop.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub response_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_time_secs: f64,
    pub usage: UsageTotals,
}

/// Progress callback seam; the streaming pipeline forwards phases as
/// `status` events.
#[async_trait]
pub trait ChatObserver: Send + Sync {
    async fn on_phase(&self, phase: &str, message: &str);
}

/// Observer that discards progress, for non-streaming callers.
pub struct NoopObserver;

#[async_trait]
impl ChatObserver for NoopObserver {
    async fn on_phase(&self, _phase: &str, _message: &str) {}
}

/// Run one chat turn to completion.
pub async fn run_chat(
    model: &dyn ModelClient,
    bridge: &dyn ToolBridge,
    turn: ChatTurn,
    observer: &dyn ChatObserver,
) -> Result<ChatOutcome, ChatError> {
    let tools = bridge.list_tools().await?;
    let tool_specs: Vec<ToolSpec> = tools.iter().map(ToolSpec::from).collect();

    let mut messages = turn.history;
    messages.push(Message::user_text(turn.message));

    let mut usage = UsageTotals::default();
    let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
    let mut tool_time_secs = 0.0;

    observer.on_phase("thinking", "Analyzing your question").await;
    let mut response = model
        .complete(&ModelRequest {
            model: turn.model.clone(),
            max_tokens: turn.max_tokens,
            system: Some(SYSTEM_PROMPT.to_string()),
            messages: messages.clone(),
            tools: tool_specs.clone(),
        })
        .await?;
    if let Some(u) = &response.usage {
        usage.accumulate(u);
    }

    while response.wants_tools() {
        let mut tool_results: Vec<Value> = Vec::new();

        for block in response.content.iter().filter(|b| b.kind == "tool_use") {
            let name = block.name.clone().unwrap_or_default();
            let input = block.input.clone().unwrap_or_else(|| serde_json::json!({}));
            let tool_use_id = block.id.clone().unwrap_or_default();

            observer
                .on_phase("tool_call", &format!("Running {name}"))
                .await;
            info!(tool = %name, "calling tool");

            let started = Instant::now();
            match bridge.call_tool(&name, input.clone()).await {
                Ok(output) => {
                    tool_time_secs += started.elapsed().as_secs_f64();
                    tool_calls.push(ToolCallRecord {
                        name,
                        input,
                        output: output.clone(),
                        error: false,
                    });
                    tool_results.push(serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": output,
                    }));
                }
                Err(e) => {
                    let error_msg = format!("Error calling tool: {e}");
                    warn!(tool = %name, error = %e, "tool call failed");
                    tool_calls.push(ToolCallRecord {
                        name,
                        input,
                        output: error_msg.clone(),
                        error: true,
                    });
                    tool_results.push(serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": error_msg,
                        "is_error": true,
                    }));
                }
            }
        }

        // Continue the conversation with the tool results attached.
        messages.push(Message::assistant_blocks(&response.content));
        messages.push(Message::user_blocks(tool_results));

        observer
            .on_phase("thinking", "Interpreting tool results")
            .await;
        response = model
            .complete(&ModelRequest {
                model: turn.model.clone(),
                max_tokens: turn.max_tokens,
                system: Some(SYSTEM_PROMPT.to_string()),
                messages: messages.clone(),
                tools: tool_specs.clone(),
            })
            .await?;
        if let Some(u) = &response.usage {
            usage.accumulate(u);
        }
    }

    Ok(ChatOutcome {
        response_text: response.text(),
        tool_calls,
        tool_time_secs,
        usage,
    })
}
