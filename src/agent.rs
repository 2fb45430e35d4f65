use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::channel::{ChannelSink, ServerMessage};
use crate::classifier::OperationClassification;
use crate::gate::{GateResult, SecurityGate};
use crate::llm::{ChatMessage, ChatModel};
use crate::session::{HistoryEntry, SessionManager};

/// Seam to whatever actually executes an approved tool call. The sandbox
/// runtime lives behind this trait; the gateway itself never runs tools.
#[async_trait]
pub trait ToolRuntime: Send + Sync {
    /// Optional classification prior from the tool's manifest.
    fn hint(&self, _tool: &str) -> Option<OperationClassification> {
        None
    }

    async fn execute(&self, tool: &str, args: &Value) -> Result<String>;
}

/// Stand-in runtime: reports what it would have executed. Lets the full
/// pipeline run end-to-end without a sandbox attached.
pub struct EchoRuntime;

#[async_trait]
impl ToolRuntime for EchoRuntime {
    async fn execute(&self, tool: &str, args: &Value) -> Result<String> {
        Ok(format!(
            "executed {} with {}",
            tool,
            serde_json::to_string(args).unwrap_or_default()
        ))
    }
}

/// One action per model reply.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    Tool {
        tool: String,
        #[serde(default)]
        args: Value,
    },
    Done {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Parse the model's next action. Fast path is a single clean JSON object;
/// models sometimes wrap it in prose, so fall back to scanning for the
/// first valid object.
pub fn parse_action(raw: &str) -> Result<AgentAction> {
    let trimmed = raw.trim();
    if let Ok(action) = serde_json::from_str::<AgentAction>(trimmed) {
        return Ok(action);
    }
    for (idx, _) in trimmed.match_indices('{') {
        let candidate = &trimmed[idx..];
        let stream =
            serde_json::de::Deserializer::from_str(candidate).into_iter::<Value>();
        for value in stream.flatten() {
            if let Ok(action) = serde_json::from_value::<AgentAction>(value) {
                return Ok(action);
            }
        }
    }
    anyhow::bail!("no valid agent action found in response")
}

const AGENT_SYSTEM: &str = "\
You are an assistant that acts through tools. Every reply must be exactly\n\
one JSON object, either:\n\
  {\"type\": \"tool\", \"tool\": \"<name>\", \"args\": { ... }}\n\
or, when the task is finished or cannot proceed:\n\
  {\"type\": \"done\", \"message\": \"<summary for the user>\"}\n\
\n\
Tool calls pass through a security gate; a denied or blocked call comes\n\
back as a tool_error observation. Respect denials: do not retry an\n\
identical call that was just denied.";

/// Drives one agent turn: user message in, model actions gated and executed
/// until the model is done or the iteration budget runs out. Holds the
/// session lock for the whole turn.
pub struct AgentRunner {
    model: Arc<dyn ChatModel>,
    model_name: String,
    runtime: Arc<dyn ToolRuntime>,
    gate: Arc<SecurityGate>,
    manager: Arc<SessionManager>,
    max_iters: usize,
}

impl AgentRunner {
    pub fn new(
        model: Arc<dyn ChatModel>,
        model_name: String,
        runtime: Arc<dyn ToolRuntime>,
        gate: Arc<SecurityGate>,
        manager: Arc<SessionManager>,
        max_iters: usize,
    ) -> Self {
        Self {
            model,
            model_name,
            runtime,
            gate,
            manager,
            max_iters,
        }
    }

    pub async fn run_turn(
        &self,
        session_id: &str,
        user_message: &str,
        sink: Arc<dyn ChannelSink>,
    ) -> Result<()> {
        let mut turn = self.manager.open(session_id).await?;
        turn.append_history(&HistoryEntry::UserMessage {
            content: user_message.to_string(),
            ts: Utc::now(),
        })?;

        let mut messages = conversation_from_history(&turn.history()?);

        for _ in 0..self.max_iters {
            if turn.cancel.is_cancelled() {
                info!("turn cancelled for session {}", session_id);
                return Ok(());
            }

            let raw = match self.model.chat_json(&self.model_name, &messages).await {
                Ok(raw) => raw,
                Err(e) => {
                    let detail = format!("model call failed: {e:#}");
                    let _ = turn.append_history(&HistoryEntry::Error {
                        detail: detail.clone(),
                        ts: Utc::now(),
                    });
                    let _ = sink.send(ServerMessage::Error { detail }).await;
                    return Ok(());
                }
            };

            let action = match parse_action(&raw) {
                Ok(action) => action,
                Err(_) => {
                    warn!("unparseable agent action, nudging model");
                    messages.push(ChatMessage::new(
                        "user",
                        "Reply with exactly one JSON action object.",
                    ));
                    continue;
                }
            };

            match action {
                AgentAction::Done { message } => {
                    let content = message.unwrap_or_else(|| "Done.".to_string());
                    turn.append_history(&HistoryEntry::AssistantMessage {
                        content: content.clone(),
                        ts: Utc::now(),
                    })?;
                    let _ = sink.send(ServerMessage::Done { content }).await;
                    return Ok(());
                }
                AgentAction::Tool { tool, args } => {
                    messages.push(ChatMessage::new("assistant", raw.clone()));
                    let _ = sink
                        .send(ServerMessage::ToolCall {
                            tool: tool.clone(),
                            args: args.clone(),
                            detail: tool_detail(&tool, &args),
                        })
                        .await;

                    let hint = self.runtime.hint(&tool);
                    let observation = match self.gate.gate(&mut turn, &tool, &args, hint.as_ref()).await
                    {
                        Ok(GateResult::Allow) => match self.runtime.execute(&tool, &args).await {
                            Ok(output) => {
                                turn.append_history(&HistoryEntry::ToolResult {
                                    tool: tool.clone(),
                                    output: output.clone(),
                                    ts: Utc::now(),
                                })?;
                                format!("tool_result: {}", output)
                            }
                            Err(e) => {
                                let detail = format!("tool_error: {e:#}");
                                turn.append_history(&HistoryEntry::Error {
                                    detail: detail.clone(),
                                    ts: Utc::now(),
                                })?;
                                detail
                            }
                        },
                        Ok(GateResult::Deny { reason }) => format!("tool_error: {}", reason),
                        Ok(GateResult::Block { reason }) => format!("tool_error: {}", reason),
                        Err(e) => {
                            // Persistence failure mid-gate: end the turn.
                            let detail = format!("gate failure: {e:#}");
                            let _ = turn.append_history(&HistoryEntry::Error {
                                detail: detail.clone(),
                                ts: Utc::now(),
                            });
                            let _ = sink.send(ServerMessage::Error { detail }).await;
                            return Ok(());
                        }
                    };
                    messages.push(ChatMessage::new("user", observation));
                }
            }
        }

        let content = "Stopping: reached the tool-call budget for this turn.".to_string();
        turn.append_history(&HistoryEntry::AssistantMessage {
            content: content.clone(),
            ts: Utc::now(),
        })?;
        let _ = sink.send(ServerMessage::Done { content }).await;
        Ok(())
    }
}

fn tool_detail(tool: &str, args: &Value) -> String {
    let rendered = serde_json::to_string(args).unwrap_or_default();
    if rendered.len() > 120 {
        format!("{} {}…", tool, &rendered[..117])
    } else {
        format!("{} {}", tool, rendered)
    }
}

/// Rebuild the model conversation from persisted history. Gate-internal
/// records (classifications, approval bookkeeping) stay out of the prompt;
/// the model sees messages, tool results, and errors.
fn conversation_from_history(history: &[HistoryEntry]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::new("system", AGENT_SYSTEM)];
    for entry in history {
        match entry {
            HistoryEntry::UserMessage { content, .. } => {
                messages.push(ChatMessage::new("user", content.clone()));
            }
            HistoryEntry::AssistantMessage { content, .. } => {
                messages.push(ChatMessage::new("assistant", content.clone()));
            }
            HistoryEntry::ToolCall { tool, args, .. } => {
                messages.push(ChatMessage::new(
                    "assistant",
                    serde_json::json!({"type": "tool", "tool": tool, "args": args}).to_string(),
                ));
            }
            HistoryEntry::ToolResult { output, .. } => {
                messages.push(ChatMessage::new("user", format!("tool_result: {}", output)));
            }
            HistoryEntry::Error { detail, .. } => {
                messages.push(ChatMessage::new("user", format!("tool_error: {}", detail)));
            }
            _ => {}
        }
    }
    messages
}
