pub mod approval;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier::{Classifier, OperationClassification, OperationType};
use crate::engine::{Decision, RuleEngine};
use crate::channel::{ConnectionRegistry, ServerMessage};
use crate::rules::RuleStore;
use crate::session::{HistoryEntry, SessionTurn};
use crate::signature::operation_signature;

pub use approval::ApprovalOutcome;

/// How much history feeds a trigger evaluation: the last entries, clipped
/// from the tail to a byte budget.
const HISTORY_SUMMARY_ENTRIES: usize = 40;
const HISTORY_SUMMARY_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResult {
    Allow,
    /// The user (or a cancellation standing in for them) said no; the agent
    /// gets the reason as a tool-call error string and can plan around it.
    Deny { reason: String },
    /// A block-mode rule applied; no approval round-trip happened.
    Block { reason: String },
}

/// Single entry point the agent's tool-dispatch path calls for every tool
/// invocation. Composes classifier -> rule engine -> approval gate and owns
/// the history-before-state persistence ordering.
pub struct SecurityGate {
    classifier: Classifier,
    engine: RuleEngine,
    rules: Arc<RuleStore>,
    registry: Arc<ConnectionRegistry>,
    approval_timeout: Duration,
}

impl SecurityGate {
    pub fn new(
        classifier: Classifier,
        engine: RuleEngine,
        rules: Arc<RuleStore>,
        registry: Arc<ConnectionRegistry>,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            engine,
            rules,
            registry,
            approval_timeout,
        }
    }

    /// Gate one `(tool, args)` invocation. The caller holds the session
    /// lock (`turn`) for the whole call, including any approval wait.
    pub async fn gate(
        &self,
        turn: &mut SessionTurn,
        tool: &str,
        args: &serde_json::Value,
        hint: Option<&OperationClassification>,
    ) -> Result<GateResult> {
        let tool_call_id = Uuid::new_v4().to_string();

        turn.append_history(&HistoryEntry::ToolCall {
            tool: tool.to_string(),
            args: args.clone(),
            tool_call_id: tool_call_id.clone(),
            ts: Utc::now(),
        })?;

        let classification = self.classifier.classify(tool, args, hint).await;
        turn.append_history(&HistoryEntry::Classification {
            tool: tool.to_string(),
            classification: classification.clone(),
            ts: Utc::now(),
        })?;

        let summary = history_summary(&turn.history()?);
        let signature = operation_signature(tool, args, &classification);
        let rules = self.rules.snapshot();

        let decision = self
            .engine
            .evaluate(
                &mut turn.state,
                &rules,
                &classification,
                tool,
                args,
                &summary,
                &signature,
            )
            .await;

        // Activations and cache growth from the evaluation become durable
        // before anything is reported or asked.
        turn.state.touch();
        turn.persist()?;

        match decision.decision {
            Decision::Allow => Ok(GateResult::Allow),
            Decision::Block => {
                turn.append_history(&HistoryEntry::Error {
                    detail: format!("tool call blocked: {}", decision.reason),
                    ts: Utc::now(),
                })?;
                info!(
                    "Blocked {} in session {}: {}",
                    tool, turn.session_id, decision.reason
                );
                Ok(GateResult::Block {
                    reason: decision.reason,
                })
            }
            Decision::NeedsApproval => {
                self.run_approval(
                    turn,
                    tool,
                    args,
                    &classification,
                    &signature,
                    &tool_call_id,
                    decision.triggered_rule_ids,
                    decision.descriptions,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_approval(
        &self,
        turn: &mut SessionTurn,
        tool: &str,
        args: &serde_json::Value,
        classification: &OperationClassification,
        signature: &str,
        tool_call_id: &str,
        triggered_rules: Vec<String>,
        descriptions: Vec<String>,
    ) -> Result<GateResult> {
        turn.append_history(&HistoryEntry::ApprovalRequest {
            tool_call_id: tool_call_id.to_string(),
            tool: tool.to_string(),
            rule_ids: triggered_rules.clone(),
            ts: Utc::now(),
        })?;

        let outcome = match self.registry.get(&turn.session_id) {
            Some(channel) => {
                let request = ServerMessage::ApprovalRequest {
                    tool_call_id: tool_call_id.to_string(),
                    tool: tool.to_string(),
                    args: args.clone(),
                    classification: classification.clone(),
                    triggered_rules: triggered_rules.clone(),
                    descriptions,
                };
                approval::await_approval(
                    &channel,
                    &turn.cancel,
                    self.approval_timeout,
                    tool_call_id,
                    request,
                )
                .await
            }
            None => {
                warn!(
                    "approval needed for {} in session {} but no channel is connected",
                    tool, turn.session_id
                );
                ApprovalOutcome::Cancelled
            }
        };

        turn.append_history(&HistoryEntry::ApprovalResponse {
            tool_call_id: tool_call_id.to_string(),
            outcome: outcome.as_str().to_string(),
            ts: Utc::now(),
        })?;

        match outcome {
            ApprovalOutcome::Approved => {
                turn.state.approved_operations.insert(signature.to_string());
                if classification.operation_type == OperationType::CredentialAccess {
                    for name in &classification.categories {
                        turn.state.approved_credentials.insert(name.clone());
                    }
                }
                turn.state.touch();
                turn.persist()?;
                Ok(GateResult::Allow)
            }
            ApprovalOutcome::Denied => Ok(GateResult::Deny {
                reason: format!(
                    "user denied '{}' (rules: {})",
                    tool,
                    triggered_rules.join(", ")
                ),
            }),
            ApprovalOutcome::Cancelled => {
                info!(
                    "approval for {} in session {} cancelled (disconnect, reset, or timeout)",
                    tool, turn.session_id
                );
                Ok(GateResult::Deny {
                    reason: format!("approval for '{}' was cancelled", tool),
                })
            }
        }
    }
}

/// Compact, oldest-first rendering of the recent history for trigger
/// evaluation. Clipped from the tail: the newest entries always survive.
pub fn history_summary(history: &[HistoryEntry]) -> String {
    let start = history.len().saturating_sub(HISTORY_SUMMARY_ENTRIES);
    let mut lines: Vec<String> = history[start..]
        .iter()
        .map(|e| e.summary_line())
        .collect();
    let mut total: usize = lines.iter().map(|l| l.len() + 1).sum();
    while total > HISTORY_SUMMARY_BYTES && lines.len() > 1 {
        let dropped = lines.remove(0);
        total -= dropped.len() + 1;
    }
    lines.join("\n")
}
