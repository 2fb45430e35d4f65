pub mod manager;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub use manager::{SessionManager, SessionTurn};
pub use store::{SessionInfo, SessionStore};

use crate::classifier::OperationClassification;
use crate::rules::Rule;

/// Mutable per-session security state. Persisted as the `state` document;
/// only ever mutated while the session's exclusive lock is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub channel_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_ref: Option<String>,
    /// Rule ids whose trigger has fired in this session. Grows
    /// monotonically; only `reset` (a new session) starts over.
    #[serde(default)]
    pub activated_rules: BTreeSet<String>,
    /// Rule ids the user has `/disable`d for this session.
    #[serde(default)]
    pub disabled_rules: BTreeSet<String>,
    /// Credential names the user has approved in this session.
    #[serde(default)]
    pub approved_credentials: BTreeSet<String>,
    /// Operation signatures approved in this session.
    #[serde(default)]
    pub approved_operations: BTreeSet<String>,
    /// `(rule_id, operation_signature)` -> "does the rule's effect apply".
    /// Invalidated whenever `activated_rules` or `disabled_rules` changes.
    #[serde(default)]
    pub decision_cache: BTreeMap<String, bool>,
    /// Set on the old session by `reset`; retired sessions are kept on disk
    /// for audit but accept no further turns.
    #[serde(default)]
    pub retired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,

    /// Trigger verdicts by `(rule_id, activation_context_hash)`. In-memory
    /// only: re-deriving after a restart is correct and cheap relative to
    /// its cost, so this never hits the state document.
    #[serde(skip)]
    pub trigger_cache: HashMap<String, bool>,
}

impl SessionState {
    pub fn new(session_id: String, channel_type: String, channel_ref: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            channel_type,
            channel_ref,
            activated_rules: BTreeSet::new(),
            disabled_rules: BTreeSet::new(),
            approved_credentials: BTreeSet::new(),
            approved_operations: BTreeSet::new(),
            decision_cache: BTreeMap::new(),
            retired: false,
            successor: None,
            created_at: now,
            last_active: now,
            trigger_cache: HashMap::new(),
        }
    }

    /// A rule is in force iff it is an always-rule or has activated, and the
    /// user has not disabled it.
    pub fn is_in_force(&self, rule: &Rule) -> bool {
        if self.disabled_rules.contains(&rule.id) {
            return false;
        }
        rule.is_always() || self.activated_rules.contains(&rule.id)
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    pub fn decision_cache_key(rule_id: &str, signature: &str) -> String {
        format!("{}\n{}", rule_id, signature)
    }

    pub fn trigger_cache_key(rule_id: &str, context_hash: &str) -> String {
        format!("{}\n{}", rule_id, context_hash)
    }

    /// Record a rule activation. Returns true if the id was new, in which
    /// case cached applicability decisions are stale and get dropped.
    pub fn activate_rule(&mut self, rule_id: &str) -> bool {
        let added = self.activated_rules.insert(rule_id.to_string());
        if added {
            self.decision_cache.clear();
        }
        added
    }

    pub fn disable_rule(&mut self, rule_id: &str) -> bool {
        let added = self.disabled_rules.insert(rule_id.to_string());
        if added {
            self.decision_cache.clear();
        }
        added
    }

    pub fn enable_rule(&mut self, rule_id: &str) -> bool {
        let removed = self.disabled_rules.remove(rule_id);
        if removed {
            self.decision_cache.clear();
        }
        removed
    }
}

/// One record in the append-only session history. Entries are written in
/// the order the orchestrator produced them and are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    UserMessage {
        content: String,
        ts: DateTime<Utc>,
    },
    AssistantMessage {
        content: String,
        ts: DateTime<Utc>,
    },
    ToolCall {
        tool: String,
        args: serde_json::Value,
        tool_call_id: String,
        ts: DateTime<Utc>,
    },
    ToolResult {
        tool: String,
        output: String,
        ts: DateTime<Utc>,
    },
    Classification {
        tool: String,
        classification: OperationClassification,
        ts: DateTime<Utc>,
    },
    ApprovalRequest {
        tool_call_id: String,
        tool: String,
        rule_ids: Vec<String>,
        ts: DateTime<Utc>,
    },
    ApprovalResponse {
        tool_call_id: String,
        outcome: String,
        ts: DateTime<Utc>,
    },
    Command {
        name: String,
        args: Vec<String>,
        ts: DateTime<Utc>,
    },
    Error {
        detail: String,
        ts: DateTime<Utc>,
    },
}

impl HistoryEntry {
    /// Role bucket used by the control-plane history endpoint.
    pub fn role(&self) -> &'static str {
        match self {
            HistoryEntry::UserMessage { .. } => "user",
            HistoryEntry::AssistantMessage { .. } => "assistant",
            HistoryEntry::Command { .. } => "command",
            _ => "tool_call",
        }
    }

    /// One-line rendering used in the trigger-evaluation history summary.
    pub fn summary_line(&self) -> String {
        match self {
            HistoryEntry::UserMessage { content, .. } => format!("user: {}", clip(content, 200)),
            HistoryEntry::AssistantMessage { content, .. } => {
                format!("assistant: {}", clip(content, 200))
            }
            HistoryEntry::ToolCall { tool, .. } => format!("tool_call: {}", tool),
            HistoryEntry::ToolResult { tool, output, .. } => {
                format!("tool_result: {} -> {}", tool, clip(output, 120))
            }
            HistoryEntry::Classification {
                tool,
                classification,
                ..
            } => format!(
                "classified: {} as {} [{}]",
                tool,
                classification.operation_type.as_str(),
                classification.categories.join(", ")
            ),
            HistoryEntry::ApprovalRequest { tool, rule_ids, .. } => {
                format!("approval_requested: {} (rules: {})", tool, rule_ids.join(", "))
            }
            HistoryEntry::ApprovalResponse { outcome, .. } => {
                format!("approval_{}", outcome)
            }
            HistoryEntry::Command { name, .. } => format!("command: /{}", name),
            HistoryEntry::Error { detail, .. } => format!("error: {}", clip(detail, 120)),
        }
    }
}

fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let clipped: String = s.chars().take(max_chars).collect();
        format!("{}…", clipped)
    }
}
