use crate::classifier::{OperationClassification, OperationType};
use crate::llm::{parse_json_reply, ChatMessage, ChatModel};
use crate::rules::{Rule, RuleMode, RuleSet};
use crate::session::SessionState;
use crate::signature::activation_context_hash;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    NeedsApproval,
    Block,
}

#[derive(Debug, Clone)]
pub struct GateDecision {
    pub decision: Decision,
    /// Rules responsible for the decision, in rule-file order.
    pub triggered_rule_ids: Vec<String>,
    pub descriptions: Vec<String>,
    pub reason: String,
}

impl GateDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            triggered_rule_ids: Vec::new(),
            descriptions: Vec::new(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerVerdict {
    satisfied: bool,
}

#[derive(Debug, Deserialize)]
struct EffectVerdict {
    applies: bool,
}

const TRIGGER_SYSTEM: &str = "\
You decide whether a plain-English trigger condition has been satisfied by\n\
what already happened in an AI-agent session, up to and including the\n\
operation the agent is attempting right now.\n\
Reply with one JSON object: {\"satisfied\": true} or {\"satisfied\": false}.\n\
Judge only whether the condition has happened; do not judge whether the\n\
pending operation should be allowed.";

const EFFECT_SYSTEM: &str = "\
You decide whether a plain-English security rule restricts the specific\n\
operation an AI agent is attempting right now.\n\
Reply with one JSON object: {\"applies\": true} or {\"applies\": false}.\n\
Answer true only if this operation is one the rule is about.";

/// Evaluates rules against a session. All methods run under the session's
/// exclusive lock; the engine itself carries no per-session state.
pub struct RuleEngine {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl RuleEngine {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    /// Full evaluation for one pending operation:
    /// activation pass, approved-operation shortcut, applicability pass,
    /// aggregation. Mutates `state` (activations, caches) but persists
    /// nothing; the orchestrator owns persistence ordering.
    pub async fn evaluate(
        &self,
        state: &mut SessionState,
        rules: &RuleSet,
        classification: &OperationClassification,
        tool: &str,
        args: &Value,
        history_summary: &str,
        signature: &str,
    ) -> GateDecision {
        self.run_activation_pass(state, rules, classification, history_summary)
            .await;

        if rules.is_empty() {
            return GateDecision::allow("no rules configured");
        }

        // Approved-operation shortcut: a previously approved signature (or a
        // credential access naming only approved credentials) skips the
        // approval round-trip, but an applicable block rule still wins.
        if self.is_pre_approved(state, classification, signature) {
            return self
                .check_block_rules_only(state, rules, classification, tool, args, signature)
                .await;
        }

        let applicable = self
            .run_applicability_pass(state, rules, classification, tool, args, signature, None)
            .await;
        aggregate(applicable)
    }

    /// Step 1: for every dormant non-always rule, ask whether its trigger is
    /// now satisfied. Verdicts are cached per activation context; failures
    /// count as "not satisfied" so uncertainty cannot create restrictions.
    async fn run_activation_pass(
        &self,
        state: &mut SessionState,
        rules: &RuleSet,
        classification: &OperationClassification,
        history_summary: &str,
    ) {
        let context_hash = activation_context_hash(history_summary, classification);
        for rule in rules.all() {
            if rule.is_always() || state.activated_rules.contains(&rule.id) {
                continue;
            }
            let cache_key = SessionState::trigger_cache_key(&rule.id, &context_hash);
            let satisfied = match state.trigger_cache.get(&cache_key).copied() {
                Some(v) => v,
                None => {
                    let verdict = self
                        .eval_trigger(rule, classification, history_summary)
                        .await;
                    let satisfied = match verdict {
                        Ok(v) => {
                            state.trigger_cache.insert(cache_key, v);
                            v
                        }
                        Err(e) => {
                            warn!(
                                "trigger evaluation failed for rule '{}', treating as not satisfied: {e:#}",
                                rule.id
                            );
                            false
                        }
                    };
                    satisfied
                }
            };
            if satisfied && state.activate_rule(&rule.id) {
                info!("Rule '{}' activated for session {}", rule.id, state.session_id);
            }
        }
    }

    /// Step 2: for every in-force rule (optionally restricted to one mode),
    /// ask whether its effect covers this operation. Successful verdicts are
    /// cached by `(rule_id, operation_signature)`; failures are not cached
    /// and count as "applies, approve-mode" so errors can gate but never
    /// silently block or silently allow.
    async fn run_applicability_pass(
        &self,
        state: &mut SessionState,
        rules: &RuleSet,
        classification: &OperationClassification,
        tool: &str,
        args: &Value,
        signature: &str,
        only_mode: Option<RuleMode>,
    ) -> Vec<(Rule, RuleMode)> {
        let mut applicable = Vec::new();
        let in_force: Vec<Rule> = rules
            .all()
            .iter()
            .filter(|r| state.is_in_force(r))
            .filter(|r| only_mode.map_or(true, |m| r.mode == m))
            .cloned()
            .collect();

        for rule in in_force {
            let cache_key = SessionState::decision_cache_key(&rule.id, signature);
            match state.decision_cache.get(&cache_key).copied() {
                Some(true) => applicable.push((rule.clone(), rule.mode)),
                Some(false) => {}
                None => match self.eval_effect(&rule, classification, tool, args).await {
                    Ok(applies) => {
                        state.decision_cache.insert(cache_key, applies);
                        if applies {
                            applicable.push((rule.clone(), rule.mode));
                        }
                    }
                    Err(e) => {
                        warn!(
                            "applicability evaluation failed for rule '{}', failing closed to approval: {e:#}",
                            rule.id
                        );
                        applicable.push((rule.clone(), RuleMode::Approve));
                    }
                },
            }
        }
        applicable
    }

    /// Narrowed pass behind the approved-operation shortcut: only in-force
    /// block rules can override a cached approval. An evaluation error here
    /// falls back to a fresh approval rather than reusing the old one.
    async fn check_block_rules_only(
        &self,
        state: &mut SessionState,
        rules: &RuleSet,
        classification: &OperationClassification,
        tool: &str,
        args: &Value,
        signature: &str,
    ) -> GateDecision {
        let applicable = self
            .run_applicability_pass(
                state,
                rules,
                classification,
                tool,
                args,
                signature,
                Some(RuleMode::Block),
            )
            .await;

        // Any entry that fell back to approve-mode means the check itself
        // failed; any block-mode entry means a block rule applies.
        let blocked: Vec<&Rule> = applicable
            .iter()
            .filter(|(_, mode)| *mode == RuleMode::Block)
            .map(|(r, _)| r)
            .collect();
        if !blocked.is_empty() {
            return decision_from(Decision::Block, &blocked);
        }
        if !applicable.is_empty() {
            let uncertain: Vec<&Rule> = applicable.iter().map(|(r, _)| r).collect();
            return decision_from(Decision::NeedsApproval, &uncertain);
        }
        debug!("operation signature pre-approved, allowing");
        GateDecision::allow("previously approved in this session")
    }

    fn is_pre_approved(
        &self,
        state: &SessionState,
        classification: &OperationClassification,
        signature: &str,
    ) -> bool {
        if state.approved_operations.contains(signature) {
            return true;
        }
        // Credential accesses are interchangeable per credential name, not
        // per exact invocation: once "github" is approved, reading it again
        // with different incidental args should not re-prompt.
        if classification.operation_type == OperationType::CredentialAccess
            && !classification.categories.is_empty()
            && classification
                .categories
                .iter()
                .all(|c| state.approved_credentials.contains(c))
        {
            return true;
        }
        false
    }

    async fn eval_trigger(
        &self,
        rule: &Rule,
        classification: &OperationClassification,
        history_summary: &str,
    ) -> anyhow::Result<bool> {
        let user = format!(
            "Trigger condition: {}\n\nSession history:\n{}\n\nPending operation: {} [{}]: {}",
            rule.trigger,
            if history_summary.is_empty() {
                "(empty)"
            } else {
                history_summary
            },
            classification.operation_type.as_str(),
            classification.categories.join(", "),
            classification.description,
        );
        let messages = [
            ChatMessage::new("system", TRIGGER_SYSTEM),
            ChatMessage::new("user", user),
        ];
        let raw = self.model.chat_json(&self.model_name, &messages).await?;
        let verdict: TriggerVerdict = parse_json_reply(&raw)?;
        Ok(verdict.satisfied)
    }

    async fn eval_effect(
        &self,
        rule: &Rule,
        classification: &OperationClassification,
        tool: &str,
        args: &Value,
    ) -> anyhow::Result<bool> {
        let user = format!(
            "Rule: {}\n\nOperation:\n  tool: {}\n  args: {}\n  classified as: {} [{}]: {}",
            rule.effect,
            tool,
            serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string()),
            classification.operation_type.as_str(),
            classification.categories.join(", "),
            classification.description,
        );
        let messages = [
            ChatMessage::new("system", EFFECT_SYSTEM),
            ChatMessage::new("user", user),
        ];
        let raw = self.model.chat_json(&self.model_name, &messages).await?;
        let verdict: EffectVerdict = parse_json_reply(&raw)?;
        Ok(verdict.applies)
    }
}

/// Blocks dominate approvals; approvals dominate allow. Reported rules are
/// those of the winning mode, in file order.
fn aggregate(applicable: Vec<(Rule, RuleMode)>) -> GateDecision {
    if applicable.is_empty() {
        return GateDecision::allow("no applicable rules");
    }
    let blocked: Vec<&Rule> = applicable
        .iter()
        .filter(|(_, mode)| *mode == RuleMode::Block)
        .map(|(r, _)| r)
        .collect();
    if !blocked.is_empty() {
        return decision_from(Decision::Block, &blocked);
    }
    let approvals: Vec<&Rule> = applicable.iter().map(|(r, _)| r).collect();
    decision_from(Decision::NeedsApproval, &approvals)
}

fn decision_from(decision: Decision, rules: &[&Rule]) -> GateDecision {
    let ids: Vec<String> = rules.iter().map(|r| r.id.clone()).collect();
    let descriptions: Vec<String> = rules
        .iter()
        .map(|r| {
            if r.description.is_empty() {
                r.effect.clone()
            } else {
                r.description.clone()
            }
        })
        .collect();
    let reason = match decision {
        Decision::Block => format!("blocked by rule(s): {}", ids.join(", ")),
        Decision::NeedsApproval => format!("approval required by rule(s): {}", ids.join(", ")),
        Decision::Allow => String::new(),
    };
    GateDecision {
        decision,
        triggered_rule_ids: ids,
        descriptions,
        reason,
    }
}
