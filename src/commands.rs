use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::channel::{ConnectionRegistry, ServerMessage};
use crate::rules::RuleStore;
use crate::session::{HistoryEntry, SessionManager, SessionState};

/// How long a state-changing command waits for the session lock before
/// reporting the session as busy. Keeps the command channel responsive
/// while a turn is parked on an approval.
const COMMAND_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Result of running a slash command. `new_session` is set by `/reset` so
/// the connection can rebind to the successor.
pub struct CommandOutcome {
    pub reply: ServerMessage,
    pub new_session: Option<String>,
}

impl CommandOutcome {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply,
            new_session: None,
        }
    }

    fn result(command: &str, data: serde_json::Value) -> Self {
        Self::reply(ServerMessage::CommandResult {
            command: command.to_string(),
            data,
        })
    }

    fn error(detail: impl Into<String>) -> Self {
        Self::reply(ServerMessage::Error {
            detail: detail.into(),
        })
    }
}

/// Parse `/name arg1 arg2` out of a chat payload. Returns `None` for
/// ordinary messages.
pub fn parse(content: &str) -> Option<(String, Vec<String>)> {
    let trimmed = content.trim();
    let rest = trimmed.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let mut parts = rest.split_whitespace();
    let name = parts.next()?.to_string();
    let args = parts.map(|s| s.to_string()).collect();
    Some((name, args))
}

pub async fn execute(
    manager: &SessionManager,
    rules: &RuleStore,
    registry: &Arc<ConnectionRegistry>,
    session_id: &str,
    name: &str,
    args: &[String],
) -> CommandOutcome {
    match name {
        "rules" => rules_command(manager, rules, session_id),
        "disable" => toggle_rule(manager, rules, session_id, args, false).await,
        "enable" => toggle_rule(manager, rules, session_id, args, true).await,
        "reset" => reset_command(manager, session_id).await,
        "session" => session_command(manager, session_id),
        "approve" => resolve_command(registry, session_id, "approve", true),
        "deny" => resolve_command(registry, session_id, "deny", false),
        "help" => help_command(),
        other => CommandOutcome::error(format!("unknown command: /{other} (try /help)")),
    }
}

fn rule_status(state: &SessionState, rule: &crate::rules::Rule) -> &'static str {
    if state.disabled_rules.contains(&rule.id) {
        "disabled"
    } else if rule.is_always() {
        "always-on"
    } else if state.activated_rules.contains(&rule.id) {
        "activated"
    } else {
        "inactive"
    }
}

fn rules_command(manager: &SessionManager, rules: &RuleStore, session_id: &str) -> CommandOutcome {
    let state = match manager.store().read_state(session_id) {
        Ok(state) => state,
        Err(e) => return CommandOutcome::error(format!("failed to read session: {e:#}")),
    };
    let set = rules.snapshot();
    let data: Vec<serde_json::Value> = set
        .all()
        .iter()
        .map(|rule| {
            json!({
                "id": rule.id,
                "trigger": rule.trigger,
                "mode": rule.mode,
                "status": rule_status(&state, rule),
            })
        })
        .collect();
    CommandOutcome::result("rules", json!(data))
}

async fn toggle_rule(
    manager: &SessionManager,
    rules: &RuleStore,
    session_id: &str,
    args: &[String],
    enable: bool,
) -> CommandOutcome {
    let command = if enable { "enable" } else { "disable" };
    let Some(rule_id) = args.first() else {
        return CommandOutcome::error(format!("usage: /{command} <rule-id>"));
    };
    if !rules.snapshot().contains(rule_id) {
        return CommandOutcome::error(format!("unknown rule: {rule_id}"));
    }

    let mut turn = match manager.try_open(session_id, COMMAND_LOCK_WAIT).await {
        Ok(turn) => turn,
        Err(e) => return CommandOutcome::error(format!("{e:#}")),
    };
    if let Err(e) = turn.append_history(&HistoryEntry::Command {
        name: command.to_string(),
        args: args.to_vec(),
        ts: Utc::now(),
    }) {
        return CommandOutcome::error(format!("failed to record command: {e:#}"));
    }

    let changed = if enable {
        turn.state.enable_rule(rule_id)
    } else {
        turn.state.disable_rule(rule_id)
    };
    turn.state.touch();
    if let Err(e) = turn.persist() {
        return CommandOutcome::error(format!("failed to persist session: {e:#}"));
    }
    info!(
        "Rule '{}' {} for session {}",
        rule_id,
        if enable { "enabled" } else { "disabled" },
        session_id
    );
    CommandOutcome::result(command, json!({ "rule": rule_id, "changed": changed }))
}

async fn reset_command(manager: &SessionManager, session_id: &str) -> CommandOutcome {
    // Best-effort audit line on the outgoing session; reset cancels any
    // in-flight turn before taking the lock itself.
    let _ = manager.store().append_history(
        session_id,
        &HistoryEntry::Command {
            name: "reset".to_string(),
            args: Vec::new(),
            ts: Utc::now(),
        },
    );
    match manager.reset(session_id).await {
        Ok(new_state) => {
            let mut outcome = CommandOutcome::result(
                "reset",
                json!({
                    "old_session_id": session_id,
                    "session_id": new_state.session_id,
                }),
            );
            outcome.new_session = Some(new_state.session_id);
            outcome
        }
        Err(e) => CommandOutcome::error(format!("reset failed: {e:#}")),
    }
}

fn session_command(manager: &SessionManager, session_id: &str) -> CommandOutcome {
    match manager.store().read_state(session_id) {
        Ok(state) => CommandOutcome::result(
            "session",
            json!({
                "session_id": state.session_id,
                "channel_type": state.channel_type,
                "created_at": state.created_at,
                "last_active": state.last_active,
                "activated_rules": state.activated_rules,
                "disabled_rules": state.disabled_rules,
                "approved_operations": state.approved_operations.len(),
                "approved_credentials": state.approved_credentials,
            }),
        ),
        Err(e) => CommandOutcome::error(format!("failed to read session: {e:#}")),
    }
}

fn resolve_command(
    registry: &Arc<ConnectionRegistry>,
    session_id: &str,
    command: &str,
    approved: bool,
) -> CommandOutcome {
    let resolved = registry
        .get(session_id)
        .and_then(|entry| entry.pending.resolve_oldest(approved));
    match resolved {
        Some(tool_call_id) => CommandOutcome::result(
            command,
            json!({ "resolved": true, "tool_call_id": tool_call_id }),
        ),
        None => CommandOutcome::result(
            command,
            json!({ "resolved": false, "detail": "no approval is pending" }),
        ),
    }
}

fn help_command() -> CommandOutcome {
    CommandOutcome::result(
        "help",
        json!([
            { "command": "/rules", "detail": "list rules and their status for this session" },
            { "command": "/disable <id>", "detail": "disable a rule for this session" },
            { "command": "/enable <id>", "detail": "re-enable a disabled rule" },
            { "command": "/reset", "detail": "retire this session and start a fresh one" },
            { "command": "/session", "detail": "show this session's security state" },
            { "command": "/approve", "detail": "approve the oldest pending tool call" },
            { "command": "/deny", "detail": "deny the oldest pending tool call" },
            { "command": "/help", "detail": "this list" },
        ]),
    )
}

/// Convenience used by the websocket handler: run a command expressed as a
/// raw chat payload. `None` means the payload was an ordinary message.
pub async fn execute_raw(
    manager: &SessionManager,
    rules: &RuleStore,
    registry: &Arc<ConnectionRegistry>,
    session_id: &str,
    content: &str,
) -> Option<CommandOutcome> {
    match parse(content) {
        Some((name, args)) => {
            Some(execute(manager, rules, registry, session_id, &name, &args).await)
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingSink;
    use crate::session::SessionStore;

    fn fixture(rules_yaml: &str) -> (SessionManager, Arc<RuleStore>, Arc<ConnectionRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rules.yaml"), rules_yaml).unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let manager = SessionManager::new(store);
        let rules = Arc::new(RuleStore::load(dir.path().join("rules.yaml")).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        (manager, rules, registry, dir)
    }

    const RULES: &str = "\
rules:
  - {id: always-rule, trigger: always, effect: e, mode: approve}
  - {id: web-rule, trigger: agent went online, effect: e, mode: approve}
";

    #[test]
    fn test_parse() {
        assert_eq!(
            parse("/disable web-rule"),
            Some(("disable".to_string(), vec!["web-rule".to_string()]))
        );
        assert_eq!(parse("/rules"), Some(("rules".to_string(), vec![])));
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("/"), None);
        assert_eq!(parse("  /help  "), Some(("help".to_string(), vec![])));
    }

    #[tokio::test]
    async fn test_rules_statuses() {
        let (manager, rules, registry, _dir) = fixture(RULES);
        let session = manager.create("web", None).await.unwrap();
        {
            let mut turn = manager.open(&session.session_id).await.unwrap();
            turn.state.activate_rule("web-rule");
            turn.persist().unwrap();
        }

        let outcome = execute(&manager, &rules, &registry, &session.session_id, "rules", &[]).await;
        let ServerMessage::CommandResult { command, data } = outcome.reply else {
            panic!("expected command_result");
        };
        assert_eq!(command, "rules");
        let list = data.as_array().unwrap();
        assert_eq!(list[0]["status"], "always-on");
        assert_eq!(list[1]["status"], "activated");

        // Disable flips the reported status.
        let _ = execute(
            &manager,
            &rules,
            &registry,
            &session.session_id,
            "disable",
            &["web-rule".to_string()],
        )
        .await;
        let outcome = execute(&manager, &rules, &registry, &session.session_id, "rules", &[]).await;
        let ServerMessage::CommandResult { data, .. } = outcome.reply else {
            panic!("expected command_result");
        };
        assert_eq!(data.as_array().unwrap()[1]["status"], "disabled");
    }

    #[tokio::test]
    async fn test_disable_unknown_rule() {
        let (manager, rules, registry, _dir) = fixture(RULES);
        let session = manager.create("web", None).await.unwrap();
        let outcome = execute(
            &manager,
            &rules,
            &registry,
            &session.session_id,
            "disable",
            &["nope".to_string()],
        )
        .await;
        assert!(matches!(outcome.reply, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_reset_reports_new_session() {
        let (manager, rules, registry, _dir) = fixture(RULES);
        let session = manager.create("web", None).await.unwrap();
        let outcome = execute(&manager, &rules, &registry, &session.session_id, "reset", &[]).await;
        let new_id = outcome.new_session.expect("reset rebinds the connection");
        assert_ne!(new_id, session.session_id);
        assert!(manager.exists(&new_id));
        let old = manager.store().read_state(&session.session_id).unwrap();
        assert!(old.retired);
    }

    #[tokio::test]
    async fn test_approve_resolves_oldest_pending() {
        let (manager, rules, registry, _dir) = fixture(RULES);
        let session = manager.create("web", None).await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let entry = registry.register(&session.session_id, sink.clone());
        let mut rx = entry.pending.register("t1");

        let outcome = execute(&manager, &rules, &registry, &session.session_id, "approve", &[]).await;
        let ServerMessage::CommandResult { data, .. } = outcome.reply else {
            panic!("expected command_result");
        };
        assert_eq!(data["resolved"], true);
        assert_eq!(data["tool_call_id"], "t1");
        assert!(rx.try_recv().unwrap());

        // Nothing left pending.
        let outcome = execute(&manager, &rules, &registry, &session.session_id, "deny", &[]).await;
        let ServerMessage::CommandResult { data, .. } = outcome.reply else {
            panic!("expected command_result");
        };
        assert_eq!(data["resolved"], false);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (manager, rules, registry, _dir) = fixture(RULES);
        let session = manager.create("web", None).await.unwrap();
        let outcome = execute(&manager, &rules, &registry, &session.session_id, "frobnicate", &[]).await;
        assert!(matches!(outcome.reply, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_command_recorded_in_history() {
        let (manager, rules, registry, _dir) = fixture(RULES);
        let session = manager.create("web", None).await.unwrap();
        let _ = execute(
            &manager,
            &rules,
            &registry,
            &session.session_id,
            "disable",
            &["web-rule".to_string()],
        )
        .await;
        let history = manager.store().read_history(&session.session_id).unwrap();
        assert!(history
            .iter()
            .any(|e| matches!(e, HistoryEntry::Command { name, .. } if name == "disable")));
    }
}
