use crate::llm::{parse_json_reply, ChatMessage, ChatModel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// What a tool invocation fundamentally does, as judged by the auxiliary
/// model. The vocabulary is closed; anything unrecognisable maps to
/// `Execute` via the conservative default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ReadLocal,
    WriteLocal,
    ReadExternal,
    WriteExternal,
    ReadSensitive,
    WriteSensitive,
    Execute,
    CredentialAccess,
    MemoryRead,
    MemoryWrite,
    SkillModify,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::ReadLocal => "read_local",
            OperationType::WriteLocal => "write_local",
            OperationType::ReadExternal => "read_external",
            OperationType::WriteExternal => "write_external",
            OperationType::ReadSensitive => "read_sensitive",
            OperationType::WriteSensitive => "write_sensitive",
            OperationType::Execute => "execute",
            OperationType::CredentialAccess => "credential_access",
            OperationType::MemoryRead => "memory_read",
            OperationType::MemoryWrite => "memory_write",
            OperationType::SkillModify => "skill_modify",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationClassification {
    pub operation_type: OperationType,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
}

impl OperationClassification {
    /// Fallback when the model is unreachable or returns garbage. `execute`
    /// with zero confidence is the classification most likely to be caught
    /// by broad rules, so failures stay on the safe side.
    pub fn conservative_default() -> Self {
        Self {
            operation_type: OperationType::Execute,
            categories: Vec::new(),
            description: "unclassified".to_string(),
            confidence: 0.0,
        }
    }

    fn normalized(mut self) -> Self {
        self.confidence = self.confidence.clamp(0.0, 1.0);
        for c in &mut self.categories {
            *c = c.trim().to_ascii_lowercase();
        }
        self.categories.retain(|c| !c.is_empty());
        self.categories.sort();
        self.categories.dedup();
        self
    }
}

const CLASSIFIER_SYSTEM: &str = "\
You classify a single tool invocation made by an AI agent on a user's behalf.\n\
Reply with one JSON object:\n\
{\"operation_type\": \"...\", \"categories\": [\"...\"], \"description\": \"...\", \"confidence\": 0.0}\n\
\n\
operation_type must be exactly one of:\n\
read_local, write_local, read_external, write_external, read_sensitive,\n\
write_sensitive, execute, credential_access, memory_read, memory_write,\n\
skill_modify.\n\
\n\
categories are lowercase domain tags such as: finance, email, documents,\n\
code, browsing, credentials, system, communication. Use any tag that fits;\n\
an empty list is fine.\n\
\n\
description is one short sentence of what the invocation does.\n\
confidence is your certainty in [0, 1].";

/// Arguments are truncated to this many bytes in the classifier prompt.
const ARGS_BYTE_BUDGET: usize = 2048;

pub struct Classifier {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl Classifier {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    /// One model call per tool invocation. Never fails: transport or parse
    /// errors collapse to the conservative default.
    pub async fn classify(
        &self,
        tool: &str,
        args: &serde_json::Value,
        hint: Option<&OperationClassification>,
    ) -> OperationClassification {
        let args_text = truncate_utf8(
            &serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string()),
            ARGS_BYTE_BUDGET,
        );
        let mut user = format!("Tool: {}\nArguments: {}", tool, args_text);
        if let Some(hint) = hint {
            user.push_str(&format!(
                "\nManifest hint (may be overridden): operation_type={}, categories={:?}",
                hint.operation_type.as_str(),
                hint.categories
            ));
        }

        let messages = [
            ChatMessage::new("system", CLASSIFIER_SYSTEM),
            ChatMessage::new("user", user),
        ];

        let raw = match self.model.chat_json(&self.model_name, &messages).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("classifier model call failed, using conservative default: {e}");
                return OperationClassification::conservative_default();
            }
        };

        match parse_json_reply::<OperationClassification>(&raw) {
            Ok(classification) => classification.normalized(),
            Err(e) => {
                warn!("classifier reply unparseable, using conservative default: {e}");
                OperationClassification::conservative_default()
            }
        }
    }
}

/// Truncate on a char boundary at or below `max_bytes`.
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;

    fn classifier(model: Arc<ScriptedModel>) -> Classifier {
        Classifier::new(model, "aux-model".to_string())
    }

    #[tokio::test]
    async fn test_classify_parses_model_reply() {
        let model = Arc::new(ScriptedModel::new());
        model.push_ok(
            r#"{"operation_type": "read_external", "categories": ["Browsing", "browsing"], "description": "fetches a URL", "confidence": 0.92}"#,
        );
        let c = classifier(model.clone());
        let result = c
            .classify("fetch", &serde_json::json!({"url": "https://x"}), None)
            .await;
        assert_eq!(result.operation_type, OperationType::ReadExternal);
        assert_eq!(result.categories, vec!["browsing"]);
        assert!((result.confidence - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_model_error_falls_back_conservatively() {
        let model = Arc::new(ScriptedModel::new());
        model.push_err("connection refused");
        let c = classifier(model);
        let result = c.classify("fetch", &serde_json::json!({}), None).await;
        assert_eq!(result.operation_type, OperationType::Execute);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.description, "unclassified");
    }

    #[tokio::test]
    async fn test_garbage_reply_falls_back_conservatively() {
        let model = Arc::new(ScriptedModel::new());
        model.push_ok("I am not JSON");
        let c = classifier(model);
        let result = c.classify("fetch", &serde_json::json!({}), None).await;
        assert_eq!(result.operation_type, OperationType::Execute);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let model = Arc::new(ScriptedModel::new());
        model.push_ok(r#"{"operation_type": "execute", "confidence": 3.5}"#);
        let c = classifier(model);
        let result = c.classify("run", &serde_json::json!({}), None).await;
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_hint_included_in_prompt() {
        let model = Arc::new(ScriptedModel::new());
        model.push_ok(r#"{"operation_type": "write_local"}"#);
        let c = classifier(model.clone());
        let hint = OperationClassification {
            operation_type: OperationType::WriteLocal,
            categories: vec!["documents".to_string()],
            description: String::new(),
            confidence: 1.0,
        };
        let _ = c
            .classify("write_file", &serde_json::json!({"path": "/a"}), Some(&hint))
            .await;
        let calls = model.calls.lock().unwrap();
        assert!(calls[0].contains("Manifest hint"));
        assert!(calls[0].contains("write_local"));
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 3);
        assert!(t.starts_with("h"));
        // Never panics mid-codepoint.
        let _ = truncate_utf8("ééééé", 5);
    }
}
