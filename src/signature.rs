use crate::classifier::OperationClassification;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Arg fields dropped from signatures at any nesting depth. These vary per
/// invocation without changing what the operation does; hashing them would
/// turn every repeat into a fresh approval prompt.
const VOLATILE_KEYS: &[&str] = &["timestamp", "ts", "nonce", "request_id"];

/// Deterministic fingerprint of a tool invocation: tool name, canonicalised
/// args, classified operation type, sorted categories. Two invocations with
/// the same signature are interchangeable for approval and decision caching;
/// any difference re-prompts rather than silently reusing an approval.
pub fn operation_signature(
    tool: &str,
    args: &Value,
    classification: &OperationClassification,
) -> String {
    let canonical = canonicalize(args);
    let mut categories = classification.categories.clone();
    categories.sort();

    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(classification.operation_type.as_str().as_bytes());
    hasher.update([0u8]);
    for c in &categories {
        hasher.update(c.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Hash over the activation context a trigger evaluation saw: the history
/// summary plus the pending classification. Used to cache trigger verdicts
/// within a session.
pub fn activation_context_hash(
    history_summary: &str,
    classification: &OperationClassification,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(history_summary.as_bytes());
    hasher.update([0u8]);
    hasher.update(classification.operation_type.as_str().as_bytes());
    hasher.update([0u8]);
    let mut categories = classification.categories.clone();
    categories.sort();
    for c in &categories {
        hasher.update(c.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Key order must not affect the signature, so objects are rebuilt with
/// sorted keys and volatile fields removed, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
