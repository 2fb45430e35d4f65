pub mod registry;
pub mod ws;

use crate::classifier::OperationClassification;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use registry::{ChannelEntry, ConnectionRegistry, PendingApprovals};

/// Client -> server frames on a session's data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A chat message. Payloads starting with `/` are slash commands.
    Message { content: String },
    ApprovalResponse {
        tool_call_id: String,
        approved: bool,
    },
    Command {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Server -> client frames on a session's data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Done {
        content: String,
    },
    ToolCall {
        tool: String,
        args: serde_json::Value,
        detail: String,
    },
    ApprovalRequest {
        tool_call_id: String,
        tool: String,
        args: serde_json::Value,
        classification: OperationClassification,
        triggered_rules: Vec<String>,
        descriptions: Vec<String>,
    },
    CommandResult {
        command: String,
        data: serde_json::Value,
    },
    Error {
        detail: String,
    },
    /// Reserved for streaming.
    Token {
        content: String,
    },
}

/// Outbound half of a session's channel. The core only needs to push tagged
/// messages at an already-authenticated peer; the transport behind the sink
/// is the adapter's business.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(&self, msg: ServerMessage) -> Result<()>;
    async fn close(&self);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "message", "content": "hello"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Message { ref content } if content == "hello"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "approval_response", "tool_call_id": "abc", "approved": true}"#,
        )
        .unwrap();
        assert!(
            matches!(msg, ClientMessage::ApprovalResponse { ref tool_call_id, approved } if tool_call_id == "abc" && approved)
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "command", "name": "rules"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Command { ref name, ref args } if name == "rules" && args.is_empty()));
    }

    #[test]
    fn test_server_message_wire_format() {
        let json = serde_json::to_value(ServerMessage::Done {
            content: "ok".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "done");

        let json = serde_json::to_value(ServerMessage::CommandResult {
            command: "rules".into(),
            data: serde_json::json!([]),
        })
        .unwrap();
        assert_eq!(json["type"], "command_result");
    }
}
