use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::ChannelEntry;
use crate::channel::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    /// Channel dropped, session reset/deleted, or timeout. Treated like a
    /// denial by the orchestrator but logged distinctly.
    Cancelled,
}

impl ApprovalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalOutcome::Approved => "approved",
            ApprovalOutcome::Denied => "denied",
            ApprovalOutcome::Cancelled => "cancelled",
        }
    }
}

/// Send `request` on the session's channel and block cooperatively until a
/// matching `approval_response` arrives, the session is cancelled, or the
/// timeout elapses. The caller holds the session lock throughout, which is
/// what serialises one approval at a time per turn.
pub async fn await_approval(
    channel: &ChannelEntry,
    cancel: &CancellationToken,
    timeout: Duration,
    tool_call_id: &str,
    request: ServerMessage,
) -> ApprovalOutcome {
    let rx = channel.pending.register(tool_call_id);

    if let Err(e) = channel.sink.send(request).await {
        warn!("failed to send approval request {}: {}", tool_call_id, e);
        channel.pending.remove(tool_call_id);
        return ApprovalOutcome::Cancelled;
    }

    tokio::select! {
        response = rx => match response {
            Ok(true) => ApprovalOutcome::Approved,
            Ok(false) => ApprovalOutcome::Denied,
            // Sender dropped without answering: connection replaced or closed.
            Err(_) => {
                debug!("approval waiter {} dropped without response", tool_call_id);
                ApprovalOutcome::Cancelled
            }
        },
        _ = cancel.cancelled() => {
            channel.pending.remove(tool_call_id);
            ApprovalOutcome::Cancelled
        }
        _ = tokio::time::sleep(timeout) => {
            warn!("approval {} timed out after {:?}", tool_call_id, timeout);
            channel.pending.remove(tool_call_id);
            ApprovalOutcome::Cancelled
        }
    }
}
