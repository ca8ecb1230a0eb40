//! Normalized engine events and the registry inbox.
//!
//! Adapters translate their wire protocol into [`EngineEvent`]s and push them,
//! tagged with the session and process generation, into the single inbox the
//! registry drains.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::error::EngineError;
use crate::core::permissions::{PermissionRequest, PermissionResponder};
use crate::core::session::SessionId;
use crate::engines::{EngineAdapter, Setting, StartInfo};

/// One piece of streamed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Text to append.
    Delta(String),
    /// Full content so far; may repeat what deltas already delivered.
    Snapshot(String),
}

/// Events emitted by an engine adapter.
#[derive(Debug)]
pub enum EngineEvent {
    /// Backend reported (or changed) its resumable conversation id or model.
    SessionConfigured {
        resume_id: Option<String>,
        model: Option<String>,
    },

    /// A turn started processing.
    TurnStarted,

    /// Assistant text. `segment` is the backend's message or item id when it
    /// has one.
    Text {
        segment: Option<String>,
        fragment: Fragment,
        parent_tool_use_id: Option<String>,
    },

    /// Assistant reasoning, same addressing as `Text`.
    Reasoning {
        segment: Option<String>,
        fragment: Fragment,
        parent_tool_use_id: Option<String>,
    },

    /// A tool invocation, already normalized to canonical names.
    ToolCall {
        tool_use_id: String,
        name: String,
        input: Value,
        parent_tool_use_id: Option<String>,
    },

    /// Updated input for a known invocation.
    ToolCallUpdate {
        tool_use_id: String,
        name: Option<String>,
        input: Value,
        parent_tool_use_id: Option<String>,
    },

    /// Output of a tool invocation.
    ToolResult {
        tool_use_id: String,
        output: Value,
        is_error: bool,
        parent_tool_use_id: Option<String>,
    },

    /// Incremental spend reported by the backend.
    Cost { delta_usd: f64 },

    /// Backend compacted its context.
    Compacted { summary: String },

    /// Informational or error line from the backend.
    Notice { text: String, is_error: bool },

    /// The backend refused a setting change that was taken as applied.
    SettingRejected {
        setting: Setting,
        /// Value still in effect, when the adapter knows it.
        current: Option<String>,
        /// The backend does not offer the setting at all.
        unsupported: bool,
        message: String,
    },

    /// Backend asks whether a tool may run.
    PermissionRequested {
        request: PermissionRequest,
        responder: PermissionResponder,
    },

    /// The current turn ended. `error` is set when it failed.
    TurnCompleted { error: Option<EngineError> },

    /// Something the adapter could not map.
    Unmapped { kind: String, raw: Value },

    /// Transport closed.
    Exited { error: Option<String> },
}

/// What an engine message carries.
#[derive(Debug)]
pub enum EnginePayload {
    /// Result of the start handshake.
    Started(Result<(EngineAdapter, StartInfo), anyhow::Error>),
    Event(EngineEvent),
}

/// Envelope routed to the registry.
#[derive(Debug)]
pub struct EngineMessage {
    pub session_id: SessionId,
    /// Process generation; messages from replaced processes are dropped.
    pub generation: u64,
    pub payload: EnginePayload,
}

/// Type alias for the inbox sender.
pub type EngineMessageTx = mpsc::UnboundedSender<EngineMessage>;

/// Type alias for the inbox receiver.
pub type EngineMessageRx = mpsc::UnboundedReceiver<EngineMessage>;

/// Creates the registry inbox.
pub fn create_inbox() -> (EngineMessageTx, EngineMessageRx) {
    mpsc::unbounded_channel()
}

/// Adapter-side handle that stamps events with their origin.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: SessionId,
    generation: u64,
    tx: EngineMessageTx,
}

impl EventSink {
    pub fn new(session_id: SessionId, generation: u64, tx: EngineMessageTx) -> Self {
        Self {
            session_id,
            generation,
            tx,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Best-effort send: a closed inbox means the registry is gone.
    pub fn emit(&self, event: EngineEvent) {
        self.send(EnginePayload::Event(event));
    }

    pub fn started(&self, result: anyhow::Result<(EngineAdapter, StartInfo)>) {
        self.send(EnginePayload::Started(result));
    }

    fn send(&self, payload: EnginePayload) {
        let message = EngineMessage {
            session_id: self.session_id.clone(),
            generation: self.generation,
            payload,
        };
        if self.tx.send(message).is_err() {
            tracing::debug!(session = %self.session_id, "registry inbox closed; dropping engine message");
        }
    }
}
