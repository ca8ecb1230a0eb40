//! Canonical timeline entries.
//!
//! Every engine's output is folded into the same entry vocabulary so the
//! presentation layer renders one shape regardless of the backend.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier of a timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Base64 image attached to a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    pub data: String,
}

/// Step executed inside a delegated (sub-agent) tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubStep {
    Text {
        text: String,
    },
    Tool {
        tool_use_id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// One entry of a session timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalMessage {
    User {
        id: MessageId,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageAttachment>,
        /// Waiting for the engine to accept it.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        queued: bool,
        /// Opaque checkpoint reference for engines that support rewinding.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint: Option<String>,
        ts: DateTime<Utc>,
    },
    Assistant {
        id: MessageId,
        text: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reasoning: String,
        /// Still receiving fragments. Cleared once the entry is complete.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        streaming: bool,
        ts: DateTime<Utc>,
    },
    Tool {
        id: MessageId,
        tool_use_id: String,
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        /// Nested steps of a delegated task.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        steps: Vec<SubStep>,
        ts: DateTime<Utc>,
    },
    /// Result whose invocation never reached this timeline.
    ToolResult {
        id: MessageId,
        tool_use_id: String,
        output: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        ts: DateTime<Utc>,
    },
    System {
        id: MessageId,
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        ts: DateTime<Utc>,
    },
    Compaction {
        id: MessageId,
        summary: String,
        ts: DateTime<Utc>,
    },
}

impl CanonicalMessage {
    pub fn user(text: impl Into<String>, images: Vec<ImageAttachment>, queued: bool) -> Self {
        CanonicalMessage::User {
            id: MessageId::new(),
            text: text.into(),
            images,
            queued,
            checkpoint: None,
            ts: Utc::now(),
        }
    }

    pub fn assistant() -> Self {
        CanonicalMessage::Assistant {
            id: MessageId::new(),
            text: String::new(),
            reasoning: String::new(),
            streaming: true,
            ts: Utc::now(),
        }
    }

    pub fn tool(tool_use_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        CanonicalMessage::Tool {
            id: MessageId::new(),
            tool_use_id: tool_use_id.into(),
            name: name.into(),
            input,
            result: None,
            is_error: false,
            steps: Vec::new(),
            ts: Utc::now(),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, output: Value, is_error: bool) -> Self {
        CanonicalMessage::ToolResult {
            id: MessageId::new(),
            tool_use_id: tool_use_id.into(),
            output,
            is_error,
            ts: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        CanonicalMessage::System {
            id: MessageId::new(),
            text: text.into(),
            is_error: false,
            ts: Utc::now(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        CanonicalMessage::System {
            id: MessageId::new(),
            text: text.into(),
            is_error: true,
            ts: Utc::now(),
        }
    }

    pub fn compaction(summary: impl Into<String>) -> Self {
        CanonicalMessage::Compaction {
            id: MessageId::new(),
            summary: summary.into(),
            ts: Utc::now(),
        }
    }

    pub fn id(&self) -> &MessageId {
        match self {
            CanonicalMessage::User { id, .. }
            | CanonicalMessage::Assistant { id, .. }
            | CanonicalMessage::Tool { id, .. }
            | CanonicalMessage::ToolResult { id, .. }
            | CanonicalMessage::System { id, .. }
            | CanonicalMessage::Compaction { id, .. } => id,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            CanonicalMessage::User { ts, .. }
            | CanonicalMessage::Assistant { ts, .. }
            | CanonicalMessage::Tool { ts, .. }
            | CanonicalMessage::ToolResult { ts, .. }
            | CanonicalMessage::System { ts, .. }
            | CanonicalMessage::Compaction { ts, .. } => *ts,
        }
    }
}

/// Ordered, append-only list of entries with id lookup.
///
/// Entries are never reordered or removed; only the entry that is currently
/// streaming (and tool entries receiving results) are mutated in place.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    messages: Vec<CanonicalMessage>,
    index: HashMap<MessageId, usize>,
}

impl PartialEq for Timeline {
    fn eq(&self, other: &Self) -> bool {
        self.messages == other.messages
    }
}

impl Timeline {
    pub fn from_messages(messages: Vec<CanonicalMessage>) -> Self {
        let index = messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id().clone(), i))
            .collect();
        Self { messages, index }
    }

    /// Appends an entry and returns its id.
    pub fn push(&mut self, message: CanonicalMessage) -> MessageId {
        let id = message.id().clone();
        debug_assert!(!self.index.contains_key(&id), "duplicate message id {id}");
        self.index.insert(id.clone(), self.messages.len());
        self.messages.push(message);
        id
    }

    pub fn get(&self, id: &MessageId) -> Option<&CanonicalMessage> {
        self.index.get(id).map(|&i| &self.messages[i])
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut CanonicalMessage> {
        self.index.get(id).map(|&i| &mut self.messages[i])
    }

    pub fn last(&self) -> Option<&CanonicalMessage> {
        self.messages.last()
    }

    pub fn messages(&self) -> &[CanonicalMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Flips the queued flag of a user entry once the engine accepted it.
    pub fn mark_sent(&mut self, id: &MessageId) {
        if let Some(CanonicalMessage::User { queued, .. }) = self.get_mut(id) {
            *queued = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn lookup_survives_reload() {
        let mut timeline = Timeline::default();
        let first = timeline.push(CanonicalMessage::user("hi", Vec::new(), false));
        let tool = timeline.push(CanonicalMessage::tool("t1", "Bash", json!({"command": "ls"})));

        let reloaded = Timeline::from_messages(timeline.messages().to_vec());
        assert_eq!(reloaded, timeline);
        assert!(matches!(reloaded.get(&first), Some(CanonicalMessage::User { .. })));
        assert!(matches!(reloaded.get(&tool), Some(CanonicalMessage::Tool { .. })));
    }

    #[test]
    fn mark_sent_clears_queued_flag() {
        let mut timeline = Timeline::default();
        let id = timeline.push(CanonicalMessage::user("later", Vec::new(), true));
        timeline.mark_sent(&id);
        assert!(matches!(
            timeline.get(&id),
            Some(CanonicalMessage::User { queued: false, .. })
        ));
    }

    #[test]
    fn entries_serialize_with_type_tag_and_skip_defaults() {
        let message = CanonicalMessage::system("hello");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "system");
        assert!(value.get("is_error").is_none());

        let back: CanonicalMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }
}
