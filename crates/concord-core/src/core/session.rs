//! Session identity, metadata and live state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::assembler::StreamingAssembler;
use crate::core::persistence::{PersistedSession, SCHEMA_VERSION};
use crate::core::timeline::{CanonicalMessage, Timeline};

/// Stable, unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supported backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Claude Code CLI over line-delimited stream JSON.
    Claude,
    /// Any agent speaking the Agent Client Protocol over JSON-RPC.
    Acp,
    /// Codex app-server over JSON-RPC.
    Codex,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::Claude, EngineKind::Acp, EngineKind::Codex];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Claude => "claude",
            EngineKind::Acp => "acp",
            EngineKind::Codex => "codex",
        }
    }

    /// Whether "allow for this session" grants are remembered and reused
    /// without asking again.
    pub fn remembers_session_grants(self) -> bool {
        matches!(self, EngineKind::Codex)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => Ok(EngineKind::Claude),
            "acp" | "gemini" => Ok(EngineKind::Acp),
            "codex" => Ok(EngineKind::Codex),
            other => anyhow::bail!("Unknown engine '{other}' (expected claude, acp or codex)"),
        }
    }
}

/// Backend-specific token used to reattach to a prior conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeHandle {
    pub engine: EngineKind,
    pub id: String,
}

/// Persisted session metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    /// Project directory the backend runs in.
    pub project_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub engine: EngineKind,
    pub model: Option<String>,
    pub cost_usd: f64,
    pub resume: Option<ResumeHandle>,
}

impl SessionMeta {
    pub fn new(project_id: impl Into<String>, engine: EngineKind, model: Option<String>) -> Self {
        Self {
            id: SessionId::new(),
            project_id: project_id.into(),
            title: String::new(),
            created_at: Utc::now(),
            last_message_at: None,
            engine,
            model,
            cost_usd: 0.0,
            resume: None,
        }
    }

    /// Resume id usable by the current engine, if any.
    pub fn resume_id(&self) -> Option<&str> {
        self.resume
            .as_ref()
            .filter(|handle| handle.engine == self.engine)
            .map(|handle| handle.id.as_str())
    }
}

const TITLE_MAX_CHARS: usize = 64;

/// Derives a title from the first line of the first user message.
///
/// Truncates at a word boundary when the line is longer than the limit.
pub fn title_from_message(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }

    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end(),
        _ => cut.as_str(),
    };
    format!("{trimmed}…")
}

/// Everything the registry knows about one session.
///
/// The foreground session owns one of these directly; background sessions
/// keep theirs in the [`BackgroundStore`](crate::core::background::BackgroundStore).
#[derive(Debug, Clone)]
pub struct SessionState {
    pub meta: SessionMeta,
    pub timeline: Timeline,
    /// A turn is in flight.
    pub processing: bool,
    /// The backend handshake completed and the process is alive.
    pub connected: bool,
    /// Mode requested for this session (applied on the next start too).
    pub mode: Option<String>,
    pub(crate) assembler: StreamingAssembler,
    /// Settings already reported as unsupported by this session's engine.
    pub(crate) reported_unsupported: BTreeSet<String>,
}

impl SessionState {
    pub fn new(meta: SessionMeta, merge_reasoning_passes: bool) -> Self {
        Self {
            meta,
            timeline: Timeline::default(),
            processing: false,
            connected: false,
            mode: None,
            assembler: StreamingAssembler::new(merge_reasoning_passes),
            reported_unsupported: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.meta.id
    }

    /// Rebuilds an inert session from its file.
    pub fn from_record(mut record: PersistedSession, merge_reasoning_passes: bool) -> Self {
        // A file written mid-turn may still mark an entry as open.
        for message in &mut record.messages {
            if let CanonicalMessage::Assistant { streaming, .. } = message {
                *streaming = false;
            }
        }
        let meta = SessionMeta {
            id: record.id,
            project_id: record.project_id,
            title: record.title,
            created_at: record.created_at,
            last_message_at: record.last_message_at,
            engine: record.engine,
            model: record.model,
            cost_usd: record.cost_usd,
            resume: record.resume,
        };
        let mut state = Self::new(meta, merge_reasoning_passes);
        state.timeline = Timeline::from_messages(record.messages);
        state.assembler.index_existing(&state.timeline);
        state
    }

    pub fn to_record(&self) -> PersistedSession {
        PersistedSession {
            schema_version: SCHEMA_VERSION,
            id: self.meta.id.clone(),
            project_id: self.meta.project_id.clone(),
            title: self.meta.title.clone(),
            created_at: self.meta.created_at,
            last_message_at: self.meta.last_message_at,
            engine: self.meta.engine,
            model: self.meta.model.clone(),
            cost_usd: self.meta.cost_usd,
            resume: self.meta.resume.clone(),
            messages: self.timeline.messages().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_titles_are_kept() {
        assert_eq!(title_from_message("\n  fix the build  \nmore"), "fix the build");
    }

    #[test]
    fn long_titles_break_on_a_word() {
        let text = "refactor the session registry so that background sessions keep streaming while hidden";
        let title = title_from_message(text);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 1);
        assert!(text.starts_with(title.trim_end_matches('…')));
        assert!(!title.trim_end_matches('…').ends_with(' '));
    }

    #[test]
    fn engine_kind_parses_aliases() {
        assert_eq!("Claude".parse::<EngineKind>().unwrap(), EngineKind::Claude);
        assert_eq!("gemini".parse::<EngineKind>().unwrap(), EngineKind::Acp);
        assert!("gpt".parse::<EngineKind>().is_err());
    }

    #[test]
    fn resume_handle_is_ignored_after_engine_switch() {
        let mut meta = SessionMeta::new("/tmp/p", EngineKind::Claude, None);
        meta.resume = Some(ResumeHandle {
            engine: EngineKind::Claude,
            id: "abc".to_string(),
        });
        assert_eq!(meta.resume_id(), Some("abc"));
        meta.engine = EngineKind::Codex;
        assert_eq!(meta.resume_id(), None);
    }

    #[test]
    fn reloaded_sessions_have_no_open_assistant_entry() {
        let mut live = SessionState::new(SessionMeta::new("/tmp/p", EngineKind::Claude, None), true);
        live.timeline.push(CanonicalMessage::user("hi", Vec::new(), false));
        live.timeline.push(CanonicalMessage::assistant());
        let record = live.to_record();
        assert!(matches!(
            record.messages.last(),
            Some(CanonicalMessage::Assistant { streaming: true, .. })
        ));

        let reloaded = SessionState::from_record(record, true);
        assert_eq!(reloaded.timeline.len(), 2);
        assert!(matches!(
            reloaded.timeline.messages().last(),
            Some(CanonicalMessage::Assistant { streaming: false, .. })
        ));
    }
}
