//! Engine error taxonomy.
//!
//! Adapters return `anyhow::Result`; failures that the registry must react to
//! differently are raised as an [`EngineError`] and recovered with
//! `downcast_ref`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Categories of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// Backend process or connection could not be established.
    Spawn,
    /// Backend requires credentials it does not have.
    Auth,
    /// Backend emitted something the adapter cannot map.
    ProtocolViolation,
    /// Backend cannot resume the stored conversation.
    Revival,
    /// Backend refuses an overlapping turn.
    Busy,
    /// Transport closed or a write failed mid-session.
    Transport,
    /// Backend answered a request with an error.
    Rejected,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineErrorKind::Spawn => write!(f, "spawn"),
            EngineErrorKind::Auth => write!(f, "auth"),
            EngineErrorKind::ProtocolViolation => write!(f, "protocol_violation"),
            EngineErrorKind::Revival => write!(f, "revival"),
            EngineErrorKind::Busy => write!(f, "busy"),
            EngineErrorKind::Transport => write!(f, "transport"),
            EngineErrorKind::Rejected => write!(f, "rejected"),
        }
    }
}

/// Structured engine error with kind and details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (stderr tail, raw error body)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        if !details.trim().is_empty() {
            self.details = Some(details);
        }
        self
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Spawn, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Auth, message)
    }

    pub fn revival(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Revival, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Busy, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Transport, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Rejected, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::ProtocolViolation, message)
    }

    /// Returns the kind of an engine error buried in an `anyhow` chain.
    pub fn kind_of(err: &anyhow::Error) -> Option<EngineErrorKind> {
        Self::find(err).map(|e| e.kind)
    }

    /// Finds an engine error attached as the source or as context.
    pub fn find(err: &anyhow::Error) -> Option<&EngineError> {
        err.downcast_ref::<EngineError>().or_else(|| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<EngineError>())
        })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EngineError {}
