//! Engine adapters.
//!
//! Each adapter drives one backend family over its own wire protocol and
//! emits normalized [`EngineEvent`](crate::core::events::EngineEvent)s.
//! Commands (`send`, `interrupt`, `set_mode`, `set_model`) never block:
//! completions and failures come back through the event sink.

pub mod acp;
pub mod claude;
pub mod codex;
pub mod rpc;
pub mod tool_names;
pub mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::EngineLaunchConfig;
use crate::core::error::EngineError;
use crate::core::events::EventSink;
use crate::core::session::{EngineKind, SessionId};
use crate::core::timeline::ImageAttachment;
use transport::{LaunchSpec, Transport};

/// Upper bound for a start handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything an adapter needs to start a backend.
#[derive(Debug, Clone)]
pub struct StartConfig {
    pub session_id: SessionId,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub mode: Option<String>,
    /// Backend conversation to resume.
    pub resume: Option<String>,
    pub launch: EngineLaunchConfig,
}

impl StartConfig {
    fn env(&self) -> Vec<(String, String)> {
        self.launch
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartInfo {
    /// Backend conversation id to store as the resume handle.
    pub resume_id: Option<String>,
    /// Model the backend reports it is using.
    pub model: Option<String>,
}

/// Whether a backend honored a runtime setting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    Applied,
    Unsupported,
}

/// A runtime setting of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Mode,
    Model,
}

impl Setting {
    pub fn name(self) -> &'static str {
        match self {
            Setting::Mode => "mode",
            Setting::Model => "model",
        }
    }
}

/// A connected backend.
#[derive(Debug)]
pub enum EngineAdapter {
    Claude(claude::ClaudeAdapter),
    Acp(acp::AcpAdapter),
    Codex(codex::CodexAdapter),
}

impl EngineAdapter {
    /// Command line for a backend.
    pub fn launch_spec(kind: EngineKind, config: &StartConfig) -> LaunchSpec {
        match kind {
            EngineKind::Claude => claude::launch_spec(config),
            EngineKind::Acp => acp::launch_spec(config),
            EngineKind::Codex => codex::launch_spec(config),
        }
    }

    /// Runs the start handshake over an opened transport.
    pub async fn start(
        kind: EngineKind,
        config: StartConfig,
        transport: Transport,
        sink: EventSink,
    ) -> Result<(Self, StartInfo)> {
        let handshake = async {
            match kind {
                EngineKind::Claude => claude::ClaudeAdapter::start(config, transport, sink)
                    .await
                    .map(|(a, info)| (EngineAdapter::Claude(a), info)),
                EngineKind::Acp => acp::AcpAdapter::start(config, transport, sink)
                    .await
                    .map(|(a, info)| (EngineAdapter::Acp(a), info)),
                EngineKind::Codex => codex::CodexAdapter::start(config, transport, sink)
                    .await
                    .map(|(a, info)| (EngineAdapter::Codex(a), info)),
            }
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|elapsed| {
                anyhow::Error::new(EngineError::spawn(format!(
                    "{kind} did not finish its handshake within {}s ({elapsed})",
                    HANDSHAKE_TIMEOUT.as_secs()
                )))
            })?
            .with_context(|| format!("Failed to start {kind}"))
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            EngineAdapter::Claude(_) => EngineKind::Claude,
            EngineAdapter::Acp(_) => EngineKind::Acp,
            EngineAdapter::Codex(_) => EngineKind::Codex,
        }
    }

    /// Starts a turn. Completion arrives as `TurnCompleted`.
    pub fn send(&mut self, text: &str, images: &[ImageAttachment]) -> Result<()> {
        match self {
            EngineAdapter::Claude(adapter) => adapter.send(text, images),
            EngineAdapter::Acp(adapter) => adapter.send(text, images),
            EngineAdapter::Codex(adapter) => adapter.send(text, images),
        }
    }

    pub fn interrupt(&mut self) -> Result<()> {
        match self {
            EngineAdapter::Claude(adapter) => adapter.interrupt(),
            EngineAdapter::Acp(adapter) => adapter.interrupt(),
            EngineAdapter::Codex(adapter) => adapter.interrupt(),
        }
    }

    pub fn set_mode(&mut self, mode: &str) -> Result<ConfigChange> {
        match self {
            EngineAdapter::Claude(adapter) => adapter.set_mode(mode),
            EngineAdapter::Acp(adapter) => adapter.set_mode(mode),
            EngineAdapter::Codex(adapter) => Ok(adapter.set_mode(mode)),
        }
    }

    pub fn set_model(&mut self, model: &str) -> Result<ConfigChange> {
        match self {
            EngineAdapter::Claude(adapter) => adapter.set_model(model),
            EngineAdapter::Acp(adapter) => adapter.set_model(model),
            EngineAdapter::Codex(adapter) => Ok(adapter.set_model(model)),
        }
    }

    /// Terminates the backend process.
    pub fn stop(&mut self) {
        match self {
            EngineAdapter::Claude(adapter) => adapter.stop(),
            EngineAdapter::Acp(adapter) => adapter.stop(),
            EngineAdapter::Codex(adapter) => adapter.stop(),
        }
    }
}

/// Whether backend output reads like a missing-credentials failure.
pub(crate) fn looks_like_auth_failure(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    [
        "invalid api key",
        "not logged in",
        "please run /login",
        "please log in",
        "authentication",
        "unauthorized",
        "api key",
        "login required",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

/// Error for a transport that closed before the handshake finished.
pub(crate) fn closed_during_handshake(kind: EngineKind, error: Option<String>) -> EngineError {
    let detail = error.unwrap_or_else(|| "no output".to_string());
    if looks_like_auth_failure(&detail) {
        EngineError::auth(format!("{kind} requires authentication")).with_details(detail)
    } else {
        EngineError::spawn(format!("{kind} exited during startup")).with_details(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_handshake_detects_auth() {
        let err = closed_during_handshake(
            EngineKind::Claude,
            Some("Invalid API key · Please run /login".to_string()),
        );
        assert_eq!(err.kind, crate::core::error::EngineErrorKind::Auth);

        let err = closed_during_handshake(EngineKind::Codex, None);
        assert_eq!(err.kind, crate::core::error::EngineErrorKind::Spawn);
        assert_eq!(err.details.as_deref(), Some("no output"));
    }
}
