//! Session files on disk.
//!
//! Layout: `${CONCORD_HOME}/projects/<project-key>/<session-id>.json`, where
//! the project key is the sanitized project path plus a short hash so two
//! paths that sanitize alike never share a directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::paths;
use crate::core::session::{EngineKind, ResumeHandle, SessionId};
use crate::core::timeline::CanonicalMessage;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

const PROJECT_KEY_MAX_CHARS: usize = 48;

/// Full persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub schema_version: u32,
    pub id: SessionId,
    pub project_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub engine: EngineKind,
    pub model: Option<String>,
    pub cost_usd: f64,
    pub resume: Option<ResumeHandle>,
    pub messages: Vec<CanonicalMessage>,
}

/// Listing view of a persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub project_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub engine: EngineKind,
    pub model: Option<String>,
    pub cost_usd: f64,
}

impl SessionSummary {
    /// Timestamp used to order listings (most recent first).
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

impl From<&PersistedSession> for SessionSummary {
    fn from(record: &PersistedSession) -> Self {
        Self {
            id: record.id.clone(),
            project_id: record.project_id.clone(),
            title: record.title.clone(),
            created_at: record.created_at,
            last_message_at: record.last_message_at,
            engine: record.engine,
            model: record.model.clone(),
            cost_usd: record.cost_usd,
        }
    }
}

/// Directory name for a project path.
pub fn project_key(project_id: &str) -> String {
    let mut sanitized: String = project_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string();
    if sanitized.chars().count() > PROJECT_KEY_MAX_CHARS {
        sanitized = sanitized
            .chars()
            .rev()
            .take(PROJECT_KEY_MAX_CHARS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
    }
    if sanitized.is_empty() {
        sanitized.push_str("project");
    }

    let digest = Sha256::digest(project_id.as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("{sanitized}-{hash}")
}

/// Reads and writes session files below one root directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(paths::projects_dir())
    }
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, project_id: &str, id: &SessionId) -> PathBuf {
        self.root
            .join(project_key(project_id))
            .join(format!("{id}.json"))
    }

    /// Writes a session atomically (temp file in the same directory, then rename).
    pub fn save(&self, record: &PersistedSession) -> Result<()> {
        let path = self.session_path(&record.project_id, &record.id);
        let dir = path
            .parent()
            .context("Session path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let contents =
            serde_json::to_string_pretty(record).context("Failed to serialize session")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(contents.as_bytes())
            .context("Failed to write session")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, project_id: &str, id: &SessionId) -> Result<PersistedSession> {
        read_record(&self.session_path(project_id, id))
    }

    /// Finds a session by id in any project.
    pub fn find(&self, id: &SessionId) -> Result<Option<PersistedSession>> {
        let file_name = format!("{id}.json");
        for dir in self.project_dirs()? {
            let path = dir.join(&file_name);
            if path.is_file() {
                return read_record(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Lists sessions, most recent first. Unreadable files are skipped.
    pub fn list(&self, project_id: Option<&str>) -> Result<Vec<SessionSummary>> {
        let dirs = match project_id {
            Some(project) => vec![self.root.join(project_key(project))],
            None => self.project_dirs()?,
        };

        let mut summaries = Vec::new();
        for dir in dirs {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                match read_record(&path) {
                    Ok(record) => summaries.push(SessionSummary::from(&record)),
                    Err(e) => tracing::warn!(path = %path.display(), "skipping session file: {e:#}"),
                }
            }
        }

        summaries.sort_by_key(|s| std::cmp::Reverse(s.last_activity()));
        Ok(summaries)
    }

    /// Removes a session file. Returns whether one existed.
    pub fn delete(&self, project_id: &str, id: &SessionId) -> Result<bool> {
        let path = self.session_path(project_id, id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        Ok(true)
    }

    fn project_dirs(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?;
        Ok(entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect())
    }
}

fn read_record(path: &Path) -> Result<PersistedSession> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let record: PersistedSession = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if record.schema_version > SCHEMA_VERSION {
        bail!(
            "{} uses schema version {} (newest supported is {SCHEMA_VERSION})",
            path.display(),
            record.schema_version
        );
    }
    Ok(record)
}
