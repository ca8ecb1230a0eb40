//! Session registry.
//!
//! Owns every session the process knows about: the foreground session, the
//! live sessions parked in the [`BackgroundStore`], and their backends.
//! Engine events arrive tagged with session id and process generation on one
//! inbox; the caller drives the registry with [`SessionRegistry::next_message`]
//! and [`SessionRegistry::handle`], so every mutation runs on one task.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::core::assembler::ContentKind;
use crate::core::background::BackgroundStore;
use crate::core::error::{EngineError, EngineErrorKind};
use crate::core::events::{
    EngineEvent, EngineMessage, EngineMessageRx, EngineMessageTx, EnginePayload, EventSink,
    create_inbox,
};
use crate::core::permissions::{
    Admission, OptionKind, PermissionBridge, PermissionPolicy, PermissionRequest,
    PermissionResolution, PermissionResponder, ResolutionOrigin, ResolveOutcome,
};
use crate::core::persistence::{SessionStore, SessionSummary};
use crate::core::session::{
    EngineKind, ResumeHandle, SessionId, SessionMeta, SessionState, title_from_message,
};
use crate::core::timeline::{CanonicalMessage, ImageAttachment, MessageId};
use crate::engines::transport::{ProcessTransportFactory, TransportFactory};
use crate::engines::{ConfigChange, EngineAdapter, Setting, StartConfig, StartInfo};

#[cfg(test)]
mod tests;

/// Opening a backend is attempted at most this many times in a row.
const MAX_SPAWN_ATTEMPTS: u32 = 2;
const NOTICE_CAPACITY: usize = 256;

/// Engine and initial settings for a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSelection {
    pub kind: EngineKind,
    pub model: Option<String>,
    pub mode: Option<String>,
}

impl EngineSelection {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            model: None,
            mode: None,
        }
    }
}

/// Read-only notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryNotice {
    ForegroundTimelineChanged {
        session_id: SessionId,
    },
    SessionListChanged,
    /// A request became the pending one for its session.
    PermissionRequested {
        request: PermissionRequest,
    },
    /// The backend needs credentials; offer a login rather than an error.
    AuthRequired {
        session_id: SessionId,
        engine: EngineKind,
        message: String,
    },
    /// The session lost its backend and is inert until the next send.
    SessionFailed {
        session_id: SessionId,
        error: EngineError,
    },
}

enum Link {
    Connecting,
    Ready(EngineAdapter),
}

struct QueuedSend {
    entry: MessageId,
    text: String,
    images: Vec<ImageAttachment>,
}

/// A session with a backend process (starting or running).
struct LiveSession {
    generation: u64,
    link: Link,
    /// Sends waiting for the backend to be idle, in submission order.
    outbox: VecDeque<QueuedSend>,
    spawn_attempts: u32,
    /// Tool names granted for the rest of the session.
    grants: HashSet<String>,
}

impl LiveSession {
    fn adapter(&mut self) -> Option<&mut EngineAdapter> {
        match &mut self.link {
            Link::Ready(adapter) => Some(adapter),
            Link::Connecting => None,
        }
    }
}

pub struct SessionRegistry {
    config: Config,
    store: SessionStore,
    factory: Arc<dyn TransportFactory>,
    inbox_tx: EngineMessageTx,
    inbox_rx: EngineMessageRx,
    live: HashMap<SessionId, LiveSession>,
    foreground: Option<SessionState>,
    background: BackgroundStore,
    bridge: PermissionBridge,
    notices: broadcast::Sender<RegistryNotice>,
    next_generation: u64,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("foreground", &self.foreground.as_ref().map(SessionState::id))
            .field("live", &self.live.len())
            .field("background", &self.background.len())
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

/// Finds a session's in-memory state without borrowing the whole registry.
fn state_of<'a>(
    foreground: &'a mut Option<SessionState>,
    background: &'a mut BackgroundStore,
    id: &SessionId,
) -> Option<&'a mut SessionState> {
    match foreground {
        Some(state) if state.id() == id => Some(state),
        _ => background.get_mut(id),
    }
}

impl SessionRegistry {
    pub fn new(config: Config, store: SessionStore, factory: Arc<dyn TransportFactory>) -> Self {
        let (inbox_tx, inbox_rx) = create_inbox();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let bridge = PermissionBridge::new(config.permission_policy);
        Self {
            config,
            store,
            factory,
            inbox_tx,
            inbox_rx,
            live: HashMap::new(),
            foreground: None,
            background: BackgroundStore::default(),
            bridge,
            notices,
            next_generation: 0,
        }
    }

    /// Registry backed by real engine processes and the default session directory.
    pub fn with_defaults(config: Config) -> Self {
        Self::new(
            config,
            SessionStore::default(),
            Arc::new(ProcessTransportFactory),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryNotice> {
        self.notices.subscribe()
    }

    pub fn foreground(&self) -> Option<&SessionState> {
        self.foreground.as_ref()
    }

    pub fn session_state(&self, id: &SessionId) -> Option<&SessionState> {
        match &self.foreground {
            Some(state) if state.id() == id => Some(state),
            _ => self.background.get(id),
        }
    }

    pub fn is_live(&self, id: &SessionId) -> bool {
        self.live.contains_key(id)
    }

    pub fn pending_permission(&self, id: &SessionId) -> Option<&PermissionRequest> {
        self.bridge.pending(id)
    }

    pub fn queued_sends(&self, id: &SessionId) -> usize {
        self.live.get(id).map_or(0, |live| live.outbox.len())
    }

    pub fn permission_policy(&self) -> PermissionPolicy {
        self.bridge.policy()
    }

    pub fn set_permission_policy(&mut self, policy: PermissionPolicy) {
        self.bridge.set_policy(policy);
    }

    /// Creates a session, starts its backend and makes it the foreground.
    ///
    /// A backend that cannot be spawned leaves the session in place with an
    /// error entry; it is retried on the next send.
    pub fn create_session(&mut self, project_id: &str, selection: EngineSelection) -> SessionId {
        let model = selection
            .model
            .or_else(|| self.config.engines.get(selection.kind).model.clone());
        let meta = SessionMeta::new(project_id, selection.kind, model);
        let mut state = SessionState::new(meta, self.config.merge_reasoning_passes);
        state.mode = selection.mode;
        let id = state.id().clone();
        tracing::info!(session = %id, engine = %selection.kind, project = project_id, "creating session");

        self.set_foreground(state);
        if let Err(e) = self.connect(&id) {
            self.fail_session(&id, engine_error(&e));
        }
        self.notify(RegistryNotice::SessionListChanged);
        self.notify_timeline(&id);
        id
    }

    /// Makes `id` the foreground session.
    ///
    /// Live sessions come back from the background store as they were;
    /// others are loaded from disk and stay inert until the next send.
    pub fn switch_session(&mut self, id: &SessionId) -> Result<()> {
        if self.foreground.as_ref().is_some_and(|s| s.id() == id) {
            return Ok(());
        }

        let state = match self.background.restore(id) {
            Some(state) => state,
            None => {
                let record = self
                    .store
                    .find(id)?
                    .with_context(|| format!("Unknown session '{id}'"))?;
                SessionState::from_record(record, self.config.merge_reasoning_passes)
            }
        };
        tracing::debug!(session = %id, live = self.live.contains_key(id), "switching session");

        self.set_foreground(state);
        self.notify_timeline(id);
        if let Some(request) = self.bridge.pending(id) {
            self.notify(RegistryNotice::PermissionRequested {
                request: request.clone(),
            });
        }
        Ok(())
    }

    /// Stops the backend, deletes the session file and forgets the session.
    pub fn delete_session(&mut self, id: &SessionId) -> Result<()> {
        let project_id = match self.session_state(id) {
            Some(state) => Some(state.meta.project_id.clone()),
            None => self.store.find(id)?.map(|record| record.project_id),
        };

        self.teardown(id, "Session deleted");
        self.background.evict(id);
        let was_foreground = self.foreground.as_ref().is_some_and(|s| s.id() == id);
        if was_foreground {
            self.foreground = None;
        }

        let Some(project_id) = project_id else {
            bail!("Unknown session '{id}'");
        };
        self.store.delete(&project_id, id)?;
        tracing::info!(session = %id, "deleted session");

        self.notify(RegistryNotice::SessionListChanged);
        if was_foreground {
            self.notify(RegistryNotice::ForegroundTimelineChanged {
                session_id: id.clone(),
            });
        }
        Ok(())
    }

    /// Sends a user turn.
    ///
    /// Goes out at once when the backend is idle; otherwise the entry is
    /// marked queued and flushed when earlier turns complete. Sending to an
    /// inert session restarts its backend first.
    pub fn send(&mut self, id: &SessionId, text: &str, images: Vec<ImageAttachment>) -> Result<()> {
        if text.trim().is_empty() && images.is_empty() {
            bail!("Nothing to send");
        }
        let Some(state) = state_of(&mut self.foreground, &mut self.background, id) else {
            bail!("Session '{id}' is not open");
        };

        let live = self.live.get(id);
        let dispatch_now = !state.processing
            && live.is_some_and(|l| matches!(l.link, Link::Ready(_)) && l.outbox.is_empty());

        if state.meta.title.is_empty() {
            state.meta.title = title_from_message(text);
        }
        state.meta.last_message_at = Some(Utc::now());
        let message = CanonicalMessage::user(text, images.clone(), !dispatch_now);
        let entry = if dispatch_now {
            state.assembler.push(&mut state.timeline, message)
        } else {
            // Queued entries do not cut into a streaming reply.
            state.timeline.push(message)
        };
        let first_entry = state.timeline.len() == 1;
        if first_entry {
            self.persist(id);
            self.notify(RegistryNotice::SessionListChanged);
        }

        let queued = QueuedSend {
            entry,
            text: text.to_string(),
            images,
        };
        let result = if dispatch_now {
            self.dispatch(id, queued)
        } else if let Some(live) = self.live.get_mut(id) {
            live.outbox.push_back(queued);
            Ok(())
        } else {
            self.revive(id, queued)
        };
        self.notify_timeline(id);
        result
    }

    /// Cancels the running turn.
    ///
    /// Every open permission request of the session is denied before the
    /// backend is signalled. Queued sends stay queued.
    pub fn interrupt(&mut self, id: &SessionId) -> Result<()> {
        let denied = self.bridge.deny_all(id, "Interrupted by user");
        if denied > 0 {
            tracing::debug!(session = %id, denied, "denied pending permissions before interrupt");
        }
        let Some(adapter) = self.live.get_mut(id).and_then(LiveSession::adapter) else {
            return Ok(());
        };
        adapter
            .interrupt()
            .with_context(|| format!("Failed to interrupt session '{id}'"))
    }

    /// Answers the pending permission request `request_id`.
    pub fn respond_permission(
        &mut self,
        request_id: &str,
        decision: OptionKind,
        message: Option<String>,
    ) -> Result<()> {
        match self.bridge.resolve(request_id, decision, message)? {
            ResolveOutcome::AlreadyResolved => {
                tracing::debug!(request = request_id, "permission already resolved");
            }
            ResolveOutcome::Resolved {
                request,
                resolution,
                next,
            } => {
                let remembers = self
                    .session_state(&request.session_id)
                    .is_some_and(|s| s.meta.engine.remembers_session_grants());
                if remembers
                    && resolution.decision == OptionKind::AllowAlways
                    && let Some(live) = self.live.get_mut(&request.session_id)
                {
                    live.grants.insert(request.tool_name.clone());
                }
                if let Some(next) = next {
                    self.notify(RegistryNotice::PermissionRequested { request: next });
                }
            }
        }
        Ok(())
    }

    /// Changes the model. Unsupported runtime changes are reported once per
    /// session and leave the model as it was.
    pub fn set_model(&mut self, id: &SessionId, model: &str) -> Result<ConfigChange> {
        let change = match self.live.get_mut(id).and_then(LiveSession::adapter) {
            Some(adapter) => adapter.set_model(model)?,
            None => ConfigChange::Applied,
        };
        let state = state_of(&mut self.foreground, &mut self.background, id)
            .with_context(|| format!("Session '{id}' is not open"))?;
        match change {
            ConfigChange::Applied => state.meta.model = Some(model.to_string()),
            ConfigChange::Unsupported => self.report_unsupported(id, "model"),
        }
        Ok(change)
    }

    /// Changes the mode. Same reporting rules as [`Self::set_model`].
    pub fn set_mode(&mut self, id: &SessionId, mode: &str) -> Result<ConfigChange> {
        let change = match self.live.get_mut(id).and_then(LiveSession::adapter) {
            Some(adapter) => adapter.set_mode(mode)?,
            None => ConfigChange::Applied,
        };
        let state = state_of(&mut self.foreground, &mut self.background, id)
            .with_context(|| format!("Session '{id}' is not open"))?;
        match change {
            ConfigChange::Applied => state.mode = Some(mode.to_string()),
            ConfigChange::Unsupported => self.report_unsupported(id, "mode"),
        }
        Ok(change)
    }

    /// Moves a conversation to another engine.
    ///
    /// A backend's engine never changes, so a different engine yields a new
    /// session in the same project. Returns the id of the session to use.
    pub fn set_engine(&mut self, id: &SessionId, selection: EngineSelection) -> Result<SessionId> {
        let state = self
            .session_state(id)
            .with_context(|| format!("Session '{id}' is not open"))?;
        if state.meta.engine == selection.kind {
            if let Some(model) = &selection.model {
                self.set_model(id, model)?;
            }
            return Ok(id.clone());
        }
        let project_id = state.meta.project_id.clone();
        Ok(self.create_session(&project_id, selection))
    }

    pub fn rename_session(&mut self, id: &SessionId, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            bail!("Title cannot be empty");
        }
        if let Some(state) = state_of(&mut self.foreground, &mut self.background, id) {
            title.clone_into(&mut state.meta.title);
            let record = state.to_record();
            self.store.save(&record)?;
        } else {
            let mut record = self
                .store
                .find(id)?
                .with_context(|| format!("Unknown session '{id}'"))?;
            title.clone_into(&mut record.title);
            self.store.save(&record)?;
        }
        self.notify(RegistryNotice::SessionListChanged);
        Ok(())
    }

    /// Persisted and in-memory sessions, most recent first.
    pub fn list_sessions(&self, project_id: Option<&str>) -> Result<Vec<SessionSummary>> {
        let mut summaries = self.store.list(project_id)?;
        let in_memory = self
            .foreground
            .iter()
            .chain(self.background.iter())
            .filter(|s| project_id.is_none_or(|p| s.meta.project_id == p));
        for state in in_memory {
            let summary = SessionSummary::from(&state.to_record());
            match summaries.iter_mut().find(|s| s.id == summary.id) {
                Some(existing) => *existing = summary,
                None => summaries.push(summary),
            }
        }
        summaries.sort_by_key(|s| std::cmp::Reverse(s.last_activity()));
        Ok(summaries)
    }

    /// Waits for the next engine message.
    pub async fn next_message(&mut self) -> Option<EngineMessage> {
        self.inbox_rx.recv().await
    }

    /// Applies one engine message.
    pub fn handle(&mut self, message: EngineMessage) {
        let EngineMessage {
            session_id,
            generation,
            payload,
        } = message;
        let current = self.live.get(&session_id).map(|live| live.generation);
        if current != Some(generation) {
            tracing::debug!(session = %session_id, generation, ?current, "dropping message from stale backend");
            return;
        }

        match payload {
            EnginePayload::Started(Ok((adapter, info))) => self.on_started(&session_id, adapter, info),
            EnginePayload::Started(Err(e)) => self.on_start_failed(&session_id, &e),
            EnginePayload::Event(event) => self.on_event(&session_id, event),
        }
    }

    /// Stops every backend and saves every session.
    pub fn shutdown(&mut self) {
        let ids: Vec<SessionId> = self.live.keys().cloned().collect();
        for id in &ids {
            self.teardown(id, "Shutting down");
        }
        let states = self.foreground.iter().chain(self.background.iter());
        for state in states.filter(|s| !s.timeline.is_empty()) {
            if let Err(e) = self.store.save(&state.to_record()) {
                tracing::warn!(session = %state.id(), "failed to save session on shutdown: {e:#}");
            }
        }
    }

    fn set_foreground(&mut self, state: SessionState) {
        if let Some(previous) = self.foreground.replace(state) {
            if self.live.contains_key(previous.id()) {
                self.background.capture(previous);
            } else if !previous.timeline.is_empty()
                && let Err(e) = self.store.save(&previous.to_record())
            {
                tracing::warn!(session = %previous.id(), "failed to save session: {e:#}");
            }
        }
    }

    /// Opens a transport and starts the handshake in the background.
    fn connect(&mut self, id: &SessionId) -> Result<()> {
        let state = state_of(&mut self.foreground, &mut self.background, id)
            .with_context(|| format!("Session '{id}' is not open"))?;
        let kind = state.meta.engine;
        let launch = self.config.engines.get(kind).clone();
        let start = StartConfig {
            session_id: id.clone(),
            cwd: PathBuf::from(&state.meta.project_id),
            model: state.meta.model.clone().or_else(|| launch.model.clone()),
            mode: state.mode.clone(),
            resume: state.meta.resume_id().map(str::to_string),
            launch,
        };
        state.connected = false;
        let spec = EngineAdapter::launch_spec(kind, &start);

        self.next_generation += 1;
        let generation = self.next_generation;
        let live = self.live.entry(id.clone()).or_insert_with(|| LiveSession {
            generation,
            link: Link::Connecting,
            outbox: VecDeque::new(),
            spawn_attempts: 0,
            grants: HashSet::new(),
        });
        live.generation = generation;
        live.link = Link::Connecting;

        let transport = loop {
            live.spawn_attempts += 1;
            match self.factory.open(kind, &spec) {
                Ok(transport) => break transport,
                Err(e) if live.spawn_attempts < MAX_SPAWN_ATTEMPTS => {
                    tracing::warn!(session = %id, "spawn failed, retrying once: {e:#}");
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(session = %id, engine = %kind, generation, resume = ?start.resume, "starting engine handshake");
        let sink = EventSink::new(id.clone(), generation, self.inbox_tx.clone());
        tokio::spawn(async move {
            let result = EngineAdapter::start(kind, start, transport, sink.clone()).await;
            sink.started(result);
        });
        Ok(())
    }

    /// Restarts the backend of an inert session with `first` queued.
    fn revive(&mut self, id: &SessionId, first: QueuedSend) -> Result<()> {
        tracing::info!(session = %id, "reviving inert session");
        self.live.insert(
            id.clone(),
            LiveSession {
                generation: 0,
                link: Link::Connecting,
                outbox: VecDeque::from([first]),
                spawn_attempts: 0,
                grants: HashSet::new(),
            },
        );
        self.connect(id).inspect_err(|e| {
            self.fail_session(id, engine_error(e));
        })
    }

    fn dispatch(&mut self, id: &SessionId, send: QueuedSend) -> Result<()> {
        let Some(adapter) = self.live.get_mut(id).and_then(LiveSession::adapter) else {
            bail!("Session '{id}' has no running engine");
        };
        let result = adapter.send(&send.text, &send.images);
        let Some(state) = state_of(&mut self.foreground, &mut self.background, id) else {
            return result;
        };
        match &result {
            Ok(()) => {
                state.timeline.mark_sent(&send.entry);
                state.processing = true;
            }
            Err(e) => {
                tracing::warn!(session = %id, "send failed: {e:#}");
                state
                    .assembler
                    .push(&mut state.timeline, CanonicalMessage::error(format!("Send failed: {e:#}")));
            }
        }
        result
    }

    /// Sends the next queued turn when the backend is idle.
    fn flush(&mut self, id: &SessionId) {
        let idle = self
            .session_state(id)
            .is_some_and(|state| !state.processing);
        if !idle {
            return;
        }
        let Some(next) = self
            .live
            .get_mut(id)
            .filter(|live| matches!(live.link, Link::Ready(_)))
            .and_then(|live| live.outbox.pop_front())
        else {
            return;
        };
        if self.dispatch(id, next).is_ok() {
            self.notify_timeline(id);
        }
    }

    fn on_started(&mut self, id: &SessionId, adapter: EngineAdapter, info: StartInfo) {
        let Some(live) = self.live.get_mut(id) else {
            return;
        };
        let kind = adapter.kind();
        live.link = Link::Ready(adapter);
        live.spawn_attempts = 0;

        if let Some(state) = state_of(&mut self.foreground, &mut self.background, id) {
            state.connected = true;
            if let Some(resume_id) = info.resume_id {
                state.meta.resume = Some(ResumeHandle {
                    engine: kind,
                    id: resume_id,
                });
            }
            if info.model.is_some() {
                state.meta.model = info.model;
            }
        }
        tracing::info!(session = %id, engine = %kind, "engine ready");
        self.flush(id);
        self.notify_timeline(id);
    }

    fn on_start_failed(&mut self, id: &SessionId, err: &anyhow::Error) {
        let error = engine_error(err);
        tracing::warn!(session = %id, kind = %error.kind, "engine failed to start: {err:#}");

        match error.kind {
            EngineErrorKind::Revival => {
                if let Some(state) = state_of(&mut self.foreground, &mut self.background, id) {
                    state.meta.resume = None;
                    state.assembler.push(
                        &mut state.timeline,
                        CanonicalMessage::system(
                            "The previous conversation could not be resumed. Started a new one; earlier messages are kept as history.",
                        ),
                    );
                }
                if let Some(live) = self.live.get_mut(id) {
                    live.spawn_attempts = 0;
                }
                if let Err(e) = self.connect(id) {
                    self.fail_session(id, engine_error(&e));
                }
                self.notify_timeline(id);
            }
            EngineErrorKind::Spawn
                if self
                    .live
                    .get(id)
                    .is_some_and(|live| live.spawn_attempts < MAX_SPAWN_ATTEMPTS) =>
            {
                if let Err(e) = self.connect(id) {
                    self.fail_session(id, engine_error(&e));
                }
            }
            _ => self.fail_session(id, error),
        }
    }

    fn on_event(&mut self, id: &SessionId, event: EngineEvent) {
        let Some(state) = state_of(&mut self.foreground, &mut self.background, id) else {
            tracing::debug!(session = %id, "event for a session without state");
            return;
        };
        let timeline = &mut state.timeline;
        let assembler = &mut state.assembler;

        let changed = match event {
            EngineEvent::SessionConfigured { resume_id, model } => {
                if let Some(resume_id) = resume_id {
                    state.meta.resume = Some(ResumeHandle {
                        engine: state.meta.engine,
                        id: resume_id,
                    });
                }
                if model.is_some() {
                    state.meta.model = model;
                }
                false
            }
            EngineEvent::TurnStarted => {
                state.processing = true;
                false
            }
            EngineEvent::Text {
                segment,
                fragment,
                parent_tool_use_id,
            } => assembler.content(
                timeline,
                ContentKind::Text,
                segment,
                fragment,
                parent_tool_use_id.as_deref(),
            ),
            EngineEvent::Reasoning {
                segment,
                fragment,
                parent_tool_use_id,
            } => assembler.content(
                timeline,
                ContentKind::Reasoning,
                segment,
                fragment,
                parent_tool_use_id.as_deref(),
            ),
            EngineEvent::ToolCall {
                tool_use_id,
                name,
                input,
                parent_tool_use_id,
            } => assembler.tool_call(
                timeline,
                &tool_use_id,
                &name,
                input,
                parent_tool_use_id.as_deref(),
            ),
            EngineEvent::ToolCallUpdate {
                tool_use_id,
                name,
                input,
                parent_tool_use_id,
            } => assembler.tool_update(
                timeline,
                &tool_use_id,
                name.as_deref(),
                input,
                parent_tool_use_id.as_deref(),
            ),
            EngineEvent::ToolResult {
                tool_use_id,
                output,
                is_error,
                parent_tool_use_id,
            } => assembler.tool_result(
                timeline,
                &tool_use_id,
                output,
                is_error,
                parent_tool_use_id.as_deref(),
            ),
            EngineEvent::Cost { delta_usd } => {
                state.meta.cost_usd += delta_usd;
                true
            }
            EngineEvent::Compacted { summary } => {
                assembler.push(timeline, CanonicalMessage::compaction(summary));
                true
            }
            EngineEvent::Notice { text, is_error } => {
                let message = if is_error {
                    CanonicalMessage::error(text)
                } else {
                    CanonicalMessage::system(text)
                };
                assembler.push(timeline, message);
                true
            }
            EngineEvent::SettingRejected {
                setting,
                current,
                unsupported,
                message,
            } => {
                tracing::info!(session = %id, setting = setting.name(), "{message}");
                match setting {
                    Setting::Mode => state.mode = current,
                    Setting::Model => state.meta.model = current,
                }
                if unsupported {
                    self.report_unsupported(id, setting.name());
                    return;
                }
                assembler.push(timeline, CanonicalMessage::error(message));
                true
            }
            EngineEvent::Unmapped { kind, raw } => {
                tracing::warn!(session = %id, kind = %kind, "unmapped engine event");
                assembler.unmapped(timeline, &kind, &raw);
                true
            }
            EngineEvent::PermissionRequested { request, responder } => {
                self.on_permission(request, responder);
                return;
            }
            EngineEvent::TurnCompleted { error } => {
                self.on_turn_completed(id, error);
                return;
            }
            EngineEvent::Exited { error } => {
                self.on_exited(id, error);
                return;
            }
        };

        if changed {
            self.notify_timeline(id);
        }
    }

    fn on_permission(&mut self, request: PermissionRequest, responder: PermissionResponder) {
        let session_id = request.session_id.clone();
        let granted = self
            .live
            .get(&session_id)
            .is_some_and(|live| live.grants.contains(&request.tool_name));
        if granted {
            tracing::debug!(session = %session_id, tool = %request.tool_name, "tool granted for session");
            responder.send(PermissionResolution::for_request(
                &request,
                OptionKind::AllowAlways,
                ResolutionOrigin::Policy,
            ));
            return;
        }

        let tool_name = request.tool_name.clone();
        match self.bridge.admit(request, responder) {
            Admission::AutoResolved(resolution) => {
                let remembers = self
                    .session_state(&session_id)
                    .is_some_and(|s| s.meta.engine.remembers_session_grants());
                if remembers
                    && resolution.decision == OptionKind::AllowAlways
                    && let Some(live) = self.live.get_mut(&session_id)
                {
                    live.grants.insert(tool_name);
                }
            }
            Admission::Surfaced(request) => {
                self.notify(RegistryNotice::PermissionRequested { request });
            }
            Admission::Waiting => {}
        }
    }

    fn on_turn_completed(&mut self, id: &SessionId, error: Option<EngineError>) {
        let Some(state) = state_of(&mut self.foreground, &mut self.background, id) else {
            return;
        };
        state.processing = false;
        state.meta.last_message_at = Some(Utc::now());
        state.assembler.finish(&mut state.timeline);
        let engine = state.meta.engine;
        if let Some(error) = &error {
            state
                .assembler
                .push(&mut state.timeline, CanonicalMessage::error(error.message.clone()));
        }

        if let Some(error) = error
            && error.kind == EngineErrorKind::Auth
        {
            self.notify(RegistryNotice::AuthRequired {
                session_id: id.clone(),
                engine,
                message: error.message,
            });
        }
        self.persist(id);
        self.notify_timeline(id);
        self.notify(RegistryNotice::SessionListChanged);
        self.flush(id);
    }

    fn on_exited(&mut self, id: &SessionId, error: Option<String>) {
        if self
            .live
            .get(id)
            .is_some_and(|live| matches!(live.link, Link::Connecting))
        {
            // The handshake reports the failure itself.
            return;
        }
        let detail = error.unwrap_or_else(|| "no error output".to_string());
        let error = EngineError::transport("The engine exited unexpectedly").with_details(detail);
        self.fail_session(id, error);
    }

    /// Drops the backend and leaves the session inert with an error entry.
    fn fail_session(&mut self, id: &SessionId, error: EngineError) {
        tracing::warn!(session = %id, kind = %error.kind, "session failed: {}", error.message);
        self.teardown(id, "The engine stopped");

        let engine = state_of(&mut self.foreground, &mut self.background, id).map(|state| {
            record_failure(state, &error);
            state.meta.engine
        });
        self.persist(id);
        // Inert sessions live on disk, not in the background store.
        self.background.evict(id);

        if error.kind == EngineErrorKind::Auth
            && let Some(engine) = engine
        {
            self.notify(RegistryNotice::AuthRequired {
                session_id: id.clone(),
                engine,
                message: error.message.clone(),
            });
        }
        self.notify(RegistryNotice::SessionFailed {
            session_id: id.clone(),
            error,
        });
        self.notify_timeline(id);
    }

    /// Stops a backend and denies whatever it was waiting on.
    fn teardown(&mut self, id: &SessionId, reason: &str) {
        self.bridge.deny_all(id, reason);
        if let Some(mut live) = self.live.remove(id)
            && let Some(adapter) = live.adapter()
        {
            adapter.stop();
        }
    }

    fn report_unsupported(&mut self, id: &SessionId, setting: &str) {
        let Some(state) = state_of(&mut self.foreground, &mut self.background, id) else {
            return;
        };
        if !state.reported_unsupported.insert(setting.to_string()) {
            return;
        }
        let engine = state.meta.engine;
        state.assembler.push(
            &mut state.timeline,
            CanonicalMessage::system(format!(
                "{engine} cannot change the {setting} of a running session"
            )),
        );
        self.notify_timeline(id);
    }

    /// Saves a session with at least one entry. Failures are logged.
    fn persist(&self, id: &SessionId) {
        let Some(state) = self.session_state(id) else {
            return;
        };
        if state.timeline.is_empty() {
            return;
        }
        if let Err(e) = self.store.save(&state.to_record()) {
            tracing::warn!(session = %id, "failed to save session: {e:#}");
        }
    }

    fn notify_timeline(&self, id: &SessionId) {
        if self.foreground.as_ref().is_some_and(|s| s.id() == id) {
            self.notify(RegistryNotice::ForegroundTimelineChanged {
                session_id: id.clone(),
            });
        }
    }

    fn notify(&self, notice: RegistryNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

fn record_failure(state: &mut SessionState, error: &EngineError) {
    state.connected = false;
    state.processing = false;
    let text = match &error.details {
        Some(details) => format!("{}\n{details}", error.message),
        None => error.message.clone(),
    };
    state.assembler.finish(&mut state.timeline);
    state
        .assembler
        .push(&mut state.timeline, CanonicalMessage::error(text));
}

/// Engine error carried by `err`, or a spawn error describing it.
fn engine_error(err: &anyhow::Error) -> EngineError {
    match EngineError::find(err) {
        Some(found) => {
            let mut error = found.clone();
            let full = format!("{err:#}");
            if full != error.message {
                error.message = full;
            }
            error
        }
        None => EngineError::spawn(format!("{err:#}")),
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        for live in self.live.values_mut() {
            if let Some(adapter) = live.adapter() {
                adapter.stop();
            }
        }
    }
}
