use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::*;
use crate::engines::transport::testing::{FakeBackend, FakeFactory};

const PROJECT: &str = "/work";

struct Harness {
    registry: SessionRegistry,
    factory: Arc<FakeFactory>,
    backends: mpsc::UnboundedReceiver<FakeBackend>,
    store: SessionStore,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path());
    let (factory, backends) = FakeFactory::new();
    let registry = SessionRegistry::new(
        Config::default(),
        store.clone(),
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
    );
    Harness {
        registry,
        factory,
        backends,
        store,
        _dir: dir,
    }
}

impl Harness {
    async fn backend(&mut self) -> FakeBackend {
        tokio::time::timeout(Duration::from_secs(5), self.backends.recv())
            .await
            .expect("timed out waiting for a backend")
            .expect("factory dropped")
    }

    /// Handles engine messages until `done` holds.
    async fn drive(&mut self, done: impl Fn(&SessionRegistry) -> bool) {
        while !done(&self.registry) {
            let message = tokio::time::timeout(Duration::from_secs(5), self.registry.next_message())
                .await
                .expect("timed out driving the registry")
                .expect("inbox closed");
            self.registry.handle(message);
        }
    }

    async fn until_connected(&mut self, id: &SessionId) {
        self.drive(|r| r.session_state(id).is_some_and(|s| s.connected))
            .await;
    }

    async fn until_idle(&mut self, id: &SessionId) {
        self.drive(|r| r.session_state(id).is_some_and(|s| !s.processing))
            .await;
    }

    /// New Claude session with a finished handshake.
    async fn claude_session(&mut self) -> (SessionId, FakeBackend) {
        let id = self
            .registry
            .create_session(PROJECT, EngineSelection::new(EngineKind::Claude));
        let mut backend = self.backend().await;
        accept_claude(&mut backend).await;
        self.until_connected(&id).await;
        (id, backend)
    }

    async fn codex_session(&mut self) -> (SessionId, FakeBackend) {
        let id = self
            .registry
            .create_session(PROJECT, EngineSelection::new(EngineKind::Codex));
        let mut backend = self.backend().await;
        accept_codex(&mut backend).await;
        self.until_connected(&id).await;
        (id, backend)
    }
}

async fn accept_claude(backend: &mut FakeBackend) {
    let init = backend.recv().await;
    assert_eq!(init["request"]["subtype"], "initialize");
    backend.send(json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": init["request_id"], "response": {}},
    }));
}

async fn accept_codex(backend: &mut FakeBackend) {
    let init = backend.recv_method("initialize").await;
    backend.send(json!({"id": init["id"], "result": {"userAgent": "codex"}}));
    backend.recv_method("initialized").await;
    let thread = backend.recv_method("thread/start").await;
    backend.send(json!({"id": thread["id"], "result": {"thread": {"id": "thr_1"}, "model": "gpt-5-codex"}}));
}

/// Next user turn written to a Claude backend, skipping control traffic.
async fn claude_user_text(backend: &mut FakeBackend) -> String {
    loop {
        let message = backend.recv().await;
        if message["type"] == "user" {
            return message["message"]["content"][0]["text"]
                .as_str()
                .unwrap_or_default()
                .to_string();
        }
    }
}

fn claude_result() -> Value {
    json!({"type": "result", "subtype": "success", "is_error": false, "total_cost_usd": 0.01})
}

fn claude_text(id: &str, text: &str) -> Value {
    json!({"type": "assistant", "parent_tool_use_id": null,
        "message": {"id": id, "content": [{"type": "text", "text": text}]}})
}

fn user_entries(registry: &SessionRegistry, id: &SessionId) -> Vec<(String, bool)> {
    registry
        .session_state(id)
        .unwrap()
        .timeline
        .messages()
        .iter()
        .filter_map(|m| match m {
            CanonicalMessage::User { text, queued, .. } => Some((text.clone(), *queued)),
            _ => None,
        })
        .collect()
}

fn last_error(registry: &SessionRegistry, id: &SessionId) -> Option<String> {
    registry
        .session_state(id)?
        .timeline
        .messages()
        .iter()
        .rev()
        .find_map(|m| match m {
            CanonicalMessage::System {
                text,
                is_error: true,
                ..
            } => Some(text.clone()),
            _ => None,
        })
}

fn drain(notices: &mut broadcast::Receiver<RegistryNotice>) -> Vec<RegistryNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

#[tokio::test]
async fn turn_records_resume_handle_and_persists() {
    let mut h = harness();
    let (id, mut backend) = h.claude_session().await;
    backend.send(json!({"type": "system", "subtype": "init", "session_id": "claude-1", "model": "opus"}));
    h.drive(|r| r.session_state(&id).unwrap().meta.resume_id() == Some("claude-1"))
        .await;

    h.registry.send(&id, "hello there", Vec::new()).unwrap();
    assert!(h.registry.session_state(&id).unwrap().processing);
    assert_eq!(claude_user_text(&mut backend).await, "hello there");

    backend.send(claude_text("msg_1", "Hi!"));
    backend.send(claude_result());
    h.until_idle(&id).await;

    let state = h.registry.session_state(&id).unwrap();
    assert_eq!(state.meta.title, "hello there");
    assert_eq!(state.meta.model.as_deref(), Some("opus"));
    assert!(matches!(
        state.timeline.last(),
        Some(CanonicalMessage::Assistant { text, streaming: false, .. }) if text == "Hi!"
    ));

    let record = h.store.load(PROJECT, &id).unwrap();
    assert_eq!(record.messages.len(), 2);
    assert_eq!(record.resume.map(|r| r.id).as_deref(), Some("claude-1"));
    assert!((record.cost_usd - 0.01).abs() < 1e-9);
}

#[tokio::test]
async fn sends_queue_behind_a_running_turn() {
    let mut h = harness();
    let (id, mut backend) = h.claude_session().await;

    h.registry.send(&id, "one", Vec::new()).unwrap();
    h.registry.send(&id, "two", Vec::new()).unwrap();
    h.registry.send(&id, "three", Vec::new()).unwrap();
    assert_eq!(h.registry.queued_sends(&id), 2);
    assert_eq!(
        user_entries(&h.registry, &id),
        vec![
            ("one".to_string(), false),
            ("two".to_string(), true),
            ("three".to_string(), true),
        ]
    );
    assert_eq!(claude_user_text(&mut backend).await, "one");

    backend.send(claude_result());
    h.drive(|r| r.queued_sends(&id) == 1).await;
    assert_eq!(claude_user_text(&mut backend).await, "two");
    assert_eq!(user_entries(&h.registry, &id)[1], ("two".to_string(), false));

    backend.send(claude_result());
    h.drive(|r| r.queued_sends(&id) == 0).await;
    assert_eq!(claude_user_text(&mut backend).await, "three");
}

#[tokio::test]
async fn sends_before_the_handshake_are_flushed_on_start() {
    let mut h = harness();
    let id = h
        .registry
        .create_session(PROJECT, EngineSelection::new(EngineKind::Claude));
    h.registry.send(&id, "early", Vec::new()).unwrap();
    assert_eq!(h.registry.queued_sends(&id), 1);

    let mut backend = h.backend().await;
    accept_claude(&mut backend).await;
    h.until_connected(&id).await;

    assert_eq!(claude_user_text(&mut backend).await, "early");
    assert_eq!(h.registry.queued_sends(&id), 0);
    assert!(h.registry.session_state(&id).unwrap().processing);
    assert_eq!(user_entries(&h.registry, &id), vec![("early".to_string(), false)]);
}

#[tokio::test]
async fn interrupt_denies_pending_permissions() {
    let mut h = harness();
    let mut notices = h.registry.subscribe();
    let (id, mut backend) = h.claude_session().await;
    h.registry.send(&id, "clean up", Vec::new()).unwrap();
    claude_user_text(&mut backend).await;

    backend.send(json!({
        "type": "control_request",
        "request_id": "cli_1",
        "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "rm -rf build"}},
    }));
    h.drive(|r| r.pending_permission(&id).is_some()).await;
    assert!(drain(&mut notices).iter().any(|n| matches!(
        n,
        RegistryNotice::PermissionRequested { request } if request.tool_name == "Bash"
    )));

    h.registry.interrupt(&id).unwrap();
    assert!(h.registry.pending_permission(&id).is_none());

    let mut seen = vec![backend.recv().await, backend.recv().await];
    seen.sort_by_key(|m| m["type"].as_str().unwrap_or_default().to_string());
    assert_eq!(seen[0]["request"]["subtype"], "interrupt");
    assert_eq!(seen[1]["response"]["request_id"], "cli_1");
    assert_eq!(seen[1]["response"]["response"]["behavior"], "deny");
}

#[tokio::test]
async fn switching_keeps_background_sessions_in_memory() {
    let mut h = harness();
    let (a, mut backend_a) = h.claude_session().await;
    h.registry.send(&a, "warm up", Vec::new()).unwrap();
    claude_user_text(&mut backend_a).await;
    backend_a.send(claude_result());
    h.until_idle(&a).await;
    let cost = h.registry.session_state(&a).unwrap().meta.cost_usd;
    assert!((cost - 0.01).abs() < 1e-9);

    h.registry.send(&a, "long task", Vec::new()).unwrap();
    claude_user_text(&mut backend_a).await;

    let b = h
        .registry
        .create_session(PROJECT, EngineSelection::new(EngineKind::Claude));
    assert_eq!(h.registry.foreground().unwrap().id(), &b);
    assert!(h.registry.is_live(&a));

    let mut notices = h.registry.subscribe();
    backend_a.send(claude_text("msg_1", "still working"));
    h.drive(|r| {
        matches!(
            r.session_state(&a).unwrap().timeline.last(),
            Some(CanonicalMessage::Assistant { .. })
        )
    })
    .await;
    assert!(h.registry.session_state(&b).unwrap().timeline.is_empty());
    assert!(!drain(&mut notices).iter().any(|n| matches!(
        n,
        RegistryNotice::ForegroundTimelineChanged { session_id } if session_id == &a
    )));

    // The background copy must not depend on the file.
    std::fs::remove_file(h.store.session_path(PROJECT, &a)).unwrap();
    h.registry.switch_session(&a).unwrap();

    let state = h.registry.foreground().unwrap();
    assert_eq!(state.id(), &a);
    assert!(state.processing);
    assert!((state.meta.cost_usd - cost).abs() < f64::EPSILON);
    assert!(matches!(
        state.timeline.last(),
        Some(CanonicalMessage::Assistant { text, streaming: true, .. }) if text == "still working"
    ));
}

#[tokio::test]
async fn unexpected_exit_leaves_an_inert_session_that_revives() {
    let mut h = harness();
    let (id, mut backend) = h.claude_session().await;
    backend.send(json!({"type": "system", "subtype": "init", "session_id": "claude-1"}));
    h.registry.send(&id, "hi", Vec::new()).unwrap();
    claude_user_text(&mut backend).await;
    backend.send(claude_result());
    h.until_idle(&id).await;

    backend.close(Some("segmentation fault"));
    h.drive(|r| !r.is_live(&id)).await;

    let state = h.registry.session_state(&id).unwrap();
    assert!(!state.connected);
    let error = last_error(&h.registry, &id).unwrap();
    assert!(error.contains("exited unexpectedly"));
    assert!(error.contains("segmentation fault"));
    let record = h.store.load(PROJECT, &id).unwrap();
    assert!(matches!(
        record.messages.last(),
        Some(CanonicalMessage::System { is_error: true, .. })
    ));

    h.registry.send(&id, "again", Vec::new()).unwrap();
    let mut revived = h.backend().await;
    let args: Vec<String> = revived
        .spec
        .args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert!(args.windows(2).any(|w| w == ["--resume", "claude-1"]));
    accept_claude(&mut revived).await;
    h.until_connected(&id).await;
    assert_eq!(claude_user_text(&mut revived).await, "again");
}

#[tokio::test]
async fn failed_resume_starts_fresh_and_keeps_history() {
    let mut h = harness();
    let mut meta = SessionMeta::new(PROJECT, EngineKind::Claude, None);
    meta.resume = Some(ResumeHandle {
        engine: EngineKind::Claude,
        id: "gone".to_string(),
    });
    let mut stored = SessionState::new(meta, true);
    stored
        .timeline
        .push(CanonicalMessage::user("old question", Vec::new(), false));
    let id = stored.id().clone();
    h.store.save(&stored.to_record()).unwrap();

    h.registry.switch_session(&id).unwrap();
    assert!(!h.registry.is_live(&id));
    h.registry.send(&id, "new question", Vec::new()).unwrap();

    let mut first = h.backend().await;
    assert!(first.spec.args.iter().any(|a| a == "--resume"));
    first.recv().await;
    first.close(Some("No conversation found with session ID: gone"));
    let factory = Arc::clone(&h.factory);
    h.drive(move |_| factory.open_count() == 2).await;

    let mut fresh = h.backend().await;
    assert!(!fresh.spec.args.iter().any(|a| a == "--resume"));
    accept_claude(&mut fresh).await;
    h.until_connected(&id).await;
    assert_eq!(claude_user_text(&mut fresh).await, "new question");

    let state = h.registry.session_state(&id).unwrap();
    assert!(state.meta.resume.is_none());
    assert_eq!(
        user_entries(&h.registry, &id),
        vec![
            ("old question".to_string(), false),
            ("new question".to_string(), false),
        ]
    );
    assert!(state.timeline.messages().iter().any(|m| matches!(
        m,
        CanonicalMessage::System { text, is_error: false, .. } if text.contains("could not be resumed")
    )));
}

#[tokio::test]
async fn spawn_is_retried_once() {
    let mut h = harness();
    h.factory.fail_next(1);
    let (id, _backend) = h.claude_session().await;
    assert_eq!(h.factory.open_count(), 2);
    assert!(h.registry.is_live(&id));

    let mut notices = h.registry.subscribe();
    h.factory.fail_next(2);
    let broken = h
        .registry
        .create_session(PROJECT, EngineSelection::new(EngineKind::Claude));
    assert_eq!(h.factory.open_count(), 4);
    assert!(!h.registry.is_live(&broken));
    assert!(last_error(&h.registry, &broken).unwrap().contains("not found"));
    assert!(drain(&mut notices).iter().any(|n| matches!(
        n,
        RegistryNotice::SessionFailed { session_id, error }
            if session_id == &broken && error.kind == EngineErrorKind::Spawn
    )));
}

#[tokio::test]
async fn session_grants_answer_repeat_codex_approvals() {
    let mut h = harness();
    let (id, mut backend) = h.codex_session().await;
    let approval = |rpc_id: u64| {
        json!({"id": rpc_id, "method": "item/commandExecution/requestApproval", "params": {
            "threadId": "thr_1", "turnId": "turn_1", "itemId": format!("item_{rpc_id}"),
        }})
    };

    backend.send(approval(1));
    h.drive(|r| r.pending_permission(&id).is_some()).await;
    let request_id = h.registry.pending_permission(&id).unwrap().id.clone();
    h.registry
        .respond_permission(&request_id, OptionKind::AllowAlways, None)
        .unwrap();
    let answer = backend.recv().await;
    assert_eq!(answer["id"], 1);
    assert_eq!(answer["result"], json!({"decision": "acceptForSession"}));

    backend.send(approval(2));
    let answer = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), h.registry.next_message())
            .await
            .unwrap()
            .unwrap();
        h.registry.handle(message);
        if let Ok(answer) = tokio::time::timeout(Duration::from_millis(50), backend.recv()).await {
            break answer;
        }
    };
    assert_eq!(answer["id"], 2);
    assert_eq!(answer["result"], json!({"decision": "acceptForSession"}));
    assert!(h.registry.pending_permission(&id).is_none());

    // Answering again is a no-op.
    h.registry
        .respond_permission(&request_id, OptionKind::RejectOnce, None)
        .unwrap();
}

#[tokio::test]
async fn delete_stops_the_backend_and_removes_the_file() {
    let mut h = harness();
    let (id, mut backend) = h.claude_session().await;
    h.registry.send(&id, "hi", Vec::new()).unwrap();
    let path = h.store.session_path(PROJECT, &id);
    assert!(path.exists());

    h.registry.delete_session(&id).unwrap();
    assert!(!path.exists());
    assert!(backend.was_killed());
    assert!(h.registry.foreground().is_none());
    assert!(h.registry.list_sessions(None).unwrap().is_empty());
}

#[tokio::test]
async fn saved_sessions_reload_byte_identical() {
    let mut h = harness();
    let (id, mut backend) = h.claude_session().await;
    h.registry.send(&id, "hi", Vec::new()).unwrap();
    claude_user_text(&mut backend).await;
    backend.send(claude_text("msg_1", "hello"));
    backend.send(json!({"type": "user", "parent_tool_use_id": null, "message": {"content": [
        {"type": "tool_result", "tool_use_id": "tu_orphan", "content": "done"}]}}));
    backend.send(claude_result());
    h.until_idle(&id).await;

    let path = h.store.session_path(PROJECT, &id);
    let before = std::fs::read(&path).unwrap();
    let reloaded = SessionState::from_record(h.store.load(PROJECT, &id).unwrap(), true);
    h.store.save(&reloaded.to_record()).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn missing_credentials_raise_auth_required() {
    let mut h = harness();
    let mut notices = h.registry.subscribe();
    let id = h
        .registry
        .create_session(PROJECT, EngineSelection::new(EngineKind::Claude));
    let mut backend = h.backend().await;
    backend.recv().await;
    backend.close(Some("Invalid API key · Please run /login"));
    h.drive(|r| !r.is_live(&id)).await;

    assert!(drain(&mut notices).iter().any(|n| matches!(
        n,
        RegistryNotice::AuthRequired { session_id, engine: EngineKind::Claude, .. } if session_id == &id
    )));
}

#[tokio::test]
async fn unsupported_settings_are_reported_once() {
    let mut h = harness();
    let (id, _backend) = h.codex_session().await;

    assert_eq!(
        h.registry.set_mode(&id, "plan").unwrap(),
        ConfigChange::Unsupported
    );
    assert_eq!(
        h.registry.set_mode(&id, "plan").unwrap(),
        ConfigChange::Unsupported
    );
    let state = h.registry.session_state(&id).unwrap();
    assert!(state.mode.is_none());
    let reports = state
        .timeline
        .messages()
        .iter()
        .filter(|m| matches!(m, CanonicalMessage::System { text, .. } if text.contains("cannot change the mode")))
        .count();
    assert_eq!(reports, 1);

    assert_eq!(
        h.registry.set_model(&id, "o4-mini").unwrap(),
        ConfigChange::Applied
    );
    assert_eq!(
        h.registry.session_state(&id).unwrap().meta.model.as_deref(),
        Some("o4-mini")
    );
}

#[tokio::test]
async fn refused_mode_change_is_rolled_back_and_reported_once() {
    let mut h = harness();
    let (id, mut backend) = h.claude_session().await;

    assert_eq!(
        h.registry.set_mode(&id, "plan").unwrap(),
        ConfigChange::Applied
    );
    assert_eq!(
        h.registry.session_state(&id).unwrap().mode.as_deref(),
        Some("plan")
    );
    let request = backend.recv().await;
    assert_eq!(request["request"]["subtype"], "set_permission_mode");
    backend.send(json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": request["request_id"],
            "error": "Unsupported control request subtype: set_permission_mode"},
    }));
    h.drive(|r| r.session_state(&id).is_some_and(|s| s.mode.is_none()))
        .await;

    for _ in 0..2 {
        assert_eq!(
            h.registry.set_mode(&id, "plan").unwrap(),
            ConfigChange::Unsupported
        );
    }
    let state = h.registry.session_state(&id).unwrap();
    assert!(state.mode.is_none());
    let reports = state
        .timeline
        .messages()
        .iter()
        .filter(|m| matches!(m, CanonicalMessage::System { text, .. } if text.contains("cannot change the mode")))
        .count();
    assert_eq!(reports, 1);
}

#[tokio::test]
async fn switching_engines_opens_a_new_session_in_the_project() {
    let mut h = harness();
    let (id, _backend) = h.claude_session().await;
    let next = h
        .registry
        .set_engine(&id, EngineSelection::new(EngineKind::Codex))
        .unwrap();
    assert_ne!(next, id);
    let state = h.registry.foreground().unwrap();
    assert_eq!(state.meta.engine, EngineKind::Codex);
    assert_eq!(state.meta.project_id, PROJECT);
    assert!(h.registry.is_live(&id));

    let same = h
        .registry
        .set_engine(&next, EngineSelection::new(EngineKind::Codex))
        .unwrap();
    assert_eq!(same, next);
}

fn assistant_texts(registry: &SessionRegistry, id: &SessionId) -> Vec<String> {
    registry
        .session_state(id)
        .map(|state| {
            state
                .timeline
                .messages()
                .iter()
                .filter_map(|m| match m {
                    CanonicalMessage::Assistant { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn interleaved_engines_keep_their_own_timelines() {
    let mut h = harness();
    let (a, claude) = h.claude_session().await;
    let (b, codex) = h.codex_session().await;
    assert_eq!(h.registry.foreground().unwrap().id(), &b);

    codex.send(json!({"method": "item/agentMessage/delta", "params": {"itemId": "msg_b", "delta": "from codex"}}));
    claude.send(claude_text("msg_a", "from claude"));
    codex.send(json!({"method": "item/agentMessage/delta", "params": {"itemId": "msg_b", "delta": ", again"}}));
    h.drive(|r| {
        assistant_texts(r, &a).len() == 1 && assistant_texts(r, &b) == ["from codex, again"]
    })
    .await;

    assert_eq!(assistant_texts(&h.registry, &a), ["from claude"]);
    assert_eq!(h.registry.session_state(&b).unwrap().timeline.len(), 1);
}
