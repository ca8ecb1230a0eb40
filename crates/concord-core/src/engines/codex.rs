//! Codex `app-server` adapter.
//!
//! JSON-RPC without the version member. A session is a Codex thread; every
//! user message starts a turn that ends with `turn/completed`. Codex refuses
//! a second turn while one is running, so `send` fails with `Busy` instead of
//! queueing.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::rpc::{Dialect, Incoming, METHOD_NOT_FOUND, RpcPeer};
use super::tool_names::{BASH, EDIT, NormalizedTool, TODO_WRITE, from_codex_item};
use super::transport::{Frame, LaunchSpec, ProcessGuard, Transport};
use super::{ConfigChange, StartConfig, StartInfo, closed_during_handshake, looks_like_auth_failure};
use crate::core::error::{EngineError, EngineErrorKind};
use crate::core::events::{EngineEvent, EventSink, Fragment};
use crate::core::permissions::{
    OptionKind, PermissionOption, PermissionRequest, PermissionResolution, PermissionResponder,
    ResolutionOrigin,
};
use crate::core::session::EngineKind;
use crate::core::timeline::ImageAttachment;

const APPROVAL_POLICY: &str = "on-request";
const SANDBOX: &str = "workspace-write";

pub fn launch_spec(config: &StartConfig) -> LaunchSpec {
    LaunchSpec {
        program: config.launch.binary.clone(),
        args: config.launch.args.iter().map(OsString::from).collect(),
        cwd: config.cwd.clone(),
        env: config.env(),
    }
}

#[derive(Debug, Default)]
struct TurnState {
    /// Counts turns started by this adapter; tags `turn/start` responses.
    seq: u64,
    active: bool,
    id: Option<String>,
    /// Interrupt asked for before the turn id was known.
    interrupt_requested: bool,
}

#[derive(Default)]
struct Shared {
    turn: Mutex<TurnState>,
    exit: Mutex<Option<String>>,
}

impl Shared {
    fn exit_error(&self) -> Option<String> {
        self.exit.lock().ok().and_then(|exit| exit.clone())
    }

    fn turn(&self) -> Result<MutexGuard<'_, TurnState>> {
        self.turn
            .lock()
            .map_err(|e| anyhow!("turn state poisoned: {e}"))
    }

    /// Marks a turn as running and returns its sequence number.
    fn begin_turn(&self) -> Result<u64> {
        let mut turn = self.turn()?;
        if turn.active {
            return Err(anyhow!(EngineError::busy("Codex is already running a turn")));
        }
        turn.seq += 1;
        turn.active = true;
        Ok(turn.seq)
    }

    /// Records the running turn's id. `seq` is the turn a `turn/start`
    /// response belongs to; a response for an earlier turn is ignored.
    /// Returns true when an interrupt is owed.
    fn turn_known(&self, seq: Option<u64>, id: &str) -> bool {
        let Ok(mut turn) = self.turn() else {
            return false;
        };
        if !turn.active || turn.id.is_some() || seq.is_some_and(|seq| seq != turn.seq) {
            return false;
        }
        turn.id = Some(id.to_string());
        std::mem::take(&mut turn.interrupt_requested)
    }

    /// Id to interrupt now, or `None` when the interrupt was deferred until
    /// the id is known or no turn is running.
    fn interrupt_target(&self) -> Result<Option<String>> {
        let mut turn = self.turn()?;
        if !turn.active {
            return Ok(None);
        }
        if turn.id.is_none() {
            turn.interrupt_requested = true;
        }
        Ok(turn.id.clone())
    }

    fn turn_ended(&self) {
        if let Ok(mut turn) = self.turn() {
            let seq = turn.seq;
            *turn = TurnState {
                seq,
                ..TurnState::default()
            };
        }
    }

    /// Ends turn `seq` if it is still the running one.
    fn turn_failed(&self, seq: u64) -> bool {
        let Ok(mut turn) = self.turn() else {
            return false;
        };
        if !turn.active || turn.seq != seq {
            return false;
        }
        *turn = TurnState {
            seq,
            ..TurnState::default()
        };
        true
    }
}

pub struct CodexAdapter {
    peer: RpcPeer,
    thread_id: String,
    /// Model for the next turns, when changed at runtime.
    model: Option<String>,
    sink: EventSink,
    shared: Arc<Shared>,
    guard: ProcessGuard,
    pump: JoinHandle<()>,
}

impl fmt::Debug for CodexAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodexAdapter")
            .field("thread_id", &self.thread_id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl CodexAdapter {
    pub async fn start(
        config: StartConfig,
        transport: Transport,
        sink: EventSink,
    ) -> Result<(Self, StartInfo)> {
        let Transport {
            outgoing,
            incoming,
            guard,
        } = transport;
        let peer = RpcPeer::new(outgoing, Dialect::Bare);
        let shared = Arc::new(Shared::default());
        let pump = tokio::spawn(pump(
            incoming,
            peer.clone(),
            sink.clone(),
            Arc::clone(&shared),
        ));

        let response = match handshake(&config, &peer, &shared).await {
            Ok(response) => response,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };
        let Some(thread_id) = response
            .pointer("/thread/id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            pump.abort();
            return Err(anyhow!(EngineError::protocol("Codex returned no thread id")));
        };

        let info = StartInfo {
            resume_id: Some(thread_id.clone()),
            model: response
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| config.model.clone()),
        };
        Ok((
            Self {
                peer,
                thread_id,
                model: None,
                sink,
                shared,
                guard,
                pump,
            },
            info,
        ))
    }

    pub fn send(&mut self, text: &str, images: &[ImageAttachment]) -> Result<()> {
        if self.pump.is_finished() {
            return Err(anyhow!(EngineError::transport("Codex is no longer running")));
        }
        let seq = self.shared.begin_turn()?;

        let mut input = vec![json!({"type": "text", "text": text})];
        input.extend(images.iter().map(|image| {
            json!({"type": "image", "url": format!("data:{};base64,{}", image.mime_type, image.data)})
        }));
        let mut params = json!({"threadId": self.thread_id, "input": input});
        if let Some(model) = &self.model {
            params["model"] = json!(model);
        }

        let peer = self.peer.clone();
        let sink = self.sink.clone();
        let shared = Arc::clone(&self.shared);
        let thread_id = self.thread_id.clone();
        tokio::spawn(async move {
            match peer.request("turn/start", params).await {
                Ok(response) => {
                    let Some(turn_id) = response.pointer("/turn/id").and_then(Value::as_str) else {
                        return;
                    };
                    if shared.turn_known(Some(seq), turn_id) {
                        request_interrupt(&peer, &thread_id, turn_id);
                    }
                }
                Err(e) => {
                    if !shared.turn_failed(seq) {
                        tracing::debug!("turn/start failed after its turn ended: {e:#}");
                        return;
                    }
                    let error = EngineError::find(&e)
                        .cloned()
                        .unwrap_or_else(|| EngineError::rejected(format!("{e:#}")));
                    sink.emit(EngineEvent::TurnCompleted { error: Some(error) });
                }
            }
        });
        Ok(())
    }

    pub fn interrupt(&mut self) -> Result<()> {
        if let Some(turn_id) = self.shared.interrupt_target()? {
            request_interrupt(&self.peer, &self.thread_id, &turn_id);
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: &str) -> ConfigChange {
        tracing::debug!(mode, "codex does not change modes at runtime");
        ConfigChange::Unsupported
    }

    /// Applies to the next turn.
    pub fn set_model(&mut self, model: &str) -> ConfigChange {
        self.model = Some(model.to_string());
        ConfigChange::Applied
    }

    pub fn stop(&mut self) {
        self.guard.terminate();
    }
}

fn request_interrupt(peer: &RpcPeer, thread_id: &str, turn_id: &str) {
    let peer = peer.clone();
    let params = json!({"threadId": thread_id, "turnId": turn_id});
    tokio::spawn(async move {
        if let Err(e) = peer.request("turn/interrupt", params).await {
            tracing::warn!("turn/interrupt failed: {e:#}");
        }
    });
}

async fn handshake(config: &StartConfig, peer: &RpcPeer, shared: &Shared) -> Result<Value> {
    peer.request(
        "initialize",
        json!({
            "clientInfo": {
                "name": "concord",
                "title": "Concord",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
    .await
    .map_err(|e| handshake_error(e, shared))?;
    peer.notify("initialized", json!({}))?;

    match &config.resume {
        Some(thread_id) => peer
            .request(
                "thread/resume",
                json!({"threadId": thread_id, "cwd": config.cwd, "model": config.model}),
            )
            .await
            .map_err(|e| match EngineError::kind_of(&e) {
                Some(EngineErrorKind::Auth | EngineErrorKind::Transport) => handshake_error(e, shared),
                _ => anyhow!(
                    EngineError::revival(format!("Codex could not resume thread {thread_id}"))
                        .with_details(format!("{e:#}"))
                ),
            }),
        None => peer
            .request(
                "thread/start",
                json!({
                    "model": config.model,
                    "cwd": config.cwd,
                    "approvalPolicy": APPROVAL_POLICY,
                    "sandbox": SANDBOX,
                }),
            )
            .await
            .map_err(|e| handshake_error(e, shared)),
    }
}

fn handshake_error(err: anyhow::Error, shared: &Shared) -> anyhow::Error {
    match EngineError::kind_of(&err) {
        Some(EngineErrorKind::Transport) => {
            anyhow!(closed_during_handshake(EngineKind::Codex, shared.exit_error()))
        }
        Some(EngineErrorKind::Auth) => err,
        _ => anyhow!(EngineError::spawn("Codex failed to start").with_details(format!("{err:#}"))),
    }
}

async fn pump(
    mut incoming: mpsc::UnboundedReceiver<Frame>,
    peer: RpcPeer,
    sink: EventSink,
    shared: Arc<Shared>,
) {
    let mut translator = Translator {
        peer: peer.clone(),
        sink: sink.clone(),
        shared: Arc::clone(&shared),
        items: HashMap::new(),
        streamed: HashSet::new(),
    };
    while let Some(frame) = incoming.recv().await {
        match frame {
            Frame::Message(message) => match peer.classify(message) {
                Incoming::Handled => {}
                Incoming::Notification { method, params } => translator.notification(&method, params),
                Incoming::Request { id, method, params } => translator.request(id, &method, &params),
                Incoming::Invalid(raw) => {
                    tracing::warn!("invalid JSON-RPC message from codex");
                    sink.emit(EngineEvent::Unmapped {
                        kind: "invalid".to_string(),
                        raw,
                    });
                }
            },
            Frame::Malformed { line, error } => {
                tracing::warn!(%error, "malformed line from codex");
                sink.emit(EngineEvent::Unmapped {
                    kind: "malformed".to_string(),
                    raw: json!({"line": line, "error": error}),
                });
            }
            Frame::Closed { error } => {
                if let Ok(mut exit) = shared.exit.lock() {
                    *exit = error.clone();
                }
                shared.turn_ended();
                peer.fail_all();
                sink.emit(EngineEvent::Exited { error });
                break;
            }
        }
    }
}

struct Translator {
    peer: RpcPeer,
    sink: EventSink,
    shared: Arc<Shared>,
    /// Tool items seen in `item/started`, for approvals.
    items: HashMap<String, NormalizedTool>,
    /// Items that received deltas.
    streamed: HashSet<String>,
}

impl Translator {
    fn notification(&mut self, method: &str, params: Value) {
        match method {
            "turn/started" => {
                if let Some(turn_id) = params.pointer("/turn/id").and_then(Value::as_str)
                    && self.shared.turn_known(None, turn_id)
                {
                    request_interrupt(&self.peer, str_at(&params, "/threadId"), turn_id);
                }
                self.sink.emit(EngineEvent::TurnStarted);
            }
            "turn/completed" => {
                self.shared.turn_ended();
                self.streamed.clear();
                let turn = params.get("turn").unwrap_or(&Value::Null);
                let error = (turn.get("status").and_then(Value::as_str) == Some("failed")).then(|| {
                    let message = turn
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("Turn failed")
                        .to_string();
                    if looks_like_auth_failure(&message) {
                        EngineError::auth(message)
                    } else {
                        EngineError::rejected(message)
                    }
                });
                self.sink.emit(EngineEvent::TurnCompleted { error });
            }
            "item/agentMessage/delta" => self.delta(&params, false),
            "item/reasoning/textDelta" | "item/reasoning/summaryTextDelta" => {
                self.delta(&params, true);
            }
            "item/started" => {
                if let Some(item) = params.get("item") {
                    self.item_started(item);
                }
            }
            "item/completed" => {
                if let Some(item) = params.get("item") {
                    self.item_completed(item);
                }
            }
            "turn/plan/updated" => {
                let todos: Vec<Value> = params
                    .get("plan")
                    .and_then(Value::as_array)
                    .map(|steps| {
                        steps
                            .iter()
                            .map(|s| {
                                json!({
                                    "content": s.get("step").cloned().unwrap_or(Value::Null),
                                    "status": s.get("status").cloned().unwrap_or(json!("pending")),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.sink.emit(EngineEvent::ToolCall {
                    tool_use_id: format!("plan-{}", str_at(&params, "/turnId")),
                    name: TODO_WRITE.to_string(),
                    input: json!({"todos": todos}),
                    parent_tool_use_id: None,
                });
            }
            "thread/compacted" => self.sink.emit(EngineEvent::Compacted {
                summary: "Conversation compacted".to_string(),
            }),
            "error" => {
                let message = params
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("Codex reported an error");
                let retrying = params
                    .get("willRetry")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.sink.emit(EngineEvent::Notice {
                    text: if retrying {
                        format!("{message} (retrying)")
                    } else {
                        message.to_string()
                    },
                    is_error: true,
                });
            }
            "thread/started"
            | "thread/tokenUsage/updated"
            | "account/rateLimits/updated"
            | "turn/diff/updated"
            | "item/commandExecution/outputDelta"
            | "item/fileChange/outputDelta"
            | "item/reasoning/summaryPartAdded" => {
                tracing::trace!(method, "ignoring codex notification");
            }
            _ => self.sink.emit(EngineEvent::Unmapped {
                kind: method.to_string(),
                raw: params,
            }),
        }
    }

    fn delta(&mut self, params: &Value, reasoning: bool) {
        let Some(delta) = params.get("delta").and_then(Value::as_str) else {
            return;
        };
        let item_id = params
            .get("itemId")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(id) = &item_id {
            self.streamed.insert(id.clone());
        }
        let fragment = Fragment::Delta(delta.to_string());
        self.sink.emit(if reasoning {
            EngineEvent::Reasoning {
                segment: item_id,
                fragment,
                parent_tool_use_id: None,
            }
        } else {
            EngineEvent::Text {
                segment: item_id,
                fragment,
                parent_tool_use_id: None,
            }
        });
    }

    fn item_started(&mut self, item: &Value) {
        let Some(tool) = from_codex_item(item) else {
            return;
        };
        let id = str_at(item, "/id").to_string();
        self.sink.emit(EngineEvent::ToolCall {
            tool_use_id: id.clone(),
            name: tool.name.clone(),
            input: tool.input.clone(),
            parent_tool_use_id: None,
        });
        self.items.insert(id, tool);
    }

    fn item_completed(&mut self, item: &Value) {
        let id = str_at(item, "/id").to_string();
        match item.get("type").and_then(Value::as_str) {
            Some("agentMessage") => {
                let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
                self.sink.emit(EngineEvent::Text {
                    segment: Some(id),
                    fragment: Fragment::Snapshot(text.to_string()),
                    parent_tool_use_id: None,
                });
            }
            Some("reasoning") => {
                if self.streamed.contains(&id) {
                    return;
                }
                let text = reasoning_text(item);
                if !text.is_empty() {
                    self.sink.emit(EngineEvent::Reasoning {
                        segment: Some(id),
                        fragment: Fragment::Snapshot(text),
                        parent_tool_use_id: None,
                    });
                }
            }
            Some("commandExecution") => {
                let status = item.get("status").and_then(Value::as_str);
                let exit_code = item.get("exitCode").and_then(Value::as_i64);
                self.items.remove(&id);
                self.sink.emit(EngineEvent::ToolResult {
                    tool_use_id: id,
                    output: item.get("aggregatedOutput").cloned().unwrap_or(Value::Null),
                    is_error: status == Some("failed")
                        || status == Some("declined")
                        || exit_code.is_some_and(|c| c != 0),
                    parent_tool_use_id: None,
                });
            }
            Some("fileChange" | "mcpToolCall" | "webSearch") => {
                let status = item.get("status").and_then(Value::as_str);
                let output = item
                    .get("result")
                    .or_else(|| item.get("error"))
                    .cloned()
                    .unwrap_or_else(|| json!({"status": status}));
                self.items.remove(&id);
                self.sink.emit(EngineEvent::ToolResult {
                    tool_use_id: id,
                    output,
                    is_error: matches!(status, Some("failed" | "declined"))
                        || item.get("error").is_some_and(|e| !e.is_null()),
                    parent_tool_use_id: None,
                });
            }
            _ => {}
        }
    }

    fn request(&mut self, id: Value, method: &str, params: &Value) {
        let fallback = match method {
            "item/commandExecution/requestApproval" => NormalizedTool {
                name: BASH.to_string(),
                input: json!({"command": params.get("command").cloned().unwrap_or(Value::Null)}),
            },
            "item/fileChange/requestApproval" => NormalizedTool {
                name: EDIT.to_string(),
                input: json!({}),
            },
            _ => {
                tracing::debug!(method, "declining codex request");
                let _ = self
                    .peer
                    .respond_error(id, METHOD_NOT_FOUND, &format!("Method not found: {method}"));
                return;
            }
        };

        let item_id = params.get("itemId").and_then(Value::as_str);
        let tool = item_id
            .and_then(|item| self.items.get(item))
            .cloned()
            .unwrap_or(fallback);
        let mut request = PermissionRequest::new(self.sink.session_id().clone(), tool.name, tool.input);
        request.tool_use_id = item_id.map(str::to_string);
        request.description = params.get("reason").and_then(Value::as_str).map(str::to_string);
        request.options = vec![
            PermissionOption::new("accept", OptionKind::AllowOnce, "Allow"),
            PermissionOption::new("acceptForSession", OptionKind::AllowAlways, "Allow for this session"),
            PermissionOption::new("decline", OptionKind::RejectOnce, "Decline"),
        ];

        let (responder, receiver) = PermissionResponder::channel();
        self.sink.emit(EngineEvent::PermissionRequested { request, responder });

        let peer = self.peer.clone();
        tokio::spawn(async move {
            let resolution = receiver.recv().await;
            let _ = peer.respond(id, json!({"decision": decision(&resolution)}));
        });
    }
}

fn decision(resolution: &PermissionResolution) -> &'static str {
    match (resolution.origin, resolution.decision) {
        (ResolutionOrigin::ForcedDenial, _) => "cancel",
        (_, OptionKind::AllowAlways) => "acceptForSession",
        (_, OptionKind::AllowOnce) => "accept",
        (_, OptionKind::RejectOnce | OptionKind::RejectAlways) => "decline",
    }
}

fn reasoning_text(item: &Value) -> String {
    ["summary", "content"]
        .iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_array))
        .flatten()
        .filter_map(|part| part.as_str().or_else(|| part.get("text").and_then(Value::as_str)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::config::EnginesConfig;
    use crate::core::events::{EngineMessage, EnginePayload, create_inbox};
    use crate::core::session::SessionId;
    use crate::engines::transport::testing::{FakeBackend, pair};

    fn config(resume: Option<&str>) -> StartConfig {
        StartConfig {
            session_id: SessionId::from("s1"),
            cwd: PathBuf::from("/work"),
            model: Some("gpt-5-codex".to_string()),
            mode: None,
            resume: resume.map(str::to_string),
            launch: EnginesConfig::default().codex,
        }
    }

    fn reply(backend: &FakeBackend, request: &Value, result: Value) {
        backend.send(json!({"id": request["id"], "result": result}));
    }

    type Start = JoinHandle<Result<(CodexAdapter, StartInfo)>>;

    fn begin(resume: Option<&str>) -> (Start, FakeBackend, mpsc::UnboundedReceiver<EngineMessage>) {
        let (transport, backend) = pair(EngineKind::Codex, launch_spec(&config(resume)));
        let (tx, rx) = create_inbox();
        let sink = EventSink::new(SessionId::from("s1"), 1, tx);
        let start = tokio::spawn(CodexAdapter::start(config(resume), transport, sink));
        (start, backend, rx)
    }

    async fn started() -> (CodexAdapter, FakeBackend, mpsc::UnboundedReceiver<EngineMessage>) {
        let (start, mut backend, rx) = begin(None);
        let init = backend.recv().await;
        assert_eq!(init["method"], "initialize");
        assert!(init.get("jsonrpc").is_none());
        reply(&backend, &init, json!({"userAgent": "codex"}));
        backend.recv_method("initialized").await;
        let thread = backend.recv_method("thread/start").await;
        assert_eq!(thread["params"]["approvalPolicy"], APPROVAL_POLICY);
        assert_eq!(thread["params"]["cwd"], "/work");
        reply(&backend, &thread, json!({"thread": {"id": "thr_1"}, "model": "gpt-5-codex"}));

        let (adapter, info) = start.await.unwrap().unwrap();
        assert_eq!(info.resume_id.as_deref(), Some("thr_1"));
        assert_eq!(info.model.as_deref(), Some("gpt-5-codex"));
        (adapter, backend, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<EngineMessage>) -> EngineEvent {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message.payload {
            EnginePayload::Event(event) => event,
            EnginePayload::Started(_) => panic!("unexpected start payload"),
        }
    }

    #[tokio::test]
    async fn turn_streams_and_completes() {
        let (mut adapter, mut backend, mut rx) = started().await;
        adapter.send("fix the build", &[]).unwrap();
        let turn = backend.recv_method("turn/start").await;
        assert_eq!(turn["params"]["threadId"], "thr_1");
        assert_eq!(turn["params"]["input"][0]["text"], "fix the build");
        reply(&backend, &turn, json!({"turn": {"id": "turn_1", "status": "inProgress"}}));

        backend.send(json!({"method": "item/agentMessage/delta", "params": {"itemId": "msg_1", "delta": "Fixed"}}));
        backend.send(json!({"method": "item/completed", "params": {"item": {"type": "agentMessage", "id": "msg_1", "text": "Fixed"}}}));
        backend.send(json!({"method": "turn/completed", "params": {"turn": {"id": "turn_1", "status": "completed"}}}));

        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::Text { segment: Some(s), fragment: Fragment::Delta(t), .. } if s == "msg_1" && t == "Fixed"
        ));
        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::Text { fragment: Fragment::Snapshot(t), .. } if t == "Fixed"
        ));
        assert!(matches!(next_event(&mut rx).await, EngineEvent::TurnCompleted { error: None }));

        adapter.send("again", &[]).unwrap();
    }

    #[tokio::test]
    async fn overlapping_turns_are_busy() {
        let (mut adapter, _backend, _rx) = started().await;
        adapter.send("one", &[]).unwrap();
        let err = adapter.send("two", &[]).unwrap_err();
        assert_eq!(EngineError::kind_of(&err), Some(EngineErrorKind::Busy));
    }

    #[tokio::test]
    async fn failed_resume_is_a_revival_error() {
        let (start, mut backend, _rx) = begin(Some("thr_gone"));
        let init = backend.recv_method("initialize").await;
        reply(&backend, &init, json!({}));
        let resume = backend.recv_method("thread/resume").await;
        assert_eq!(resume["params"]["threadId"], "thr_gone");
        backend.send(json!({"id": resume["id"], "error": {"code": -32600, "message": "no rollout found"}}));

        let err = start.await.unwrap().unwrap_err();
        assert_eq!(EngineError::kind_of(&err), Some(EngineErrorKind::Revival));
    }

    #[tokio::test]
    async fn command_approval_offers_session_grant() {
        let (_adapter, mut backend, mut rx) = started().await;
        backend.send(json!({"method": "item/started", "params": {"item": {
            "type": "commandExecution", "id": "item_3", "command": ["bash", "-lc", "cargo test"], "status": "inProgress",
        }}}));
        backend.send(json!({"id": 77, "method": "item/commandExecution/requestApproval", "params": {
            "threadId": "thr_1", "turnId": "turn_1", "itemId": "item_3", "reason": "needs network",
        }}));

        assert!(matches!(next_event(&mut rx).await, EngineEvent::ToolCall { name, .. } if name == BASH));
        let EngineEvent::PermissionRequested { request, responder } = next_event(&mut rx).await else {
            panic!("expected permission request");
        };
        assert_eq!(request.input, json!({"command": "cargo test"}));
        assert_eq!(request.tool_use_id.as_deref(), Some("item_3"));
        assert!(request.has_option(OptionKind::AllowAlways));
        responder.send(PermissionResolution::for_request(
            &request,
            OptionKind::AllowAlways,
            ResolutionOrigin::User,
        ));

        let answer = backend.recv().await;
        assert_eq!(answer["id"], 77);
        assert_eq!(answer["result"], json!({"decision": "acceptForSession"}));
    }

    #[tokio::test]
    async fn forced_denial_cancels() {
        let (_adapter, mut backend, mut rx) = started().await;
        backend.send(json!({"id": 78, "method": "item/fileChange/requestApproval", "params": {"itemId": "item_9"}}));
        let EngineEvent::PermissionRequested { request, responder } = next_event(&mut rx).await else {
            panic!("expected permission request");
        };
        assert_eq!(request.tool_name, EDIT);
        drop(responder);

        let answer = backend.recv().await;
        assert_eq!(answer["result"], json!({"decision": "cancel"}));
    }

    #[test]
    fn late_turn_start_response_does_not_name_the_next_turn() {
        let shared = Shared::default();
        let first = shared.begin_turn().unwrap();
        // turn/completed handled before the turn/start response task ran.
        shared.turn_ended();
        let second = shared.begin_turn().unwrap();
        assert_ne!(first, second);

        assert!(!shared.turn_known(Some(first), "turn_1"));
        assert!(!shared.turn_failed(first));
        assert_eq!(shared.interrupt_target().unwrap(), None);

        // The deferred interrupt goes to the right turn once its id arrives.
        assert!(shared.turn_known(Some(second), "turn_2"));
        assert_eq!(shared.interrupt_target().unwrap().as_deref(), Some("turn_2"));
    }

    #[tokio::test]
    async fn interrupt_waits_for_the_turn_id() {
        let (mut adapter, mut backend, _rx) = started().await;
        adapter.send("long task", &[]).unwrap();
        let turn = backend.recv_method("turn/start").await;
        adapter.interrupt().unwrap();
        reply(&backend, &turn, json!({"turn": {"id": "turn_7"}}));

        let interrupt = backend.recv_method("turn/interrupt").await;
        assert_eq!(interrupt["params"], json!({"threadId": "thr_1", "turnId": "turn_7"}));
    }

    #[tokio::test]
    async fn model_applies_to_next_turn_and_mode_is_unsupported() {
        let (mut adapter, mut backend, _rx) = started().await;
        assert_eq!(adapter.set_mode("plan"), ConfigChange::Unsupported);
        assert_eq!(adapter.set_model("o3"), ConfigChange::Applied);
        adapter.send("hi", &[]).unwrap();
        let turn = backend.recv_method("turn/start").await;
        assert_eq!(turn["params"]["model"], "o3");
    }

    #[tokio::test]
    async fn failed_turn_reports_error() {
        let (mut adapter, mut backend, mut rx) = started().await;
        adapter.send("hi", &[]).unwrap();
        let turn = backend.recv_method("turn/start").await;
        reply(&backend, &turn, json!({"turn": {"id": "turn_2"}}));
        backend.send(json!({"method": "turn/completed", "params": {"turn": {
            "id": "turn_2", "status": "failed", "error": {"message": "stream disconnected"},
        }}}));

        let EngineEvent::TurnCompleted { error: Some(error) } = next_event(&mut rx).await else {
            panic!("expected failed turn");
        };
        assert_eq!(error.kind, EngineErrorKind::Rejected);
        assert_eq!(error.message, "stream disconnected");
    }
}
