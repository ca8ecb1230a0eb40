//! Agent Client Protocol adapter.
//!
//! Speaks JSON-RPC 2.0 over the agent's stdio: `initialize`, then
//! `session/new` or `session/load`, then one `session/prompt` per turn whose
//! response ends the turn. Streaming arrives as `session/update`
//! notifications; tool approvals as `session/request_permission` requests.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::rpc::{Dialect, Incoming, METHOD_NOT_FOUND, RpcPeer, error_code};
use super::tool_names::{NormalizedTool, TODO_WRITE, from_acp};
use super::transport::{Frame, LaunchSpec, ProcessGuard, Transport};
use super::{ConfigChange, Setting, StartConfig, StartInfo, closed_during_handshake};
use crate::core::error::{EngineError, EngineErrorKind};
use crate::core::events::{EngineEvent, EventSink, Fragment};
use crate::core::permissions::{
    OptionKind, PermissionOption, PermissionRequest, PermissionResolution, PermissionResponder,
    ResolutionOrigin,
};
use crate::core::session::{EngineKind, SessionId};
use crate::core::timeline::ImageAttachment;

const PROTOCOL_VERSION: u64 = 1;
/// Tool id used for the agent's plan, shown as a todo list.
const PLAN_TOOL_ID: &str = "plan";

pub fn launch_spec(config: &StartConfig) -> LaunchSpec {
    LaunchSpec {
        program: config.launch.binary.clone(),
        args: config.launch.args.iter().map(OsString::from).collect(),
        cwd: config.cwd.clone(),
        env: config.env(),
    }
}

/// Modes and models the agent advertised for the session, and the values
/// in effect.
#[derive(Debug, Default)]
struct Settings {
    modes: Vec<String>,
    models: Vec<String>,
    mode: Option<String>,
    model: Option<String>,
}

impl Settings {
    /// Reads `modes` and `models` from a `session/new` or `session/load`
    /// response.
    fn from_session(response: &Value) -> Self {
        let ids = |pointer: &str, key: &str| -> Vec<String> {
            response
                .pointer(pointer)
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|item| str_field(item, key)).collect())
                .unwrap_or_default()
        };
        let current = |pointer: &str| response.pointer(pointer).and_then(Value::as_str).map(str::to_string);
        Self {
            modes: ids("/modes/availableModes", "id"),
            models: ids("/models/availableModels", "modelId"),
            mode: current("/modes/currentModeId"),
            model: current("/models/currentModelId"),
        }
    }

    fn offered(&self, setting: Setting) -> &[String] {
        match setting {
            Setting::Mode => &self.modes,
            Setting::Model => &self.models,
        }
    }

    fn current_mut(&mut self, setting: Setting) -> &mut Option<String> {
        match setting {
            Setting::Mode => &mut self.mode,
            Setting::Model => &mut self.model,
        }
    }

    /// Checks `value` against what the agent offers.
    fn check(&self, setting: Setting, value: &str) -> Result<ConfigChange> {
        let offered = self.offered(setting);
        if offered.is_empty() {
            return Ok(ConfigChange::Unsupported);
        }
        if !offered.iter().any(|v| v == value) {
            return Err(anyhow!(EngineError::rejected(format!(
                "Unknown {} '{value}' (available: {})",
                setting.name(),
                offered.join(", ")
            ))));
        }
        Ok(ConfigChange::Applied)
    }
}

/// State shared between the adapter and its pump.
#[derive(Default)]
struct Shared {
    /// Set while `session/load` replays history we already have.
    replaying: AtomicBool,
    exit: Mutex<Option<String>>,
    settings: Mutex<Settings>,
}

impl Shared {
    fn exit_error(&self) -> Option<String> {
        self.exit.lock().ok().and_then(|exit| exit.clone())
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn setting_request(setting: Setting, session_id: &str, value: &str) -> (&'static str, Value) {
    match setting {
        Setting::Mode => (
            "session/set_mode",
            json!({"sessionId": session_id, "modeId": value}),
        ),
        Setting::Model => (
            "session/set_model",
            json!({"sessionId": session_id, "modelId": value}),
        ),
    }
}

pub struct AcpAdapter {
    peer: RpcPeer,
    session_id: String,
    sink: EventSink,
    shared: Arc<Shared>,
    guard: ProcessGuard,
    pump: JoinHandle<()>,
}

impl fmt::Debug for AcpAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcpAdapter")
            .field("session_id", &self.session_id)
            .field("settings", &*self.shared.settings())
            .finish_non_exhaustive()
    }
}

impl AcpAdapter {
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
        let peer = RpcPeer::new(outgoing, Dialect::JsonRpc2);
        let shared = Arc::new(Shared::default());
        let pump = tokio::spawn(pump(
            incoming,
            peer.clone(),
            sink.clone(),
            Arc::clone(&shared),
        ));

        match handshake(&config, &peer, &shared).await {
            Ok((session_id, response)) => {
                *shared.settings() = Settings::from_session(&response);
                let wanted = [(Setting::Mode, &config.mode), (Setting::Model, &config.model)];
                for (setting, value) in wanted {
                    let Some(value) = value else {
                        continue;
                    };
                    if !matches!(shared.settings().check(setting, value), Ok(ConfigChange::Applied)) {
                        tracing::warn!("agent does not offer {} {value}", setting.name());
                        continue;
                    }
                    let (method, params) = setting_request(setting, &session_id, value);
                    match peer.request(method, params).await {
                        Ok(_) => *shared.settings().current_mut(setting) = Some(value.clone()),
                        Err(e) => tracing::warn!("agent rejected initial {} {value}: {e:#}", setting.name()),
                    }
                }

                let model = shared.settings().model.clone();
                let info = StartInfo {
                    resume_id: Some(session_id.clone()),
                    model: model.or(config.model.clone()),
                };
                Ok((
                    Self {
                        peer,
                        session_id,
                        sink,
                        shared,
                        guard,
                        pump,
                    },
                    info,
                ))
            }
            Err(e) => {
                pump.abort();
                Err(e)
            }
        }
    }

    pub fn send(&mut self, text: &str, images: &[ImageAttachment]) -> Result<()> {
        if self.pump.is_finished() {
            return Err(anyhow!(EngineError::transport("agent is no longer running")));
        }
        let mut prompt = vec![json!({"type": "text", "text": text})];
        prompt.extend(images.iter().map(|image| {
            json!({"type": "image", "mimeType": image.mime_type, "data": image.data})
        }));

        let peer = self.peer.clone();
        let sink = self.sink.clone();
        let params = json!({"sessionId": self.session_id, "prompt": prompt});
        tokio::spawn(async move {
            let error = match peer.request("session/prompt", params).await {
                Ok(response) => match response.get("stopReason").and_then(Value::as_str) {
                    Some("refusal") => Some(EngineError::rejected("The agent refused to continue")),
                    _ => None,
                },
                Err(e) => Some(
                    EngineError::find(&e)
                        .cloned()
                        .unwrap_or_else(|| EngineError::rejected(format!("{e:#}"))),
                ),
            };
            sink.emit(EngineEvent::TurnCompleted { error });
        });
        Ok(())
    }

    pub fn interrupt(&mut self) -> Result<()> {
        self.peer
            .notify("session/cancel", json!({"sessionId": self.session_id}))
    }

    /// Only modes advertised by the agent are accepted; an agent that
    /// advertises none cannot change modes.
    pub fn set_mode(&mut self, mode: &str) -> Result<ConfigChange> {
        self.change_setting(Setting::Mode, mode)
    }

    pub fn set_model(&mut self, model: &str) -> Result<ConfigChange> {
        self.change_setting(Setting::Model, model)
    }

    pub fn stop(&mut self) {
        self.guard.terminate();
    }

    /// Sends the change and reports it applied. A refusal arrives later as
    /// [`EngineEvent::SettingRejected`] carrying the value still in effect.
    fn change_setting(&mut self, setting: Setting, value: &str) -> Result<ConfigChange> {
        let previous = {
            let mut settings = self.shared.settings();
            if settings.check(setting, value)? == ConfigChange::Unsupported {
                return Ok(ConfigChange::Unsupported);
            }
            settings.current_mut(setting).replace(value.to_string())
        };

        let (method, params) = setting_request(setting, &self.session_id, value);
        let peer = self.peer.clone();
        let sink = self.sink.clone();
        let shared = Arc::clone(&self.shared);
        let value = value.to_string();
        tokio::spawn(async move {
            let Err(e) = peer.request(method, params).await else {
                return;
            };
            let unsupported = error_code(&e) == Some(METHOD_NOT_FOUND);
            let current = {
                let mut settings = shared.settings();
                if unsupported {
                    match setting {
                        Setting::Mode => settings.modes.clear(),
                        Setting::Model => settings.models.clear(),
                    }
                }
                let current = settings.current_mut(setting);
                if current.as_deref() == Some(value.as_str()) {
                    current.clone_from(&previous);
                }
                current.clone()
            };
            let message = if unsupported {
                format!("The agent does not support {method}")
            } else {
                format!("The agent refused {} {value}: {e:#}", setting.name())
            };
            sink.emit(EngineEvent::SettingRejected {
                setting,
                current,
                unsupported,
                message,
            });
        });
        Ok(ConfigChange::Applied)
    }
}

/// Runs `initialize` and opens the agent session. Returns its id and the
/// response carrying modes and models.
async fn handshake(
    config: &StartConfig,
    peer: &RpcPeer,
    shared: &Shared,
) -> Result<(String, Value)> {
    let init = peer
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientCapabilities": {
                    "fs": {"readTextFile": false, "writeTextFile": false},
                    "terminal": false,
                },
            }),
        )
        .await
        .map_err(|e| handshake_error(e, shared))?;
    tracing::debug!(agent = ?init.get("agentInfo"), "acp agent initialized");

    let cwd = config.cwd.to_string_lossy();
    match &config.resume {
        Some(resume) => {
            let can_load = init
                .pointer("/agentCapabilities/loadSession")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !can_load {
                return Err(anyhow!(EngineError::revival(
                    "The agent cannot load previous sessions"
                )));
            }

            shared.replaying.store(true, Ordering::SeqCst);
            let loaded = peer
                .request(
                    "session/load",
                    json!({"sessionId": resume, "cwd": cwd, "mcpServers": []}),
                )
                .await;
            shared.replaying.store(false, Ordering::SeqCst);

            match loaded {
                Ok(response) => Ok((resume.clone(), response)),
                Err(e) => match EngineError::kind_of(&e) {
                    Some(EngineErrorKind::Auth | EngineErrorKind::Transport) => {
                        Err(handshake_error(e, shared))
                    }
                    _ => Err(anyhow!(
                        EngineError::revival(format!("The agent could not load session {resume}"))
                            .with_details(format!("{e:#}"))
                    )),
                },
            }
        }
        None => {
            let response = peer
                .request("session/new", json!({"cwd": cwd, "mcpServers": []}))
                .await
                .map_err(|e| handshake_error(e, shared))?;
            let session_id = response
                .get("sessionId")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!(EngineError::protocol("session/new returned no sessionId")))?
                .to_string();
            Ok((session_id, response))
        }
    }
}

fn handshake_error(err: anyhow::Error, shared: &Shared) -> anyhow::Error {
    match EngineError::kind_of(&err) {
        Some(EngineErrorKind::Transport) => {
            anyhow!(closed_during_handshake(EngineKind::Acp, shared.exit_error()))
        }
        Some(EngineErrorKind::Auth) => err,
        _ => anyhow!(EngineError::spawn("The agent failed to start").with_details(format!("{err:#}"))),
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
        tools: HashMap::new(),
    };
    while let Some(frame) = incoming.recv().await {
        match frame {
            Frame::Message(message) => match peer.classify(message) {
                Incoming::Handled => {}
                Incoming::Notification { method, params } if method == "session/update" => {
                    if shared.replaying.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Some(update) = params.get("update") {
                        translator.update(update);
                    }
                }
                Incoming::Notification { method, params } => {
                    sink.emit(EngineEvent::Unmapped {
                        kind: method,
                        raw: params,
                    });
                }
                Incoming::Request { id, method, params } => {
                    translator.request(id, &method, &params);
                }
                Incoming::Invalid(raw) => {
                    tracing::warn!("invalid JSON-RPC message from agent");
                    sink.emit(EngineEvent::Unmapped {
                        kind: "invalid".to_string(),
                        raw,
                    });
                }
            },
            Frame::Malformed { line, error } => {
                tracing::warn!(%error, "malformed line from agent");
                sink.emit(EngineEvent::Unmapped {
                    kind: "malformed".to_string(),
                    raw: json!({"line": line, "error": error}),
                });
            }
            Frame::Closed { error } => {
                if let Ok(mut exit) = shared.exit.lock() {
                    *exit = error.clone();
                }
                peer.fail_all();
                sink.emit(EngineEvent::Exited { error });
                break;
            }
        }
    }
}

/// What we know about a tool call; updates only carry changed fields.
#[derive(Debug, Default, Clone)]
struct ToolState {
    kind: Option<String>,
    title: String,
    raw_input: Value,
    locations: Vec<Value>,
    content: Vec<Value>,
}

impl ToolState {
    fn merge(&mut self, update: &Value) -> bool {
        let mut changed = false;
        if let Some(kind) = update.get("kind").and_then(Value::as_str) {
            self.kind = Some(kind.to_string());
            changed = true;
        }
        if let Some(title) = update.get("title").and_then(Value::as_str) {
            self.title = title.to_string();
            changed = true;
        }
        if let Some(raw) = update.get("rawInput") {
            self.raw_input = raw.clone();
            changed = true;
        }
        if let Some(locations) = update.get("locations").and_then(Value::as_array) {
            self.locations.clone_from(locations);
            changed = true;
        }
        if let Some(content) = update.get("content").and_then(Value::as_array) {
            self.content.clone_from(content);
        }
        changed
    }

    fn normalized(&self) -> NormalizedTool {
        from_acp(
            self.kind.as_deref(),
            &self.title,
            &self.raw_input,
            &self.locations,
            &self.content,
        )
    }
}

struct Translator {
    peer: RpcPeer,
    sink: EventSink,
    shared: Arc<Shared>,
    tools: HashMap<String, ToolState>,
}

impl Translator {
    fn update(&mut self, update: &Value) {
        let kind = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match kind {
            "agent_message_chunk" | "agent_thought_chunk" => {
                let Some(text) = update.pointer("/content/text").and_then(Value::as_str) else {
                    return;
                };
                let fragment = Fragment::Delta(text.to_string());
                self.sink.emit(if kind == "agent_thought_chunk" {
                    EngineEvent::Reasoning {
                        segment: None,
                        fragment,
                        parent_tool_use_id: None,
                    }
                } else {
                    EngineEvent::Text {
                        segment: None,
                        fragment,
                        parent_tool_use_id: None,
                    }
                });
            }
            "user_message_chunk" | "available_commands_update" => {}
            "tool_call" => {
                let id = str_field(update, "toolCallId").unwrap_or_default();
                let mut state = ToolState::default();
                state.merge(update);
                let tool = state.normalized();
                self.sink.emit(EngineEvent::ToolCall {
                    tool_use_id: id.clone(),
                    name: tool.name,
                    input: tool.input,
                    parent_tool_use_id: None,
                });
                self.tools.insert(id.clone(), state);
                self.finish_tool(&id, update);
            }
            "tool_call_update" => {
                let id = str_field(update, "toolCallId").unwrap_or_default();
                let state = self.tools.entry(id.clone()).or_default();
                if state.merge(update) {
                    let tool = state.normalized();
                    self.sink.emit(EngineEvent::ToolCallUpdate {
                        tool_use_id: id.clone(),
                        name: Some(tool.name),
                        input: tool.input,
                        parent_tool_use_id: None,
                    });
                }
                self.finish_tool(&id, update);
            }
            "plan" => {
                let todos: Vec<Value> = update
                    .get("entries")
                    .and_then(Value::as_array)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|e| {
                                json!({
                                    "content": e.get("content").cloned().unwrap_or(Value::Null),
                                    "status": e.get("status").cloned().unwrap_or(json!("pending")),
                                    "priority": e.get("priority").cloned().unwrap_or(Value::Null),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                self.sink.emit(EngineEvent::ToolCall {
                    tool_use_id: PLAN_TOOL_ID.to_string(),
                    name: TODO_WRITE.to_string(),
                    input: json!({"todos": todos}),
                    parent_tool_use_id: None,
                });
            }
            "current_mode_update" => {
                let mode = str_field(update, "currentModeId").unwrap_or_default();
                *self.shared.settings().current_mut(Setting::Mode) = Some(mode.clone());
                self.sink.emit(EngineEvent::Notice {
                    text: format!("Mode changed to {mode}"),
                    is_error: false,
                });
            }
            _ => self.sink.emit(EngineEvent::Unmapped {
                kind: format!("session/update:{kind}"),
                raw: update.clone(),
            }),
        }
    }

    /// Emits the result once the call reaches a terminal status.
    fn finish_tool(&mut self, id: &str, update: &Value) {
        let status = update.get("status").and_then(Value::as_str);
        if !matches!(status, Some("completed" | "failed")) {
            return;
        }
        let content = self
            .tools
            .remove(id)
            .map(|state| state.content)
            .unwrap_or_default();
        let output = if content.is_empty() {
            update.get("rawOutput").cloned().unwrap_or(Value::Null)
        } else {
            content_output(&content)
        };
        self.sink.emit(EngineEvent::ToolResult {
            tool_use_id: id.to_string(),
            output,
            is_error: status == Some("failed"),
            parent_tool_use_id: None,
        });
    }

    fn request(&mut self, id: Value, method: &str, params: &Value) {
        if method != "session/request_permission" {
            tracing::debug!(method, "declining agent request");
            let _ = self
                .peer
                .respond_error(id, METHOD_NOT_FOUND, &format!("Method not found: {method}"));
            return;
        }

        let tool_call = params.get("toolCall").unwrap_or(&Value::Null);
        let tool_use_id = str_field(tool_call, "toolCallId");
        let mut state = tool_use_id
            .as_ref()
            .and_then(|id| self.tools.get(id))
            .cloned()
            .unwrap_or_default();
        state.merge(tool_call);
        let tool = state.normalized();

        let mut request = PermissionRequest::new(self.sink.session_id().clone(), tool.name, tool.input);
        request.tool_use_id = tool_use_id;
        request.description = Some(state.title).filter(|t| !t.is_empty());
        request.options = params
            .get("options")
            .and_then(Value::as_array)
            .map(|options| options.iter().filter_map(parse_option).collect())
            .unwrap_or_default();

        let (responder, receiver) = PermissionResponder::channel();
        self.sink.emit(EngineEvent::PermissionRequested { request, responder });

        let peer = self.peer.clone();
        tokio::spawn(async move {
            let resolution = receiver.recv().await;
            let _ = peer.respond(id, permission_outcome(&resolution));
        });
    }
}

fn parse_option(option: &Value) -> Option<PermissionOption> {
    let kind = OptionKind::from_wire(option.get("kind").and_then(Value::as_str)?)?;
    let id = option.get("optionId").and_then(Value::as_str)?;
    let label = option.get("name").and_then(Value::as_str).unwrap_or(id);
    Some(PermissionOption::new(id, kind, label))
}

fn permission_outcome(resolution: &PermissionResolution) -> Value {
    match (&resolution.option_id, resolution.origin) {
        (Some(option_id), ResolutionOrigin::User | ResolutionOrigin::Policy) => {
            json!({"outcome": {"outcome": "selected", "optionId": option_id}})
        }
        _ => json!({"outcome": {"outcome": "cancelled"}}),
    }
}

/// Flattens ACP tool content into a string when it is only text.
fn content_output(content: &[Value]) -> Value {
    let texts: Vec<&str> = content
        .iter()
        .filter_map(|c| match c.get("type").and_then(Value::as_str) {
            Some("content") => c.pointer("/content/text").and_then(Value::as_str),
            _ => None,
        })
        .collect();
    if texts.len() == content.len() {
        Value::String(texts.join("\n"))
    } else {
        Value::Array(content.to_vec())
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
