//! Claude Code CLI adapter.
//!
//! Drives `claude -p --input-format stream-json --output-format stream-json`.
//! User turns are written as `user` lines; the CLI answers with partial
//! `stream_event`s, per-block `assistant` snapshots, `user` tool results and a
//! closing `result`. Tool approvals and runtime settings travel as
//! `control_request` / `control_response` pairs.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::tool_names::from_claude;
use super::transport::{Frame, LaunchSpec, ProcessGuard, Transport};
use super::{
    ConfigChange, Setting, StartConfig, StartInfo, closed_during_handshake, looks_like_auth_failure,
};
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventSink, Fragment};
use crate::core::permissions::{
    OptionKind, PermissionOption, PermissionRequest, PermissionResolution, PermissionResponder,
    ResolutionOrigin,
};
use crate::core::session::{EngineKind, SessionId};
use crate::core::timeline::ImageAttachment;

const DEFAULT_DENY_MESSAGE: &str = "The user declined this tool call";

pub fn launch_spec(config: &StartConfig) -> LaunchSpec {
    let mut args: Vec<OsString> = [
        "-p",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        "--include-partial-messages",
        "--permission-prompt-tool",
        "stdio",
    ]
    .iter()
    .map(OsString::from)
    .collect();

    if let Some(model) = &config.model {
        args.push("--model".into());
        args.push(model.into());
    }
    if let Some(mode) = &config.mode {
        args.push("--permission-mode".into());
        args.push(mode.into());
    }
    if let Some(resume) = &config.resume {
        args.push("--resume".into());
        args.push(resume.into());
    }
    args.extend(config.launch.args.iter().map(OsString::from));

    LaunchSpec {
        program: config.launch.binary.clone(),
        args,
        cwd: config.cwd.clone(),
        env: config.env(),
    }
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

type ControlReply = std::result::Result<Value, String>;

#[derive(Default)]
struct ControlState {
    pending: HashMap<String, oneshot::Sender<ControlReply>>,
    /// Set once the transport closed, with its error.
    exit: Option<Option<String>>,
    mode: Option<String>,
    model: Option<String>,
    /// Settings the CLI answered with an unsupported-request error.
    unsupported: Vec<Setting>,
}

impl ControlState {
    fn current_mut(&mut self, setting: Setting) -> &mut Option<String> {
        match setting {
            Setting::Mode => &mut self.mode,
            Setting::Model => &mut self.model,
        }
    }
}

/// Outstanding control requests sent to the CLI.
#[derive(Clone, Default)]
struct ControlChannel(Arc<Mutex<ControlState>>);

impl ControlChannel {
    fn register(&self, request_id: &str) -> oneshot::Receiver<ControlReply> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut state) = self.0.lock() {
            state.pending.insert(request_id.to_string(), tx);
        }
        rx
    }

    fn complete(&self, request_id: &str, reply: ControlReply) {
        let waiter = self
            .0
            .lock()
            .ok()
            .and_then(|mut state| state.pending.remove(request_id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(request_id, "control response without waiter"),
        }
    }

    fn close(&self, error: Option<String>) {
        if let Ok(mut state) = self.0.lock() {
            state.exit = Some(error);
            state.pending.clear();
        }
    }

    fn exit_error(&self) -> Option<String> {
        self.0.lock().ok().and_then(|state| state.exit.clone().flatten())
    }

    /// Records `value` as in effect and returns the previous value.
    fn set_current(&self, setting: Setting, value: Option<String>) -> Option<String> {
        self.0
            .lock()
            .ok()
            .and_then(|mut state| std::mem::replace(state.current_mut(setting), value))
    }

    /// Puts `previous` back unless something replaced `value` meanwhile.
    /// Returns the value in effect.
    fn revert(
        &self,
        setting: Setting,
        value: &str,
        previous: Option<String>,
        unsupported: bool,
    ) -> Option<String> {
        let mut state = self.0.lock().ok()?;
        if unsupported && !state.unsupported.contains(&setting) {
            state.unsupported.push(setting);
        }
        let current = state.current_mut(setting);
        if current.as_deref() == Some(value) {
            *current = previous;
        }
        current.clone()
    }

    fn is_unsupported(&self, setting: Setting) -> bool {
        self.0
            .lock()
            .is_ok_and(|state| state.unsupported.contains(&setting))
    }
}

pub struct ClaudeAdapter {
    outgoing: mpsc::UnboundedSender<Value>,
    control: ControlChannel,
    sink: EventSink,
    guard: ProcessGuard,
    pump: JoinHandle<()>,
}

impl fmt::Debug for ClaudeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaudeAdapter")
            .field("closed", &self.outgoing.is_closed())
            .finish_non_exhaustive()
    }
}

impl ClaudeAdapter {
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
        let control = ControlChannel::default();
        control.set_current(Setting::Mode, config.mode.clone());
        control.set_current(Setting::Model, config.model.clone());

        let translator = Translator::new(
            config.session_id.clone(),
            outgoing.clone(),
            sink.clone(),
            control.clone(),
        );
        let pump = tokio::spawn(pump(incoming, translator, control.clone()));

        let request_id = new_request_id();
        let reply = control.register(&request_id);
        outgoing
            .send(json!({
                "type": "control_request",
                "request_id": request_id,
                "request": {"subtype": "initialize"},
            }))
            .map_err(|e| anyhow!(EngineError::transport(format!("claude stdin closed: {e}"))))?;

        match reply.await {
            Ok(Ok(_)) => {}
            Ok(Err(message)) => {
                pump.abort();
                return Err(anyhow!(classify_failure(&message, config.resume.is_some())));
            }
            Err(_) => {
                let exit = control.exit_error();
                pump.abort();
                return Err(anyhow!(classify_exit(exit, config.resume.is_some())));
            }
        }

        let info = StartInfo {
            resume_id: config.resume.clone(),
            model: config.model.clone(),
        };
        Ok((
            Self {
                outgoing,
                control,
                sink,
                guard,
                pump,
            },
            info,
        ))
    }

    pub fn send(&mut self, text: &str, images: &[ImageAttachment]) -> Result<()> {
        let mut content = vec![json!({"type": "text", "text": text})];
        content.extend(images.iter().map(|image| {
            json!({
                "type": "image",
                "source": {"type": "base64", "media_type": image.mime_type, "data": image.data},
            })
        }));
        self.write(json!({
            "type": "user",
            "message": {"role": "user", "content": content},
            "parent_tool_use_id": null,
        }))
    }

    pub fn interrupt(&mut self) -> Result<()> {
        self.write(json!({
            "type": "control_request",
            "request_id": new_request_id(),
            "request": {"subtype": "interrupt"},
        }))
    }

    pub fn set_mode(&mut self, mode: &str) -> Result<ConfigChange> {
        self.change_setting(Setting::Mode, mode)
    }

    pub fn set_model(&mut self, model: &str) -> Result<ConfigChange> {
        self.change_setting(Setting::Model, model)
    }

    pub fn stop(&mut self) {
        self.guard.terminate();
    }

    /// Sends the control request and reports the change applied. An error
    /// reply arrives later as [`EngineEvent::SettingRejected`].
    fn change_setting(&mut self, setting: Setting, value: &str) -> Result<ConfigChange> {
        if self.control.is_unsupported(setting) {
            return Ok(ConfigChange::Unsupported);
        }
        let request = match setting {
            Setting::Mode => json!({"subtype": "set_permission_mode", "mode": value}),
            Setting::Model => json!({"subtype": "set_model", "model": value}),
        };
        let request_id = new_request_id();
        let reply = self.control.register(&request_id);
        self.write(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": request,
        }))?;
        let previous = self.control.set_current(setting, Some(value.to_string()));

        let control = self.control.clone();
        let sink = self.sink.clone();
        let value = value.to_string();
        tokio::spawn(async move {
            // A dropped waiter means the CLI exited, which is reported on its own.
            let Ok(Err(error)) = reply.await else {
                return;
            };
            let unsupported = error.to_lowercase().contains("unsupported");
            let current = control.revert(setting, &value, previous, unsupported);
            sink.emit(EngineEvent::SettingRejected {
                setting,
                current,
                unsupported,
                message: format!("claude refused {} {value}: {error}", setting.name()),
            });
        });
        Ok(ConfigChange::Applied)
    }

    fn write(&self, message: Value) -> Result<()> {
        if self.pump.is_finished() {
            return Err(anyhow!(EngineError::transport("claude is no longer running")));
        }
        self.outgoing
            .send(message)
            .map_err(|e| anyhow!(EngineError::transport(format!("claude stdin closed: {e}"))))
    }
}

fn classify_exit(error: Option<String>, resuming: bool) -> EngineError {
    match error {
        Some(detail) if resuming && detail.contains("No conversation found") => {
            EngineError::revival("claude could not find the conversation to resume")
                .with_details(detail)
        }
        other => closed_during_handshake(EngineKind::Claude, other),
    }
}

fn classify_failure(message: &str, resuming: bool) -> EngineError {
    if resuming && message.contains("No conversation found") {
        EngineError::revival(message.to_string())
    } else if looks_like_auth_failure(message) {
        EngineError::auth(message.to_string())
    } else {
        EngineError::spawn(format!("claude rejected initialization: {message}"))
    }
}

async fn pump(
    mut incoming: mpsc::UnboundedReceiver<Frame>,
    mut translator: Translator,
    control: ControlChannel,
) {
    while let Some(frame) = incoming.recv().await {
        match frame {
            Frame::Message(message) => {
                if message.get("type").and_then(Value::as_str) == Some("control_response") {
                    route_control_response(&control, &message);
                } else {
                    translator.handle(message);
                }
            }
            Frame::Malformed { line, error } => {
                tracing::warn!(%error, "malformed line from claude");
                translator.sink.emit(EngineEvent::Unmapped {
                    kind: "malformed".to_string(),
                    raw: json!({"line": line, "error": error}),
                });
            }
            Frame::Closed { error } => {
                control.close(error.clone());
                translator.sink.emit(EngineEvent::Exited { error });
                break;
            }
        }
    }
}

fn route_control_response(control: &ControlChannel, message: &Value) {
    let response = message.get("response").unwrap_or(&Value::Null);
    let Some(request_id) = response.get("request_id").and_then(Value::as_str) else {
        tracing::debug!("control response without request id");
        return;
    };
    let reply = if response.get("subtype").and_then(Value::as_str) == Some("error") {
        Err(response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string())
    } else {
        Ok(response.get("response").cloned().unwrap_or(Value::Null))
    };
    control.complete(request_id, reply);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Other,
}

/// Partial message being streamed at one nesting level.
#[derive(Debug, Default)]
struct StreamedMessage {
    id: String,
    blocks: HashMap<u64, (BlockKind, String)>,
}

impl StreamedMessage {
    fn streamed(&self, kind: BlockKind, text: &str) -> bool {
        self.blocks.values().any(|(k, t)| *k == kind && t == text)
    }
}

/// Turns CLI output lines into engine events.
struct Translator {
    session_id: SessionId,
    outgoing: mpsc::UnboundedSender<Value>,
    sink: EventSink,
    control: ControlChannel,
    streaming: HashMap<Option<String>, StreamedMessage>,
    reported_cost: f64,
}

impl Translator {
    fn new(
        session_id: SessionId,
        outgoing: mpsc::UnboundedSender<Value>,
        sink: EventSink,
        control: ControlChannel,
    ) -> Self {
        Self {
            session_id,
            outgoing,
            sink,
            control,
            streaming: HashMap::new(),
            reported_cost: 0.0,
        }
    }

    fn handle(&mut self, message: Value) {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parent = message
            .get("parent_tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        match kind.as_str() {
            "system" => self.handle_system(&message),
            "stream_event" => {
                if let Some(event) = message.get("event") {
                    self.handle_stream_event(event, parent);
                }
            }
            "assistant" => self.handle_assistant(&message, parent),
            "user" => self.handle_user(&message, parent),
            "result" => self.handle_result(&message),
            "control_request" => self.handle_control_request(&message),
            "control_cancel_request" | "keep_alive" => {}
            _ => self.sink.emit(EngineEvent::Unmapped { kind, raw: message }),
        }
    }

    fn handle_system(&mut self, message: &Value) {
        match message.get("subtype").and_then(Value::as_str) {
            Some("init") => {
                let model = str_field(message, "model");
                if model.is_some() {
                    self.control.set_current(Setting::Model, model.clone());
                }
                self.sink.emit(EngineEvent::SessionConfigured {
                    resume_id: str_field(message, "session_id"),
                    model,
                });
            }
            Some("compact_boundary") => {
                let trigger = message
                    .pointer("/compact_metadata/trigger")
                    .and_then(Value::as_str)
                    .unwrap_or("auto");
                self.sink.emit(EngineEvent::Compacted {
                    summary: format!("Conversation compacted ({trigger})"),
                });
            }
            other => tracing::debug!(subtype = ?other, "ignoring claude system message"),
        }
    }

    fn handle_stream_event(&mut self, event: &Value, parent: Option<String>) {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let id = event
                    .pointer("/message/id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.streaming.insert(
                    parent,
                    StreamedMessage {
                        id,
                        blocks: HashMap::new(),
                    },
                );
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let block = event.get("content_block").unwrap_or(&Value::Null);
                let kind = match block.get("type").and_then(Value::as_str) {
                    Some("text") => BlockKind::Text,
                    Some("thinking") => BlockKind::Thinking,
                    Some("tool_use") => {
                        let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                        let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                        let tool = from_claude(name, &json!({}));
                        self.sink.emit(EngineEvent::ToolCall {
                            tool_use_id: id.to_string(),
                            name: tool.name,
                            input: tool.input,
                            parent_tool_use_id: parent.clone(),
                        });
                        BlockKind::Other
                    }
                    _ => BlockKind::Other,
                };
                if let Some(message) = self.streaming.get_mut(&parent) {
                    message.blocks.insert(index, (kind, String::new()));
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let delta = event.get("delta").unwrap_or(&Value::Null);
                let (kind, text) = match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => (BlockKind::Text, delta.get("text")),
                    Some("thinking_delta") => (BlockKind::Thinking, delta.get("thinking")),
                    _ => return,
                };
                let Some(text) = text.and_then(Value::as_str) else {
                    return;
                };

                let segment = self.streaming.get_mut(&parent).map(|message| {
                    message
                        .blocks
                        .entry(index)
                        .or_insert((kind, String::new()))
                        .1
                        .push_str(text);
                    message.id.clone()
                });
                let fragment = Fragment::Delta(text.to_string());
                self.sink.emit(match kind {
                    BlockKind::Thinking => EngineEvent::Reasoning {
                        segment,
                        fragment,
                        parent_tool_use_id: parent,
                    },
                    _ => EngineEvent::Text {
                        segment,
                        fragment,
                        parent_tool_use_id: parent,
                    },
                });
            }
            _ => {}
        }
    }

    fn handle_assistant(&mut self, message: &Value, parent: Option<String>) {
        let Some(body) = message.get("message") else {
            return;
        };
        let id = str_field(body, "id");
        let streamed = self
            .streaming
            .get(&parent)
            .filter(|m| id.as_deref() == Some(m.id.as_str()));
        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                    if !streamed.is_some_and(|m| m.streamed(BlockKind::Text, text)) {
                        events.push(EngineEvent::Text {
                            segment: id.clone(),
                            fragment: Fragment::Snapshot(text.to_string()),
                            parent_tool_use_id: parent.clone(),
                        });
                    }
                }
                Some("thinking") => {
                    let text = block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !streamed.is_some_and(|m| m.streamed(BlockKind::Thinking, text)) {
                        events.push(EngineEvent::Reasoning {
                            segment: id.clone(),
                            fragment: Fragment::Snapshot(text.to_string()),
                            parent_tool_use_id: parent.clone(),
                        });
                    }
                }
                Some("tool_use") => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    let tool = from_claude(name, &input);
                    events.push(EngineEvent::ToolCall {
                        tool_use_id: str_field(block, "id").unwrap_or_default(),
                        name: tool.name,
                        input: tool.input,
                        parent_tool_use_id: parent.clone(),
                    });
                }
                _ => {}
            }
        }
        for event in events {
            self.sink.emit(event);
        }
    }

    fn handle_user(&mut self, message: &Value, parent: Option<String>) {
        let Some(blocks) = message.pointer("/message/content").and_then(Value::as_array) else {
            return;
        };
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            self.sink.emit(EngineEvent::ToolResult {
                tool_use_id: str_field(block, "tool_use_id").unwrap_or_default(),
                output: tool_result_output(block.get("content")),
                is_error: block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                parent_tool_use_id: parent.clone(),
            });
        }
    }

    fn handle_result(&mut self, message: &Value) {
        if let Some(total) = message.get("total_cost_usd").and_then(Value::as_f64) {
            let delta = if total >= self.reported_cost {
                total - self.reported_cost
            } else {
                total
            };
            self.reported_cost = total;
            if delta > 0.0 {
                self.sink.emit(EngineEvent::Cost { delta_usd: delta });
            }
        }
        self.streaming.clear();

        let is_error = message
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let subtype = message
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("success");
        let error = (is_error || subtype != "success").then(|| {
            let text = str_field(message, "result").unwrap_or_else(|| subtype.to_string());
            if looks_like_auth_failure(&text) {
                EngineError::auth(text)
            } else {
                EngineError::rejected(text)
            }
        });
        self.sink.emit(EngineEvent::TurnCompleted { error });
    }

    fn handle_control_request(&mut self, message: &Value) {
        let request_id = str_field(message, "request_id").unwrap_or_default();
        let request = message.get("request").unwrap_or(&Value::Null);
        if request.get("subtype").and_then(Value::as_str) != Some("can_use_tool") {
            tracing::debug!(?request, "unsupported claude control request");
            let _ = self.outgoing.send(json!({
                "type": "control_response",
                "response": {
                    "subtype": "error",
                    "request_id": request_id,
                    "error": "Unsupported control request",
                },
            }));
            return;
        }

        let tool_name = request
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let raw_input = request.get("input").cloned().unwrap_or_else(|| json!({}));
        let suggestions = request
            .get("permission_suggestions")
            .filter(|s| s.as_array().is_some_and(|a| !a.is_empty()))
            .cloned();

        let tool = from_claude(tool_name, &raw_input);
        let mut permission = PermissionRequest::new(self.session_id.clone(), tool.name, tool.input);
        permission.tool_use_id = str_field(request, "tool_use_id");
        permission.description = str_field(request, "decision_reason");
        permission.options = synthesized_options(suggestions.is_some());

        let (responder, receiver) = PermissionResponder::channel();
        self.sink.emit(EngineEvent::PermissionRequested {
            request: permission,
            responder,
        });

        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            let resolution = receiver.recv().await;
            let response = permission_response(&resolution, raw_input, suggestions);
            let _ = outgoing.send(json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": request_id,
                    "response": response,
                },
            }));
        });
    }
}

/// Claude does not send options; offer the ones its protocol can express.
fn synthesized_options(can_remember: bool) -> Vec<PermissionOption> {
    let mut options = vec![PermissionOption::new("allow", OptionKind::AllowOnce, "Allow")];
    if can_remember {
        options.push(PermissionOption::new(
            "allow_always",
            OptionKind::AllowAlways,
            "Always allow",
        ));
    }
    options.push(PermissionOption::new("deny", OptionKind::RejectOnce, "Deny"));
    options
}

fn permission_response(
    resolution: &PermissionResolution,
    raw_input: Value,
    suggestions: Option<Value>,
) -> Value {
    if resolution.is_allow() {
        let mut response = json!({"behavior": "allow", "updatedInput": raw_input});
        if resolution.decision == OptionKind::AllowAlways
            && let Some(suggestions) = suggestions
        {
            response["updatedPermissions"] = suggestions;
        }
        response
    } else {
        json!({
            "behavior": "deny",
            "message": resolution.message.as_deref().unwrap_or(DEFAULT_DENY_MESSAGE),
            "interrupt": resolution.origin == ResolutionOrigin::ForcedDenial,
        })
    }
}

fn tool_result_output(content: Option<&Value>) -> Value {
    match content {
        Some(Value::String(s)) => Value::String(s.clone()),
        Some(Value::Array(parts)) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if texts.len() == parts.len() {
                Value::String(texts.join("\n"))
            } else {
                Value::Array(parts.clone())
            }
        }
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
