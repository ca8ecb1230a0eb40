//! Interactive chat: a line-oriented driver of the session registry.
//!
//! Plain lines are sent to the foreground session; lines starting with `/`
//! are commands. Engine output is printed as the foreground timeline grows.

use std::io::{BufRead, Write};

use anyhow::{Context, Result, bail};
use concord_core::config::Config;
use concord_core::core::events::EngineMessage;
use concord_core::core::permissions::{OptionKind, PermissionPolicy, PermissionRequest};
use concord_core::core::registry::{EngineSelection, RegistryNotice, SessionRegistry};
use concord_core::core::session::{EngineKind, SessionId, SessionState};
use concord_core::core::timeline::CanonicalMessage;
use concord_core::engines::ConfigChange;
use tokio::sync::{broadcast, mpsc};

use super::sessions::{format_entry, format_summary, short_id};

pub struct ChatOptions {
    pub project: String,
    pub engine: Option<EngineKind>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub session: Option<String>,
    pub policy: Option<PermissionPolicy>,
}

const HELP: &str = "\
Commands:
  /new [engine]        start a session (claude, acp, codex)
  /switch <id>         bring a session to the foreground
  /sessions            list sessions of this project
  /engine <engine>     continue in a new session on another engine
  /model <name>        change the model
  /mode <name>         change the mode
  /rename <title>      rename the session
  /interrupt           stop the running turn
  /allow, /always      approve the pending tool request (once, for the session)
  /deny [reason]       reject the pending tool request
  /policy <policy>     ask, auto-accept-once or allow-everything
  /quit                leave (sessions are saved)";

enum Input {
    Line(Option<String>),
    Engine(Option<EngineMessage>),
    Notice(Result<RegistryNotice, broadcast::error::RecvError>),
}

enum Flow {
    Continue,
    Quit,
}

pub async fn run(options: ChatOptions, mut config: Config) -> Result<()> {
    if let Some(policy) = options.policy {
        config.permission_policy = policy;
    }
    let default_engine = config.default_engine;
    let mut registry = SessionRegistry::with_defaults(config);
    let mut notices = registry.subscribe();

    let current = match options.session {
        Some(id) => {
            let id = SessionId::from(id);
            registry
                .switch_session(&id)
                .with_context(|| format!("open session '{id}'"))?;
            id
        }
        None => registry.create_session(
            &options.project,
            EngineSelection {
                kind: options.engine.unwrap_or(default_engine),
                model: options.model,
                mode: options.mode,
            },
        ),
    };
    let mut chat = Chat {
        project: options.project,
        current,
        printer: Printer::default(),
    };
    println!("Type a message, or /help for commands.");
    chat.render(&registry);

    let mut lines = spawn_stdin_reader();
    let mut input_closed = false;
    loop {
        if input_closed && !chat.busy(&registry) {
            break;
        }
        let input = tokio::select! {
            line = lines.recv(), if !input_closed => Input::Line(line),
            message = registry.next_message() => Input::Engine(message),
            notice = notices.recv() => Input::Notice(notice),
        };

        match input {
            Input::Line(None) => input_closed = true,
            Input::Line(Some(line)) => match chat.handle_line(&mut registry, line.trim()) {
                Ok(Flow::Quit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => eprintln!("{e:#}"),
            },
            Input::Engine(Some(message)) => registry.handle(message),
            Input::Engine(None) => break,
            Input::Notice(Ok(notice)) => chat.notice(&registry, notice),
            Input::Notice(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::debug!(skipped, "chat fell behind on registry notices");
            }
            Input::Notice(Err(broadcast::error::RecvError::Closed)) => break,
        }
        chat.render(&registry);
    }

    chat.printer.finish_line();
    registry.shutdown();
    Ok(())
}

/// Reads stdin on a plain thread; `None` on the channel means EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

struct Chat {
    project: String,
    current: SessionId,
    printer: Printer,
}

impl Chat {
    /// Whether the foreground session still has work in flight.
    fn busy(&self, registry: &SessionRegistry) -> bool {
        let Some(state) = registry.session_state(&self.current) else {
            return false;
        };
        registry.is_live(&self.current)
            && (state.processing || !state.connected || registry.queued_sends(&self.current) > 0)
    }

    fn render(&mut self, registry: &SessionRegistry) {
        if let Some(state) = registry.foreground() {
            self.printer.render(state);
        }
    }

    fn handle_line(&mut self, registry: &mut SessionRegistry, line: &str) -> Result<Flow> {
        if line.is_empty() {
            return Ok(Flow::Continue);
        }
        let Some(command) = line.strip_prefix('/') else {
            registry.send(&self.current, line, Vec::new())?;
            return Ok(Flow::Continue);
        };

        let (name, arg) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(n, a)| (n, a.trim()));
        match name {
            "quit" | "exit" => return Ok(Flow::Quit),
            "help" => println!("{HELP}"),
            "new" => {
                let kind = if arg.is_empty() {
                    registry
                        .session_state(&self.current)
                        .map_or(EngineKind::Claude, |s| s.meta.engine)
                } else {
                    arg.parse()?
                };
                self.current = registry.create_session(&self.project, EngineSelection::new(kind));
            }
            "switch" => {
                let id = resolve_id(registry, require(arg, "/switch <id>")?)?;
                registry.switch_session(&id)?;
                self.current = id;
            }
            "sessions" => {
                for summary in registry.list_sessions(Some(&self.project))? {
                    let marker = if summary.id == self.current { "*" } else { " " };
                    println!("{marker} {}", format_summary(&summary));
                }
            }
            "engine" => {
                let kind: EngineKind = require(arg, "/engine <engine>")?.parse()?;
                self.current = registry.set_engine(&self.current, EngineSelection::new(kind))?;
            }
            "model" => {
                let model = require(arg, "/model <name>")?;
                if registry.set_model(&self.current, model)? == ConfigChange::Applied {
                    println!("Model set to {model}");
                }
            }
            "mode" => {
                let mode = require(arg, "/mode <name>")?;
                if registry.set_mode(&self.current, mode)? == ConfigChange::Applied {
                    println!("Mode set to {mode}");
                }
            }
            "rename" => registry.rename_session(&self.current, require(arg, "/rename <title>")?)?,
            "interrupt" => registry.interrupt(&self.current)?,
            "allow" => self.answer(registry, OptionKind::AllowOnce, None)?,
            "always" => self.answer(registry, OptionKind::AllowAlways, None)?,
            "deny" => {
                let reason = (!arg.is_empty()).then(|| arg.to_string());
                self.answer(registry, OptionKind::RejectOnce, reason)?;
            }
            "policy" => {
                let policy: PermissionPolicy = require(arg, "/policy <policy>")?.parse()?;
                registry.set_permission_policy(policy);
                println!("Permission policy: {arg}");
            }
            other => bail!("Unknown command '/{other}' (try /help)"),
        }
        Ok(Flow::Continue)
    }

    fn answer(
        &self,
        registry: &mut SessionRegistry,
        decision: OptionKind,
        message: Option<String>,
    ) -> Result<()> {
        let request_id = registry
            .pending_permission(&self.current)
            .map(|request| request.id.clone())
            .context("No pending permission request")?;
        registry.respond_permission(&request_id, decision, message)
    }

    fn notice(&mut self, registry: &SessionRegistry, notice: RegistryNotice) {
        match notice {
            RegistryNotice::PermissionRequested { request } => {
                self.printer.finish_line();
                if request.session_id == self.current {
                    print_permission(&request);
                } else {
                    println!(
                        "Session {} is waiting for approval of {} (/switch {} to answer)",
                        short_id(&request.session_id),
                        request.tool_name,
                        short_id(&request.session_id)
                    );
                }
            }
            RegistryNotice::AuthRequired {
                engine, message, ..
            } => {
                self.printer.finish_line();
                println!(
                    "{engine} needs you to sign in: {message}\nLog in with the {engine} CLI in a terminal, then send your message again."
                );
            }
            RegistryNotice::SessionFailed { session_id, error } if session_id != self.current => {
                self.printer.finish_line();
                let title = registry
                    .session_state(&session_id)
                    .map(|s| s.meta.title.clone())
                    .unwrap_or_default();
                println!(
                    "Background session {} {title} stopped: {}",
                    short_id(&session_id),
                    error.message
                );
            }
            RegistryNotice::SessionFailed { .. }
            | RegistryNotice::ForegroundTimelineChanged { .. }
            | RegistryNotice::SessionListChanged => {}
        }
    }
}

/// Accepts a full id or a unique prefix of one.
fn resolve_id(registry: &SessionRegistry, arg: &str) -> Result<SessionId> {
    let matches: Vec<SessionId> = registry
        .list_sessions(None)?
        .into_iter()
        .map(|summary| summary.id)
        .filter(|id| id.as_str().starts_with(arg))
        .collect();
    match matches.as_slice() {
        [id] => Ok(id.clone()),
        [] => bail!("No session matches '{arg}'"),
        _ => bail!("'{arg}' matches {} sessions", matches.len()),
    }
}

fn require<'a>(arg: &'a str, usage: &str) -> Result<&'a str> {
    if arg.is_empty() {
        bail!("Usage: {usage}");
    }
    Ok(arg)
}

fn print_permission(request: &PermissionRequest) {
    println!("Permission requested: {}", request.tool_name);
    if let Some(description) = &request.description {
        println!("  {description}");
    }
    println!("  {}", request.input);
    let mut answers = vec!["/allow"];
    if request.has_option(OptionKind::AllowAlways) {
        answers.push("/always");
    }
    answers.push("/deny [reason]");
    println!("  answer with {}", answers.join(", "));
}

/// Prints the foreground timeline incrementally.
///
/// Entries are printed once they are settled; the streaming assistant entry
/// is printed as its text grows.
#[derive(Default)]
struct Printer {
    session: Option<SessionId>,
    printed: usize,
    /// Bytes of the streaming entry's text already printed.
    partial: usize,
    mid_line: bool,
}

impl Printer {
    fn render(&mut self, state: &SessionState) {
        if self.session.as_ref() != Some(state.id()) {
            self.finish_line();
            self.session = Some(state.id().clone());
            self.printed = 0;
            self.partial = 0;
            let title = if state.meta.title.is_empty() {
                "new session"
            } else {
                state.meta.title.as_str()
            };
            println!(
                "── {title} [{} {}] {}",
                state.meta.engine,
                state.meta.model.as_deref().unwrap_or("default"),
                short_id(state.id())
            );
        }

        let messages = state.timeline.messages();
        while let Some(message) = messages.get(self.printed) {
            let last = self.printed + 1 == messages.len();
            if let CanonicalMessage::Assistant {
                text,
                reasoning,
                streaming,
                ..
            } = message
            {
                if self.partial == 0 && !reasoning.is_empty() && (!*streaming || !text.is_empty()) {
                    for line in reasoning.lines() {
                        println!("~ {line}");
                    }
                }
                if let Some(rest) = text.get(self.partial..) {
                    print!("{rest}");
                    self.mid_line = !rest.is_empty() || self.mid_line;
                }
                self.partial = text.len();
                if *streaming && last {
                    let _ = std::io::stdout().flush();
                    return;
                }
                self.finish_line();
            } else {
                if last && state.processing {
                    // May still change (tool results, nested steps).
                    return;
                }
                self.finish_line();
                println!("{}", format_entry(message));
            }
            self.printed += 1;
            self.partial = 0;
        }
    }

    fn finish_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}
