//! Line-delimited JSON transport to an engine process.
//!
//! A spawned child is driven by three tasks: a writer draining the outgoing
//! queue into stdin, a reader turning stdout lines into [`Frame`]s, and a
//! waiter that reports the exit (with the stderr tail) as the final frame.
//! Dropping the [`ProcessGuard`] kills the child.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};

use crate::core::error::EngineError;
use crate::core::session::EngineKind;

const STDERR_TAIL_LINES: usize = 20;

/// How to start an engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// One unit read from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    /// A line that was not valid JSON.
    Malformed { line: String, error: String },
    /// The process exited or the connection dropped. Always the last frame.
    Closed { error: Option<String> },
}

/// Kills the engine process when dropped.
#[derive(Debug, Default)]
pub struct ProcessGuard(Option<oneshot::Sender<()>>);

impl ProcessGuard {
    pub fn terminate(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// Both directions of an engine connection.
pub struct Transport {
    pub outgoing: mpsc::UnboundedSender<Value>,
    pub incoming: mpsc::UnboundedReceiver<Frame>,
    pub guard: ProcessGuard,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("closed", &self.outgoing.is_closed())
            .finish_non_exhaustive()
    }
}

/// Opens transports. The registry goes through this seam so tests can stand
/// in for engine processes.
pub trait TransportFactory: Send + Sync {
    fn open(&self, engine: EngineKind, spec: &LaunchSpec) -> Result<Transport>;
}

/// Spawns real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTransportFactory;

impl TransportFactory for ProcessTransportFactory {
    fn open(&self, engine: EngineKind, spec: &LaunchSpec) -> Result<Transport> {
        tracing::info!(%engine, program = %spec.program, cwd = %spec.cwd.display(), "spawning engine");
        spawn_process(spec)
    }
}

/// Spawns `spec` with piped stdio and starts the pump tasks.
pub fn spawn_process(spec: &LaunchSpec) -> Result<Transport> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        let message = if e.kind() == io::ErrorKind::NotFound {
            format!("{} not found; is it installed and on PATH?", spec.program)
        } else {
            format!("Failed to spawn {}: {e}", spec.program)
        };
        anyhow::Error::new(EngineError::spawn(message))
    })?;

    let mut stdin = child.stdin.take().context("Child stdin was not captured")?;
    let stdout = child.stdout.take().context("Child stdout was not captured")?;
    let stderr = child.stderr.take().context("Child stderr was not captured")?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::debug!("engine stdin closed: {e}");
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    let tail = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_task = tokio::spawn(collect_stderr(stderr, Arc::clone(&tail)));

    let reader_tx = in_tx.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if reader_tx.send(parse_line(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("failed to read engine stdout: {e}");
                    break;
                }
            }
        }
    });

    let program = spec.program.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let _ = reader.await;
        let _ = stderr_task.await;

        let tail = tail
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<String>>().join("\n"))
            .unwrap_or_default();
        let error = match status {
            Ok(status) if status.success() => None,
            Ok(status) if tail.is_empty() => Some(format!("{program} exited with {status}")),
            Ok(status) => Some(format!("{program} exited with {status}: {tail}")),
            Err(e) => Some(format!("Failed to wait for {program}: {e}")),
        };
        let _ = in_tx.send(Frame::Closed { error });
    });

    Ok(Transport {
        outgoing: out_tx,
        incoming: in_rx,
        guard: ProcessGuard(Some(kill_tx)),
    })
}

/// Parses one stdout line.
pub fn parse_line(line: &str) -> Frame {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => Frame::Message(value),
        Err(e) => Frame::Malformed {
            line: line.to_string(),
            error: e.to_string(),
        },
    }
}

async fn collect_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "concord::engine_stderr", "{line}");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory engine stand-ins.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// The engine side of an in-memory transport.
    pub(crate) struct FakeBackend {
        pub engine: EngineKind,
        pub spec: LaunchSpec,
        from_client: mpsc::UnboundedReceiver<Value>,
        to_client: mpsc::UnboundedSender<Frame>,
        killed: oneshot::Receiver<()>,
    }

    impl FakeBackend {
        /// Next message written by the adapter.
        pub async fn recv(&mut self) -> Value {
            tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
                .await
                .expect("timed out waiting for adapter message")
                .expect("adapter closed its outgoing channel")
        }

        /// Skips messages until one has the given JSON-RPC method.
        pub async fn recv_method(&mut self, method: &str) -> Value {
            loop {
                let message = self.recv().await;
                if message.get("method").and_then(Value::as_str) == Some(method) {
                    return message;
                }
            }
        }

        pub fn send(&self, message: Value) {
            let _ = self.to_client.send(Frame::Message(message));
        }

        pub fn send_raw(&self, line: &str) {
            let _ = self.to_client.send(parse_line(line));
        }

        pub fn close(&self, error: Option<&str>) {
            let _ = self.to_client.send(Frame::Closed {
                error: error.map(str::to_string),
            });
        }

        /// Whether the adapter dropped or terminated its guard.
        pub fn was_killed(&mut self) -> bool {
            !matches!(
                self.killed.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            )
        }
    }

    pub(crate) fn pair(engine: EngineKind, spec: LaunchSpec) -> (Transport, FakeBackend) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        (
            Transport {
                outgoing: out_tx,
                incoming: in_rx,
                guard: ProcessGuard(Some(kill_tx)),
            },
            FakeBackend {
                engine,
                spec,
                from_client: out_rx,
                to_client: in_tx,
                killed: kill_rx,
            },
        )
    }

    /// Hands every opened backend to the test through a channel.
    pub(crate) struct FakeFactory {
        backends: mpsc::UnboundedSender<FakeBackend>,
        failures: AtomicUsize,
        opened: AtomicUsize,
    }

    impl FakeFactory {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeBackend>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    backends: tx,
                    failures: AtomicUsize::new(0),
                    opened: AtomicUsize::new(0),
                }),
                rx,
            )
        }

        /// Makes the next `n` opens fail with a spawn error.
        pub fn fail_next(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }

        pub fn open_count(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    impl TransportFactory for FakeFactory {
        fn open(&self, engine: EngineKind, spec: &LaunchSpec) -> Result<Transport> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::spawn(format!("{} not found", spec.program)).into());
            }
            let (transport, backend) = pair(engine, spec.clone());
            let _ = self.backends.send(backend);
            Ok(transport)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_lines_are_reported_not_dropped() {
        assert!(matches!(parse_line(r#"{"type":"ok"}"#), Frame::Message(_)));
        assert!(matches!(
            parse_line("not json"),
            Frame::Malformed { line, .. } if line == "not json"
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spec = LaunchSpec {
            program: "concord-definitely-missing-binary".to_string(),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        };
        let err = spawn_process(&spec).unwrap_err();
        assert_eq!(
            EngineError::kind_of(&err),
            Some(crate::core::error::EngineErrorKind::Spawn)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_lines_and_exit_are_framed() {
        let spec = LaunchSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".into(),
                r#"read line; echo "$line"; echo garbage; echo oops >&2; exit 3"#.into(),
            ],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
        };
        let mut transport = spawn_process(&spec).unwrap();
        transport
            .outgoing
            .send(serde_json::json!({"hello": "world"}))
            .unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = transport.incoming.recv().await {
            let closed = matches!(frame, Frame::Closed { .. });
            frames.push(frame);
            if closed {
                break;
            }
        }

        assert_eq!(frames[0], Frame::Message(serde_json::json!({"hello": "world"})));
        assert!(matches!(&frames[1], Frame::Malformed { line, .. } if line == "garbage"));
        assert!(matches!(
            &frames[2],
            Frame::Closed { error: Some(e) } if e.contains("oops")
        ));
    }
}
