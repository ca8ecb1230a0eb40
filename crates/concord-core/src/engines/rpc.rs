//! JSON-RPC peer shared by the ACP and Codex adapters.
//!
//! Outgoing requests get monotonically increasing ids and a one-shot slot in
//! the pending map; the adapter's pump routes responses back with
//! [`RpcPeer::classify`]. Codex omits the `"jsonrpc"` member, so the envelope
//! dialect is configurable.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::core::error::{EngineError, EngineErrorKind};

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;
/// ACP "authentication required".
pub const AUTH_REQUIRED: i64 = -32000;

/// Envelope flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Standard JSON-RPC 2.0 with `"jsonrpc": "2.0"`.
    JsonRpc2,
    /// Same shape without the version member.
    Bare,
}

/// Error object returned by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    fn from_value(value: &Value) -> Self {
        Self {
            code: value.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: value.get("data").cloned(),
        }
    }

    /// Maps a remote error onto the engine error taxonomy.
    pub fn kind(&self) -> EngineErrorKind {
        let lower = self.message.to_ascii_lowercase();
        if self.code == AUTH_REQUIRED
            || ["auth", "login", "unauthorized", "api key", "credentials"]
                .iter()
                .any(|needle| lower.contains(needle))
        {
            EngineErrorKind::Auth
        } else {
            EngineErrorKind::Rejected
        }
    }

    /// Converts into an [`EngineError`] for display and classification.
    pub fn into_engine_error(self) -> EngineError {
        let kind = self.kind();
        let details = self.data.as_ref().map(Value::to_string).unwrap_or_default();
        EngineError::new(kind, format!("{} (code {})", self.message, self.code))
            .with_details(details)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// Incoming message after response routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A response; already delivered to its waiter.
    Handled,
    /// The remote side is calling us.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Neither request, notification nor response.
    Invalid(Value),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

#[derive(Clone)]
pub struct RpcPeer {
    outgoing: mpsc::UnboundedSender<Value>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
    dialect: Dialect,
}

impl fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPeer")
            .field("dialect", &self.dialect)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RpcPeer {
    pub fn new(outgoing: mpsc::UnboundedSender<Value>, dialect: Dialect) -> Self {
        Self {
            outgoing,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            dialect,
        }
    }

    fn envelope(&self, body: Map<String, Value>) -> Value {
        let mut body = body;
        if self.dialect == Dialect::JsonRpc2 {
            body.insert("jsonrpc".to_string(), json!("2.0"));
        }
        Value::Object(body)
    }

    fn write(&self, message: Value) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|e| anyhow!(EngineError::transport(format!("Engine connection is closed: {e}"))))
    }

    /// Sends a request and waits for its response.
    ///
    /// Remote errors come back as an [`EngineError`] whose kind reflects the
    /// code; the raw [`RpcError`] is kept in the chain.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let mut body = Map::new();
        body.insert("id".to_string(), json!(id));
        body.insert("method".to_string(), json!(method));
        body.insert("params".to_string(), params);
        if let Err(e) = self.write(self.envelope(body)) {
            self.forget(id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(rpc)) => {
                let engine_error = rpc.clone().into_engine_error();
                Err(anyhow::Error::new(rpc).context(engine_error))
            }
            Err(_) => Err(anyhow!(EngineError::transport(format!(
                "Engine closed before answering {method}"
            )))),
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        let mut body = Map::new();
        body.insert("method".to_string(), json!(method));
        body.insert("params".to_string(), params);
        self.write(self.envelope(body))
    }

    pub fn respond(&self, id: Value, result: Value) -> Result<()> {
        let mut body = Map::new();
        body.insert("id".to_string(), id);
        body.insert("result".to_string(), result);
        self.write(self.envelope(body))
    }

    pub fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<()> {
        let mut body = Map::new();
        body.insert("id".to_string(), id);
        body.insert("error".to_string(), json!({"code": code, "message": message}));
        self.write(self.envelope(body))
    }

    /// Routes responses to their waiters and classifies everything else.
    pub fn classify(&self, message: Value) -> Incoming {
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        let id = message.get("id").cloned().filter(|id| !id.is_null());

        match (method, id) {
            (Some(method), Some(id)) => Incoming::Request {
                id,
                method,
                params: message.get("params").cloned().unwrap_or(Value::Null),
            },
            (Some(method), None) => Incoming::Notification {
                method,
                params: message.get("params").cloned().unwrap_or(Value::Null),
            },
            (None, Some(id)) => {
                let Some(numeric) = id.as_u64() else {
                    return Incoming::Invalid(message);
                };
                let waiter = self
                    .pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&numeric));
                let Some(waiter) = waiter else {
                    tracing::debug!(id = numeric, "response for unknown request");
                    return Incoming::Handled;
                };
                let outcome = match message.get("error") {
                    Some(error) => Err(RpcError::from_value(error)),
                    None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = waiter.send(outcome);
                Incoming::Handled
            }
            (None, None) => Incoming::Invalid(message),
        }
    }

    /// Fails every outstanding request (the connection is gone).
    pub fn fail_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }
}

/// Extracts the remote error code from a request failure, if any.
pub fn error_code(err: &anyhow::Error) -> Option<i64> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RpcError>())
        .map(|e| e.code)
}
