//! Permission bridge.
//!
//! Engines ask before running tools. Each request carries a one-shot
//! [`PermissionResponder`] back to the adapter that raised it. The bridge
//! keeps a FIFO per session and surfaces only its head, applies the
//! auto-response policy, and guarantees every request is answered exactly
//! once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::core::session::SessionId;

/// Decision categories offered by engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl OptionKind {
    pub fn is_allow(self) -> bool {
        matches!(self, OptionKind::AllowOnce | OptionKind::AllowAlways)
    }

    /// Parses the wire names used by ACP agents.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "allow_once" => Some(OptionKind::AllowOnce),
            "allow_always" => Some(OptionKind::AllowAlways),
            "reject_once" => Some(OptionKind::RejectOnce),
            "reject_always" => Some(OptionKind::RejectAlways),
            _ => None,
        }
    }

    /// Kinds to try, in order, when the exact kind is not offered.
    fn preference(self) -> [OptionKind; 2] {
        match self {
            OptionKind::AllowOnce => [OptionKind::AllowOnce, OptionKind::AllowAlways],
            OptionKind::AllowAlways => [OptionKind::AllowAlways, OptionKind::AllowOnce],
            OptionKind::RejectOnce => [OptionKind::RejectOnce, OptionKind::RejectAlways],
            OptionKind::RejectAlways => [OptionKind::RejectAlways, OptionKind::RejectOnce],
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::AllowOnce => write!(f, "allow once"),
            OptionKind::AllowAlways => write!(f, "allow always"),
            OptionKind::RejectOnce => write!(f, "reject"),
            OptionKind::RejectAlways => write!(f, "reject always"),
        }
    }
}

/// One choice offered by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOption {
    pub id: String,
    pub kind: OptionKind,
    pub label: String,
}

impl PermissionOption {
    pub fn new(id: impl Into<String>, kind: OptionKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }
}

/// A tool approval waiting for an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: SessionId,
    /// Canonical tool name.
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// Human-readable summary supplied by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub options: Vec<PermissionOption>,
}

impl PermissionRequest {
    pub fn new(session_id: SessionId, tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            tool_name: tool_name.into(),
            input,
            tool_use_id: None,
            description: None,
            options: Vec::new(),
        }
    }

    pub fn has_option(&self, kind: OptionKind) -> bool {
        self.options.iter().any(|o| o.kind == kind)
    }

    /// Picks the option that best matches a decision.
    ///
    /// Falls back to the other option of the same polarity, then to any
    /// option of that polarity. Returns `None` when the engine offered none.
    pub fn select_option(&self, decision: OptionKind) -> Option<&PermissionOption> {
        decision
            .preference()
            .iter()
            .find_map(|kind| self.options.iter().find(|o| o.kind == *kind))
            .or_else(|| {
                self.options
                    .iter()
                    .find(|o| o.kind.is_allow() == decision.is_allow())
            })
    }
}

/// Who produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOrigin {
    User,
    Policy,
    /// Denied because the turn was interrupted or the session went away.
    ForcedDenial,
}

/// The answer delivered to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResolution {
    pub decision: OptionKind,
    /// Engine option chosen, when the engine offered options.
    pub option_id: Option<String>,
    pub origin: ResolutionOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResolution {
    pub fn for_request(
        request: &PermissionRequest,
        decision: OptionKind,
        origin: ResolutionOrigin,
    ) -> Self {
        let selected = request.select_option(decision);
        Self {
            decision: selected.map_or(decision, |o| o.kind),
            option_id: selected.map(|o| o.id.clone()),
            origin,
            message: None,
        }
    }

    pub fn forced_denial(message: impl Into<String>) -> Self {
        Self {
            decision: OptionKind::RejectOnce,
            option_id: None,
            origin: ResolutionOrigin::ForcedDenial,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn is_allow(&self) -> bool {
        self.origin != ResolutionOrigin::ForcedDenial && self.decision.is_allow()
    }
}

/// One-shot channel back to the adapter that raised a request.
#[derive(Debug)]
pub struct PermissionResponder(oneshot::Sender<PermissionResolution>);

impl PermissionResponder {
    pub fn channel() -> (Self, PermissionReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), PermissionReceiver(rx))
    }

    pub fn send(self, resolution: PermissionResolution) {
        if self.0.send(resolution).is_err() {
            tracing::debug!("permission answer dropped: adapter no longer waiting");
        }
    }
}

/// Adapter side of a [`PermissionResponder`].
#[derive(Debug)]
pub struct PermissionReceiver(oneshot::Receiver<PermissionResolution>);

impl PermissionReceiver {
    /// Waits for the answer. A dropped responder counts as a denial.
    pub async fn recv(self) -> PermissionResolution {
        self.0
            .await
            .unwrap_or_else(|_| PermissionResolution::forced_denial("Permission request abandoned"))
    }
}

/// Auto-response policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionPolicy {
    /// Surface every request.
    #[default]
    Ask,
    /// Answer "allow once" when offered.
    AutoAcceptOnce,
    /// Answer "allow always" (or "allow once") when offered.
    AllowEverything,
}

impl PermissionPolicy {
    fn choose(self, request: &PermissionRequest) -> Option<OptionKind> {
        match self {
            PermissionPolicy::Ask => None,
            PermissionPolicy::AutoAcceptOnce => request
                .has_option(OptionKind::AllowOnce)
                .then_some(OptionKind::AllowOnce),
            PermissionPolicy::AllowEverything => [OptionKind::AllowAlways, OptionKind::AllowOnce]
                .into_iter()
                .find(|kind| request.has_option(*kind)),
        }
    }
}

impl std::str::FromStr for PermissionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ask" => Ok(PermissionPolicy::Ask),
            "auto-accept-once" => Ok(PermissionPolicy::AutoAcceptOnce),
            "allow-everything" => Ok(PermissionPolicy::AllowEverything),
            other => bail!(
                "Unknown permission policy '{other}' (expected ask, auto-accept-once or allow-everything)"
            ),
        }
    }
}

/// Outcome of handing a request to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The policy answered it.
    AutoResolved(PermissionResolution),
    /// It is now the session's pending request.
    Surfaced(PermissionRequest),
    /// Another request of the session is pending; this one waits.
    Waiting,
}

/// Outcome of answering a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved {
        request: PermissionRequest,
        resolution: PermissionResolution,
        /// Next request of the same session, now pending.
        next: Option<PermissionRequest>,
    },
    /// The request was answered before; nothing was sent.
    AlreadyResolved,
}

struct Entry {
    request: PermissionRequest,
    responder: PermissionResponder,
}

#[derive(Default)]
pub struct PermissionBridge {
    policy: PermissionPolicy,
    entries: HashMap<String, Entry>,
    queues: HashMap<SessionId, VecDeque<String>>,
    resolved: HashSet<String>,
}

impl fmt::Debug for PermissionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionBridge")
            .field("policy", &self.policy)
            .field("open", &self.entries.len())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

impl PermissionBridge {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> PermissionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: PermissionPolicy) {
        self.policy = policy;
    }

    /// Accepts a request from an engine.
    pub fn admit(&mut self, request: PermissionRequest, responder: PermissionResponder) -> Admission {
        if let Some(kind) = self.policy.choose(&request) {
            let resolution =
                PermissionResolution::for_request(&request, kind, ResolutionOrigin::Policy);
            tracing::debug!(
                request = %request.id,
                tool = %request.tool_name,
                decision = %resolution.decision,
                "permission auto-resolved by policy"
            );
            self.resolved.insert(request.id);
            responder.send(resolution.clone());
            return Admission::AutoResolved(resolution);
        }

        let queue = self.queues.entry(request.session_id.clone()).or_default();
        queue.push_back(request.id.clone());
        let surfaced = queue.len() == 1;
        let admission = if surfaced {
            Admission::Surfaced(request.clone())
        } else {
            Admission::Waiting
        };
        self.entries
            .insert(request.id.clone(), Entry { request, responder });
        admission
    }

    /// Answers a request on behalf of the user.
    pub fn resolve(
        &mut self,
        request_id: &str,
        decision: OptionKind,
        message: Option<String>,
    ) -> Result<ResolveOutcome> {
        if self.resolved.contains(request_id) {
            return Ok(ResolveOutcome::AlreadyResolved);
        }
        let Some(entry) = self.entries.remove(request_id) else {
            bail!("Unknown permission request '{request_id}'");
        };

        let resolution =
            PermissionResolution::for_request(&entry.request, decision, ResolutionOrigin::User)
                .with_message(message);
        self.resolved.insert(request_id.to_string());
        entry.responder.send(resolution.clone());

        let session_id = entry.request.session_id.clone();
        let mut next = None;
        if let Some(queue) = self.queues.get_mut(&session_id) {
            let was_head = queue.front().is_some_and(|id| id == request_id);
            queue.retain(|id| id != request_id);
            if was_head {
                next = queue
                    .front()
                    .and_then(|id| self.entries.get(id))
                    .map(|e| e.request.clone());
            }
            if queue.is_empty() {
                self.queues.remove(&session_id);
            }
        }

        Ok(ResolveOutcome::Resolved {
            request: entry.request,
            resolution,
            next,
        })
    }

    /// Denies every open request of a session. Returns how many were denied.
    pub fn deny_all(&mut self, session_id: &SessionId, reason: &str) -> usize {
        let Some(queue) = self.queues.remove(session_id) else {
            return 0;
        };
        let mut denied = 0;
        for id in queue {
            if let Some(entry) = self.entries.remove(&id) {
                entry
                    .responder
                    .send(PermissionResolution::forced_denial(reason));
                self.resolved.insert(id);
                denied += 1;
            }
        }
        denied
    }

    /// The request currently surfaced for a session.
    pub fn pending(&self, session_id: &SessionId) -> Option<&PermissionRequest> {
        self.queues
            .get(session_id)
            .and_then(|queue| queue.front())
            .and_then(|id| self.entries.get(id))
            .map(|e| &e.request)
    }

    /// Requests held behind the pending one.
    pub fn waiting_count(&self, session_id: &SessionId) -> usize {
        self.queues
            .get(session_id)
            .map_or(0, |queue| queue.len().saturating_sub(1))
    }
}
