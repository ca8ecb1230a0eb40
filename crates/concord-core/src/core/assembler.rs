//! Streaming assembler.
//!
//! Folds normalized engine events into a session [`Timeline`]. One assembler
//! exists per session and travels with the session state, so background
//! sessions keep assembling while hidden.
//!
//! Rules:
//! - At most one assistant entry is open (streaming) at a time.
//! - A fragment for another segment, a tool call, or any pushed entry closes it.
//! - Snapshots are diffed against the open entry: extensions append the
//!   suffix, repeats and prefixes are ignored, divergent content replaces.
//! - Delegated-task output attaches to the top-level tool entry that started
//!   the task, at any nesting depth.

use std::collections::HashMap;

use serde_json::Value;

use crate::core::events::Fragment;
use crate::core::timeline::{CanonicalMessage, MessageId, SubStep, Timeline};
use crate::engines::tool_names::is_task_tool;

/// Which field of an assistant entry a fragment feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Reasoning,
}

#[derive(Debug, Clone)]
struct OpenEntry {
    id: MessageId,
    segment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StreamingAssembler {
    merge_reasoning_passes: bool,
    open: Option<OpenEntry>,
    /// Top-level tool entries by backend tool id.
    tools: HashMap<String, MessageId>,
    /// Delegated-task tool ids (any depth) to their top-level entry.
    parents: HashMap<String, MessageId>,
    /// Segment of the last nested text step per top-level entry.
    nested_segments: HashMap<MessageId, Option<String>>,
}

impl StreamingAssembler {
    pub fn new(merge_reasoning_passes: bool) -> Self {
        Self {
            merge_reasoning_passes,
            open: None,
            tools: HashMap::new(),
            parents: HashMap::new(),
            nested_segments: HashMap::new(),
        }
    }

    /// Registers tool entries of a reloaded timeline so late results still fold.
    pub fn index_existing(&mut self, timeline: &Timeline) {
        for message in timeline.messages() {
            if let CanonicalMessage::Tool {
                id,
                tool_use_id,
                name,
                steps,
                ..
            } = message
            {
                self.tools.insert(tool_use_id.clone(), id.clone());
                if is_task_tool(name) {
                    self.parents.insert(tool_use_id.clone(), id.clone());
                }
                for step in steps {
                    if let SubStep::Tool {
                        tool_use_id, name, ..
                    } = step
                        && is_task_tool(name)
                    {
                        self.parents.insert(tool_use_id.clone(), id.clone());
                    }
                }
            }
        }
    }

    /// Id of the entry currently streaming, if any.
    pub fn streaming_entry(&self) -> Option<&MessageId> {
        self.open.as_ref().map(|open| &open.id)
    }

    /// Applies a text or reasoning fragment. Returns whether the timeline changed.
    pub fn content(
        &mut self,
        timeline: &mut Timeline,
        kind: ContentKind,
        segment: Option<String>,
        fragment: Fragment,
        parent_tool_use_id: Option<&str>,
    ) -> bool {
        if fragment_text(&fragment).is_empty() {
            return false;
        }

        if let Some(parent) = parent_tool_use_id {
            if let Some(top) = self.parents.get(parent).cloned() {
                return self.nested_content(timeline, &top, kind, segment, fragment);
            }
            tracing::debug!(parent, "content for unknown parent tool; attaching at top level");
        }

        let (target, created) = self.assistant_target(timeline, kind, segment);
        let applied = match timeline.get_mut(&target) {
            Some(CanonicalMessage::Assistant {
                text, reasoning, ..
            }) => match kind {
                ContentKind::Text => apply_fragment(text, fragment),
                ContentKind::Reasoning => apply_fragment(reasoning, fragment),
            },
            _ => false,
        };
        created || applied
    }

    /// Records a tool invocation. A repeated id updates the existing entry.
    pub fn tool_call(
        &mut self,
        timeline: &mut Timeline,
        tool_use_id: &str,
        name: &str,
        input: Value,
        parent_tool_use_id: Option<&str>,
    ) -> bool {
        if let Some(id) = self.tools.get(tool_use_id).cloned() {
            return update_tool(timeline, &id, Some(name), input);
        }

        if let Some(top) = parent_tool_use_id.and_then(|p| self.parents.get(p).cloned()) {
            return self.nested_tool_call(timeline, &top, tool_use_id, name, input);
        }

        self.close(timeline);
        let id = timeline.push(CanonicalMessage::tool(tool_use_id, name, input));
        if is_task_tool(name) {
            self.parents.insert(tool_use_id.to_string(), id.clone());
        }
        self.tools.insert(tool_use_id.to_string(), id);
        true
    }

    /// Replaces the input (and optionally the name) of a known invocation.
    pub fn tool_update(
        &mut self,
        timeline: &mut Timeline,
        tool_use_id: &str,
        name: Option<&str>,
        input: Value,
        parent_tool_use_id: Option<&str>,
    ) -> bool {
        if let Some(id) = self.tools.get(tool_use_id).cloned() {
            return update_tool(timeline, &id, name, input);
        }

        if let Some(top) = parent_tool_use_id.and_then(|p| self.parents.get(p).cloned())
            && let Some(CanonicalMessage::Tool { steps, .. }) = timeline.get_mut(&top)
            && let Some(SubStep::Tool {
                name: step_name,
                input: step_input,
                ..
            }) = find_step(steps, tool_use_id)
        {
            if let Some(name) = name {
                name.clone_into(step_name);
            }
            if *step_input == input {
                return false;
            }
            *step_input = input;
            return true;
        }

        match name {
            Some(name) => self.tool_call(timeline, tool_use_id, name, input, parent_tool_use_id),
            None => {
                tracing::debug!(tool_use_id, "update for unknown tool call ignored");
                false
            }
        }
    }

    /// Folds a tool result into its invocation, or records it on its own.
    pub fn tool_result(
        &mut self,
        timeline: &mut Timeline,
        tool_use_id: &str,
        output: Value,
        is_error: bool,
        parent_tool_use_id: Option<&str>,
    ) -> bool {
        if let Some(id) = self.tools.get(tool_use_id).cloned()
            && let Some(CanonicalMessage::Tool {
                result,
                is_error: entry_error,
                ..
            }) = timeline.get_mut(&id)
        {
            *result = Some(output);
            *entry_error = is_error;
            return true;
        }

        if let Some(top) = parent_tool_use_id.and_then(|p| self.parents.get(p).cloned())
            && let Some(CanonicalMessage::Tool { steps, .. }) = timeline.get_mut(&top)
            && let Some(SubStep::Tool {
                result,
                is_error: step_error,
                ..
            }) = find_step(steps, tool_use_id)
        {
            *result = Some(output);
            *step_error = is_error;
            return true;
        }

        self.close(timeline);
        timeline.push(CanonicalMessage::tool_result(tool_use_id, output, is_error));
        true
    }

    /// Closes the open entry and appends a standalone entry.
    pub fn push(&mut self, timeline: &mut Timeline, message: CanonicalMessage) -> MessageId {
        self.close(timeline);
        timeline.push(message)
    }

    /// Records an event no adapter rule matched.
    pub fn unmapped(&mut self, timeline: &mut Timeline, kind: &str, raw: &Value) -> MessageId {
        const MAX_RAW_CHARS: usize = 400;
        let mut raw = raw.to_string();
        if raw.chars().count() > MAX_RAW_CHARS {
            raw = raw.chars().take(MAX_RAW_CHARS).collect();
            raw.push('…');
        }
        self.push(timeline, CanonicalMessage::system(format!("[{kind}] {raw}")))
    }

    /// Closes the open assistant entry. Returns whether anything changed.
    pub fn close(&mut self, timeline: &mut Timeline) -> bool {
        let Some(open) = self.open.take() else {
            return false;
        };
        match timeline.get_mut(&open.id) {
            Some(CanonicalMessage::Assistant { streaming, .. }) => {
                std::mem::replace(streaming, false)
            }
            _ => false,
        }
    }

    /// Ends the turn: closes the open entry and forgets nested text segments.
    pub fn finish(&mut self, timeline: &mut Timeline) -> bool {
        self.nested_segments.clear();
        self.close(timeline)
    }

    fn assistant_target(
        &mut self,
        timeline: &mut Timeline,
        kind: ContentKind,
        segment: Option<String>,
    ) -> (MessageId, bool) {
        if let Some(open) = &mut self.open {
            let continues = match (&open.segment, &segment) {
                (Some(current), Some(incoming)) => current == incoming,
                _ => true,
            };
            if continues {
                if open.segment.is_none() {
                    open.segment = segment;
                }
                return (open.id.clone(), false);
            }
        }

        self.close(timeline);

        if kind == ContentKind::Text
            && self.merge_reasoning_passes
            && let Some(last_id) = timeline.last().map(|m| m.id().clone())
            && let Some(CanonicalMessage::Assistant {
                text,
                reasoning,
                streaming,
                ..
            }) = timeline.get_mut(&last_id)
            && text.is_empty()
            && !reasoning.is_empty()
        {
            *streaming = true;
            self.open = Some(OpenEntry {
                id: last_id.clone(),
                segment,
            });
            return (last_id, true);
        }

        let id = timeline.push(CanonicalMessage::assistant());
        self.open = Some(OpenEntry {
            id: id.clone(),
            segment,
        });
        (id, true)
    }

    fn nested_content(
        &mut self,
        timeline: &mut Timeline,
        top: &MessageId,
        kind: ContentKind,
        segment: Option<String>,
        fragment: Fragment,
    ) -> bool {
        // Sub-steps carry no reasoning slot.
        if kind == ContentKind::Reasoning {
            tracing::debug!(
                parent = %top,
                len = fragment_text(&fragment).len(),
                "dropping sub-agent reasoning"
            );
            return false;
        }
        let Some(CanonicalMessage::Tool { steps, .. }) = timeline.get_mut(top) else {
            return false;
        };

        let same_segment = match (self.nested_segments.get(top), &segment) {
            (Some(Some(previous)), Some(incoming)) => previous == incoming,
            _ => true,
        };
        if same_segment && let Some(SubStep::Text { text }) = steps.last_mut() {
            return apply_fragment(text, fragment);
        }

        let mut text = String::new();
        apply_fragment(&mut text, fragment);
        steps.push(SubStep::Text { text });
        self.nested_segments.insert(top.clone(), segment);
        true
    }

    fn nested_tool_call(
        &mut self,
        timeline: &mut Timeline,
        top: &MessageId,
        tool_use_id: &str,
        name: &str,
        input: Value,
    ) -> bool {
        let Some(CanonicalMessage::Tool { steps, .. }) = timeline.get_mut(top) else {
            return false;
        };

        if is_task_tool(name) {
            self.parents.insert(tool_use_id.to_string(), top.clone());
        }

        if let Some(SubStep::Tool {
            input: step_input, ..
        }) = find_step(steps, tool_use_id)
        {
            if *step_input == input {
                return false;
            }
            *step_input = input;
            return true;
        }

        steps.push(SubStep::Tool {
            tool_use_id: tool_use_id.to_string(),
            name: name.to_string(),
            input,
            result: None,
            is_error: false,
        });
        true
    }
}

fn fragment_text(fragment: &Fragment) -> &str {
    match fragment {
        Fragment::Delta(text) | Fragment::Snapshot(text) => text,
    }
}

fn find_step<'a>(steps: &'a mut [SubStep], tool_use_id: &str) -> Option<&'a mut SubStep> {
    steps.iter_mut().find(
        |step| matches!(step, SubStep::Tool { tool_use_id: id, .. } if id == tool_use_id),
    )
}

fn update_tool(timeline: &mut Timeline, id: &MessageId, name: Option<&str>, input: Value) -> bool {
    let Some(CanonicalMessage::Tool {
        name: entry_name,
        input: entry_input,
        ..
    }) = timeline.get_mut(id)
    else {
        return false;
    };

    let mut changed = false;
    if let Some(name) = name
        && entry_name != name
    {
        name.clone_into(entry_name);
        changed = true;
    }
    if *entry_input != input {
        *entry_input = input;
        changed = true;
    }
    changed
}

/// Applies a fragment to accumulated content. Returns whether it changed.
pub(crate) fn apply_fragment(content: &mut String, fragment: Fragment) -> bool {
    match fragment {
        Fragment::Delta(delta) => {
            if delta.is_empty() {
                return false;
            }
            content.push_str(&delta);
            true
        }
        Fragment::Snapshot(snapshot) => {
            if let Some(suffix) = snapshot.strip_prefix(content.as_str()) {
                if suffix.is_empty() {
                    return false;
                }
                let suffix = suffix.to_string();
                content.push_str(&suffix);
                true
            } else if content.starts_with(&snapshot) {
                false
            } else {
                *content = snapshot;
                true
            }
        }
    }
}
