//! Session command handlers.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, Utc};
use concord_core::core::persistence::{SessionStore, SessionSummary};
use concord_core::core::session::SessionId;
use concord_core::core::timeline::{CanonicalMessage, SubStep};
use serde_json::Value;

/// Longest tool output shown inline in a transcript.
const OUTPUT_PREVIEW_CHARS: usize = 400;

pub fn list(project: Option<&str>) -> Result<()> {
    let sessions = SessionStore::default()
        .list(project)
        .context("list sessions")?;
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }
    for summary in &sessions {
        println!("{}", format_summary(summary));
    }
    Ok(())
}

pub fn show(id: &str) -> Result<()> {
    let id = SessionId::from(id);
    let record = SessionStore::default()
        .find(&id)
        .with_context(|| format!("load session '{id}'"))?
        .with_context(|| format!("Session '{id}' not found"))?;
    println!(
        "{}  [{}{}]  {}",
        display_title(&record.title, &record.id),
        record.engine,
        record
            .model
            .as_deref()
            .map(|m| format!(" {m}"))
            .unwrap_or_default(),
        record.project_id
    );
    println!("{}", format_transcript(&record.messages));
    Ok(())
}

pub fn delete(id: &str) -> Result<()> {
    let id = SessionId::from(id);
    let store = SessionStore::default();
    let Some(record) = store
        .find(&id)
        .with_context(|| format!("load session '{id}'"))?
    else {
        bail!("Session '{id}' not found");
    };
    store.delete(&record.project_id, &id)?;
    println!("Deleted session {id}");
    Ok(())
}

pub fn rename(id: &str, title: &str) -> Result<()> {
    let title = title.trim();
    if title.is_empty() {
        bail!("Title cannot be empty");
    }
    let id = SessionId::from(id);
    let store = SessionStore::default();
    let mut record = store
        .find(&id)
        .with_context(|| format!("load session '{id}'"))?
        .with_context(|| format!("Session '{id}' not found"))?;
    title.clone_into(&mut record.title);
    store
        .save(&record)
        .with_context(|| format!("rename session '{id}'"))?;
    println!("Renamed session {id} → {title}");
    Ok(())
}

pub fn format_summary(summary: &SessionSummary) -> String {
    format!(
        "{}  {}  {}  {}  ${:.4}",
        display_title(&summary.title, &summary.id),
        summary.id,
        summary.engine,
        format_timestamp(summary.last_activity()),
        summary.cost_usd
    )
}

fn display_title(title: &str, id: &SessionId) -> String {
    if title.is_empty() {
        format!("Untitled {}", short_id(id))
    } else {
        title.to_string()
    }
}

pub fn short_id(id: &SessionId) -> &str {
    let id = id.as_str();
    id.get(..8).unwrap_or(id)
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Plain-text rendering of a whole timeline.
pub fn format_transcript(messages: &[CanonicalMessage]) -> String {
    messages
        .iter()
        .map(format_entry)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Plain-text rendering of one timeline entry.
pub fn format_entry(message: &CanonicalMessage) -> String {
    match message {
        CanonicalMessage::User { text, queued, images, .. } => {
            let mut out = format!("> {text}");
            if !images.is_empty() {
                out.push_str(&format!(" [{} image(s)]", images.len()));
            }
            if *queued {
                out.push_str(" (queued)");
            }
            out
        }
        CanonicalMessage::Assistant {
            text, reasoning, ..
        } => {
            let mut out = String::new();
            if !reasoning.is_empty() {
                out.push_str(&indent("~ ", reasoning));
                if !text.is_empty() {
                    out.push('\n');
                }
            }
            out.push_str(text);
            out
        }
        CanonicalMessage::Tool {
            name,
            input,
            result,
            is_error,
            steps,
            ..
        } => {
            let mut out = format!("[{name}] {}", summarize_input(input));
            for step in steps {
                out.push('\n');
                out.push_str(&indent("  | ", &format_step(step)));
            }
            if let Some(result) = result {
                let label = if *is_error { "error" } else { "result" };
                out.push_str(&format!("\n  {label}: {}", preview(result)));
            }
            out
        }
        CanonicalMessage::ToolResult {
            tool_use_id,
            output,
            is_error,
            ..
        } => {
            let label = if *is_error { "error" } else { "result" };
            format!("[{tool_use_id}] {label}: {}", preview(output))
        }
        CanonicalMessage::System { text, is_error, .. } => {
            if *is_error {
                format!("[error] {text}")
            } else {
                format!("[system] {text}")
            }
        }
        CanonicalMessage::Compaction { summary, .. } => format!("[compacted] {summary}"),
    }
}

fn format_step(step: &SubStep) -> String {
    match step {
        SubStep::Text { text } => text.clone(),
        SubStep::Tool {
            name,
            input,
            result,
            is_error,
            ..
        } => {
            let mut out = format!("[{name}] {}", summarize_input(input));
            if let Some(result) = result {
                let label = if *is_error { "error" } else { "result" };
                out.push_str(&format!(" -> {label}: {}", preview(result)));
            }
            out
        }
    }
}

/// The most telling field of a tool input, or the compact JSON.
fn summarize_input(input: &Value) -> String {
    ["command", "file_path", "pattern", "url", "query", "description"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .map_or_else(|| input.to_string(), str::to_string)
}

fn preview(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = text.trim();
    if text.chars().count() <= OUTPUT_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    format!("{cut}…")
}

fn indent(prefix: &str, text: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_entries_show_the_command_and_result() {
        let mut tool = CanonicalMessage::tool("tu_1", "Bash", json!({"command": "cargo test"}));
        if let CanonicalMessage::Tool { result, .. } = &mut tool {
            *result = Some(json!("ok"));
        }
        assert_eq!(format_entry(&tool), "[Bash] cargo test\n  result: ok");
    }

    #[test]
    fn queued_user_entries_are_marked() {
        let entry = CanonicalMessage::user("later", Vec::new(), true);
        assert_eq!(format_entry(&entry), "> later (queued)");
    }

    #[test]
    fn long_output_is_cut() {
        let long = "x".repeat(OUTPUT_PREVIEW_CHARS + 10);
        let shown = preview(&json!(long));
        assert_eq!(shown.chars().count(), OUTPUT_PREVIEW_CHARS + 1);
        assert!(shown.ends_with('…'));
    }
}
