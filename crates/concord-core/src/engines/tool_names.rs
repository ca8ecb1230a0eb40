//! Canonical tool vocabulary.
//!
//! Each engine names and shapes tool calls differently. These helpers map
//! them onto one set of names and input keys so the timeline stores the same
//! JSON for the same operation regardless of the backend. Anything that does
//! not map is passed through untouched.

use serde_json::{Map, Value, json};

pub const READ: &str = "Read";
pub const WRITE: &str = "Write";
pub const EDIT: &str = "Edit";
pub const DELETE: &str = "Delete";
pub const MOVE: &str = "Move";
pub const BASH: &str = "Bash";
pub const GREP: &str = "Grep";
pub const GLOB: &str = "Glob";
pub const WEB_FETCH: &str = "WebFetch";
pub const WEB_SEARCH: &str = "WebSearch";
pub const TASK: &str = "Task";
pub const TODO_WRITE: &str = "TodoWrite";
pub const THINK: &str = "Think";

/// A tool call in canonical form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTool {
    pub name: String,
    pub input: Value,
}

impl NormalizedTool {
    fn new(name: &str, input: Value) -> Self {
        Self {
            name: name.to_string(),
            input,
        }
    }
}

/// Tools whose nested activity is reported under their id.
pub fn is_task_tool(name: &str) -> bool {
    matches!(name, TASK | "Agent")
}

/// Flattens a command given as a string or an argv array.
///
/// A shell wrapper is unwrapped in both forms: `["bash", "-lc", "ls -la"]`
/// and `/bin/bash -lc 'ls -la'` both become `ls -la`. Other arrays are joined
/// with shell quoting for arguments containing whitespace.
pub fn flatten_command(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            Some(unwrap_shell_string(s).unwrap_or_else(|| s.to_string()))
        }
        Value::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            if parts.len() != items.len() || parts.is_empty() {
                return None;
            }
            if parts.len() == 3 && is_shell(parts[0]) && is_shell_flag(parts[1]) {
                return Some(parts[2].trim().to_string());
            }
            Some(
                parts
                    .iter()
                    .map(|p| quote_arg(p))
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
        _ => None,
    }
}

fn is_shell(program: &str) -> bool {
    let name = program.rsplit('/').next().unwrap_or(program);
    matches!(name, "bash" | "sh" | "zsh")
}

fn is_shell_flag(flag: &str) -> bool {
    matches!(flag, "-c" | "-lc" | "-ic")
}

/// The script of `<shell> -c <script>` with one level of quoting removed.
fn unwrap_shell_string(command: &str) -> Option<String> {
    let (program, rest) = command.split_once(char::is_whitespace)?;
    if !is_shell(program) {
        return None;
    }
    let (flag, script) = rest.trim_start().split_once(char::is_whitespace)?;
    if !is_shell_flag(flag) {
        return None;
    }
    unquote(script.trim())
}

/// Strips the quotes of a script that is one single- or double-quoted word.
/// Returns `None` for anything else that contains quotes, e.g. `'a' && 'b'`.
fn unquote(script: &str) -> Option<String> {
    if let Some(inner) = script
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        let pieces: Vec<&str> = inner.split(r"'\''").collect();
        if pieces.iter().any(|p| p.contains('\'')) {
            return None;
        }
        return Some(pieces.join("'").trim().to_string());
    }
    if let Some(inner) = script.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => out.push(next),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                '"' => return None,
                c => out.push(c),
            }
        }
        return Some(out.trim().to_string());
    }
    if script.contains(['\'', '"']) {
        return None;
    }
    Some(script.to_string())
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

/// Builds an object from the non-null entries.
fn object(entries: &[(&str, Option<Value>)]) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        if let Some(value) = value
            && !value.is_null()
        {
            map.insert((*key).to_string(), value.clone());
        }
    }
    Value::Object(map)
}

fn first_of(input: &Value, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|k| input.get(*k)).cloned()
}

/// Canonical Bash input is the flat command only. Every engine runs in the
/// session's project directory, so the working directory is not part of it.
fn bash(command: Option<String>) -> NormalizedTool {
    NormalizedTool::new(BASH, object(&[("command", command.map(Value::String))]))
}

/// Claude names are already canonical; inputs are projected onto the
/// canonical keys for the operations other engines can also produce.
pub fn from_claude(name: &str, input: &Value) -> NormalizedTool {
    match name {
        BASH => bash(input.get("command").and_then(flatten_command)),
        READ => NormalizedTool::new(
            READ,
            object(&[
                ("file_path", first_of(input, &["file_path"])),
                ("offset", first_of(input, &["offset"])),
                ("limit", first_of(input, &["limit"])),
            ]),
        ),
        WRITE => NormalizedTool::new(
            WRITE,
            object(&[
                ("file_path", first_of(input, &["file_path"])),
                ("content", first_of(input, &["content"])),
            ]),
        ),
        EDIT => NormalizedTool::new(
            EDIT,
            object(&[
                ("file_path", first_of(input, &["file_path"])),
                ("old_string", first_of(input, &["old_string"])),
                ("new_string", first_of(input, &["new_string"])),
            ]),
        ),
        GREP | GLOB => NormalizedTool::new(
            name,
            object(&[
                ("pattern", first_of(input, &["pattern"])),
                ("path", first_of(input, &["path"])),
            ]),
        ),
        WEB_FETCH => NormalizedTool::new(
            WEB_FETCH,
            object(&[
                ("url", first_of(input, &["url"])),
                ("prompt", first_of(input, &["prompt"])),
            ]),
        ),
        WEB_SEARCH => NormalizedTool::new(
            WEB_SEARCH,
            object(&[("query", first_of(input, &["query"]))]),
        ),
        "Agent" => NormalizedTool::new(TASK, input.clone()),
        _ => NormalizedTool::new(name, input.clone()),
    }
}

/// Maps an ACP tool call (`kind`, `title`, `rawInput`, `locations`, `content`).
pub fn from_acp(
    kind: Option<&str>,
    title: &str,
    raw_input: &Value,
    locations: &[Value],
    content: &[Value],
) -> NormalizedTool {
    let location_path = locations
        .first()
        .and_then(|l| l.get("path"))
        .cloned();
    let path = || {
        first_of(raw_input, &["file_path", "path", "abs_path", "absolute_path"])
            .or_else(|| location_path.clone())
    };
    let diff = content
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("diff"));

    match kind {
        Some("read") => NormalizedTool::new(
            READ,
            object(&[
                ("file_path", path()),
                ("offset", first_of(raw_input, &["offset", "line"])),
                ("limit", first_of(raw_input, &["limit"])),
            ]),
        ),
        Some("edit") => {
            let file_path = diff.and_then(|d| d.get("path").cloned()).or_else(path);
            let old = diff
                .and_then(|d| d.get("oldText").cloned())
                .or_else(|| first_of(raw_input, &["old_string", "oldText"]));
            let new = diff
                .and_then(|d| d.get("newText").cloned())
                .or_else(|| first_of(raw_input, &["new_string", "newText", "content"]));
            if old.as_ref().is_none_or(Value::is_null) && diff.is_some() {
                NormalizedTool::new(
                    WRITE,
                    object(&[("file_path", file_path), ("content", new)]),
                )
            } else {
                NormalizedTool::new(
                    EDIT,
                    object(&[
                        ("file_path", file_path),
                        ("old_string", old),
                        ("new_string", new),
                    ]),
                )
            }
        }
        Some("delete") => NormalizedTool::new(DELETE, object(&[("file_path", path())])),
        Some("move") => NormalizedTool::new(
            MOVE,
            object(&[
                ("file_path", first_of(raw_input, &["source", "from"]).or_else(path)),
                (
                    "destination",
                    first_of(raw_input, &["destination", "to", "new_path"]),
                ),
            ]),
        ),
        Some("search") => NormalizedTool::new(
            GREP,
            object(&[
                ("pattern", first_of(raw_input, &["pattern", "query"])),
                ("path", first_of(raw_input, &["path", "dir_path"])),
            ]),
        ),
        Some("execute") => bash(raw_input.get("command").and_then(flatten_command)),
        Some("fetch") => match first_of(raw_input, &["url"]) {
            Some(url) => NormalizedTool::new(WEB_FETCH, object(&[("url", Some(url))])),
            None => NormalizedTool::new(
                WEB_SEARCH,
                object(&[("query", first_of(raw_input, &["query"]))]),
            ),
        },
        Some("think") => NormalizedTool::new(THINK, raw_input.clone()),
        _ => NormalizedTool::new(
            if title.is_empty() { "tool" } else { title },
            raw_input.clone(),
        ),
    }
}

/// Maps a Codex thread item. Returns `None` for items that are not tool calls.
pub fn from_codex_item(item: &Value) -> Option<NormalizedTool> {
    let item_type = item.get("type").and_then(Value::as_str)?;
    match item_type {
        "commandExecution" => Some(bash(item.get("command").and_then(flatten_command))),
        "fileChange" => {
            let changes = item
                .get("changes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Some(codex_file_change(&changes))
        }
        "mcpToolCall" => {
            let server = item.get("server").and_then(Value::as_str).unwrap_or("mcp");
            let tool = item.get("tool").and_then(Value::as_str).unwrap_or("tool");
            Some(NormalizedTool::new(
                &format!("mcp__{server}__{tool}"),
                item.get("arguments").cloned().unwrap_or(Value::Null),
            ))
        }
        "webSearch" => Some(NormalizedTool::new(
            WEB_SEARCH,
            object(&[("query", first_of(item, &["query"]))]),
        )),
        _ => None,
    }
}

fn codex_file_change(changes: &[Value]) -> NormalizedTool {
    let [change] = changes else {
        return NormalizedTool::new(EDIT, json!({ "changes": changes }));
    };
    let file_path = first_of(change, &["path"]);
    let diff = first_of(change, &["diff"]);
    let kind = change
        .get("kind")
        .and_then(|k| k.get("type").or(Some(k)))
        .and_then(Value::as_str)
        .unwrap_or("update");
    match kind {
        "add" => NormalizedTool::new(WRITE, object(&[("file_path", file_path), ("content", diff)])),
        "delete" => NormalizedTool::new(DELETE, object(&[("file_path", file_path)])),
        _ => NormalizedTool::new(EDIT, object(&[("file_path", file_path), ("diff", diff)])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_command_normalizes_identically_across_engines() {
        let claude = from_claude(BASH, &json!({"command": "ls -la", "description": "List"}));
        let acp = from_acp(Some("execute"), "ls", &json!({"command": "ls -la"}), &[], &[]);
        let acp_argv = from_acp(
            Some("execute"),
            "ls",
            &json!({"command": ["bash", "-lc", "ls -la"], "cwd": "/work"}),
            &[],
            &[],
        );
        let codex_argv = from_codex_item(&json!({
            "type": "commandExecution",
            "id": "item_1",
            "command": ["bash", "-lc", "ls -la"],
            "cwd": "/work",
            "status": "inProgress"
        }))
        .unwrap();
        let codex_string = from_codex_item(&json!({
            "type": "commandExecution",
            "id": "item_2",
            "command": "/bin/bash -lc 'ls -la'",
            "cwd": "/work",
            "status": "inProgress"
        }))
        .unwrap();

        let bytes = serde_json::to_string(&claude.input).unwrap();
        assert_eq!(claude.name, BASH);
        assert_eq!(bytes, r#"{"command":"ls -la"}"#);
        for other in [acp, acp_argv, codex_argv, codex_string] {
            assert_eq!(other, claude);
            assert_eq!(serde_json::to_string(&other.input).unwrap(), bytes);
        }
    }

    #[test]
    fn shell_wrapped_strings_are_unwrapped() {
        let flat = |s: &str| flatten_command(&json!(s));
        assert_eq!(
            flat(r"/bin/zsh -lc 'echo '\''hi'\'''").as_deref(),
            Some("echo 'hi'")
        );
        assert_eq!(
            flat(r#"bash -c "grep \"x y\" src""#).as_deref(),
            Some(r#"grep "x y" src"#)
        );
        assert_eq!(flat("sh -c ls").as_deref(), Some("ls"));
        // More than one quoted word stays as given.
        assert_eq!(
            flat("bash -lc 'a' && 'b'").as_deref(),
            Some("bash -lc 'a' && 'b'")
        );
        assert_eq!(flat("cargo test --all").as_deref(), Some("cargo test --all"));
    }

    #[test]
    fn same_read_normalizes_identically() {
        let claude = from_claude(READ, &json!({"file_path": "/src/lib.rs"}));
        let acp = from_acp(
            Some("read"),
            "Read lib.rs",
            &json!({}),
            &[json!({"path": "/src/lib.rs"})],
            &[],
        );
        assert_eq!(acp, claude);
    }

    #[test]
    fn same_edit_normalizes_identically() {
        let claude = from_claude(
            EDIT,
            &json!({"file_path": "a.rs", "old_string": "x", "new_string": "y", "replace_all": false}),
        );
        let acp = from_acp(
            Some("edit"),
            "Edit a.rs",
            &json!({}),
            &[],
            &[json!({"type": "diff", "path": "a.rs", "oldText": "x", "newText": "y"})],
        );
        assert_eq!(acp, claude);
    }

    #[test]
    fn unknown_operations_pass_through() {
        let input = json!({"anything": [1, 2, 3]});
        assert_eq!(
            from_claude("NotebookEdit", &input),
            NormalizedTool::new("NotebookEdit", input.clone())
        );
        assert_eq!(
            from_acp(Some("other"), "custom_tool", &input, &[], &[]),
            NormalizedTool::new("custom_tool", input)
        );
        assert!(from_codex_item(&json!({"type": "agentMessage", "text": "hi"})).is_none());
    }

    #[test]
    fn argv_commands_are_quoted() {
        assert_eq!(
            flatten_command(&json!(["git", "commit", "-m", "fix bug"])).as_deref(),
            Some("git commit -m 'fix bug'")
        );
        assert_eq!(flatten_command(&json!(42)), None);
    }

    #[test]
    fn codex_file_changes_map_by_kind() {
        let add = from_codex_item(&json!({
            "type": "fileChange",
            "changes": [{"path": "new.rs", "kind": {"type": "add"}, "diff": "fn main() {}"}]
        }))
        .unwrap();
        assert_eq!(add.name, WRITE);
        assert_eq!(add.input, json!({"file_path": "new.rs", "content": "fn main() {}"}));

        let many = from_codex_item(&json!({
            "type": "fileChange",
            "changes": [{"path": "a"}, {"path": "b"}]
        }))
        .unwrap();
        assert_eq!(many.name, EDIT);
    }

    #[test]
    fn agent_alias_is_a_task() {
        assert!(is_task_tool(&from_claude("Agent", &json!({})).name));
    }
}
