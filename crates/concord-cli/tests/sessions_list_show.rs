//! Integration tests for `concord sessions`.

use assert_cmd::cargo::cargo_bin_cmd;
use concord_core::core::persistence::{PersistedSession, SCHEMA_VERSION, SessionStore};
use concord_core::core::session::SessionId;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

const SESSION_ID: &str = "5b0c6a52-8d7e-4c3f-9a61-2f1e0d9c8b7a";

/// Writes a session file the way the registry does.
fn create_session(home: &TempDir, id: &str, title: &str) -> SessionStore {
    let record: PersistedSession = serde_json::from_value(json!({
        "schema_version": SCHEMA_VERSION,
        "id": id,
        "project_id": "/work/app",
        "title": title,
        "created_at": "2026-01-01T10:00:00Z",
        "last_message_at": "2026-01-01T10:05:00Z",
        "engine": "codex",
        "model": "gpt-5-codex",
        "cost_usd": 0.25,
        "resume": {"engine": "codex", "id": "thr_1"},
        "messages": [
            {"type": "user", "id": "m1", "text": "run the tests", "ts": "2026-01-01T10:00:00Z"},
            {"type": "tool", "id": "m2", "tool_use_id": "item_1", "name": "Bash",
             "input": {"command": "cargo test"}, "result": "test result: ok", "ts": "2026-01-01T10:01:00Z"},
            {"type": "assistant", "id": "m3", "text": "All tests pass.", "ts": "2026-01-01T10:05:00Z"}
        ]
    }))
    .unwrap();
    let store = SessionStore::new(home.path().join("projects"));
    store.save(&record).unwrap();
    store
}

#[test]
fn test_sessions_list_empty() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("concord")
        .env("CONCORD_HOME", home.path())
        .args(["sessions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions found."));
}

#[test]
fn test_sessions_list_shows_title_and_engine() {
    let home = TempDir::new().unwrap();
    create_session(&home, SESSION_ID, "Run the tests");

    cargo_bin_cmd!("concord")
        .env("CONCORD_HOME", home.path())
        .args(["sessions", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run the tests"))
        .stdout(predicate::str::contains(SESSION_ID))
        .stdout(predicate::str::contains("codex"))
        .stdout(predicate::str::contains("$0.2500"));
}

#[test]
fn test_sessions_show_prints_transcript() {
    let home = TempDir::new().unwrap();
    create_session(&home, SESSION_ID, "Run the tests");

    cargo_bin_cmd!("concord")
        .env("CONCORD_HOME", home.path())
        .args(["sessions", "show", SESSION_ID])
        .assert()
        .success()
        .stdout(predicate::str::contains("> run the tests"))
        .stdout(predicate::str::contains("[Bash] cargo test"))
        .stdout(predicate::str::contains("result: test result: ok"))
        .stdout(predicate::str::contains("All tests pass."));
}

#[test]
fn test_sessions_show_unknown_id_fails() {
    let home = TempDir::new().unwrap();

    cargo_bin_cmd!("concord")
        .env("CONCORD_HOME", home.path())
        .args(["sessions", "show", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_sessions_rename_and_delete() {
    let home = TempDir::new().unwrap();
    let store = create_session(&home, SESSION_ID, "Run the tests");
    let id = SessionId::from(SESSION_ID);

    cargo_bin_cmd!("concord")
        .env("CONCORD_HOME", home.path())
        .args(["sessions", "rename", SESSION_ID, "Green build"])
        .assert()
        .success();
    assert_eq!(store.find(&id).unwrap().unwrap().title, "Green build");

    cargo_bin_cmd!("concord")
        .env("CONCORD_HOME", home.path())
        .args(["sessions", "delete", SESSION_ID])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted session"));
    assert!(store.find(&id).unwrap().is_none());
}
