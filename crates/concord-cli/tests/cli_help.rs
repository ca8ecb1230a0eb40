use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_shows_all_commands() {
    cargo_bin_cmd!("concord")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("sessions"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("--engine"));
}

#[test]
fn test_sessions_help_shows_subcommands() {
    cargo_bin_cmd!("concord")
        .args(["sessions", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("delete"))
        .stdout(predicate::str::contains("rename"));
}

#[test]
fn test_unknown_engine_is_rejected() {
    cargo_bin_cmd!("concord")
        .args(["--engine", "gpt", "chat"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown engine"));
}

#[test]
fn test_version_flag() {
    cargo_bin_cmd!("concord")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1"));
}
