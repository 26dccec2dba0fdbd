use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_shows_all_commands() {
    cargo_bin_cmd!("ap")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("login"))
        .stdout(predicate::str::contains("chats"))
        .stdout(predicate::str::contains("ask"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_ask_help_shows_chat_flag() {
    cargo_bin_cmd!("ap")
        .args(["ask", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--chat"))
        .stdout(predicate::str::contains("--agent"));
}

#[test]
fn test_missing_subcommand_fails() {
    cargo_bin_cmd!("ap").assert().failure();
}
