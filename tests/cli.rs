mod common;

use common::{admin_bin, taskwatch_bin};

fn stdout_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn version_flag_prints_version() {
    let assert = taskwatch_bin().arg("--version").assert().success();
    assert!(stdout_of(&assert).starts_with(&format!("taskwatch {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn help_lists_commands() {
    let assert = taskwatch_bin().arg("--help").assert().success();
    let out = stdout_of(&assert);
    for command in ["link", "unlink", "track", "history", "--config"] {
        assert!(out.contains(command), "help is missing {command}");
    }
}

#[test]
fn unknown_command_fails() {
    taskwatch_bin().arg("frobnicate").assert().failure().code(2);
}

#[test]
fn daemon_without_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    admin_bin(&dir.path().join("state.db")).assert().failure();
}

#[test]
fn link_unlink_and_history_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");

    let linked = admin_bin(&db).args(["link", "1001", "55", "@ivan"]).assert().success();
    assert!(stdout_of(&linked).contains("Linked Telegram user 1001 to Bitrix24 user 55"));

    let tracked = admin_bin(&db).args(["track", "41127"]).assert().success();
    assert!(stdout_of(&tracked).contains("Task 41127 is now watched"));

    let history = admin_bin(&db).args(["history", "41127"]).assert().success();
    assert!(stdout_of(&history).contains("No notifications recorded"));

    let unlinked = admin_bin(&db).args(["unlink", "1001"]).assert().success();
    assert!(stdout_of(&unlinked).contains("Unlinked Telegram user 1001"));

    let again = admin_bin(&db).args(["unlink", "1001"]).assert().success();
    assert!(stdout_of(&again).contains("was not linked"));
}

#[test]
fn link_rejects_non_numeric_ids() {
    let dir = tempfile::tempdir().unwrap();
    admin_bin(&dir.path().join("state.db"))
        .args(["link", "ivan", "55"])
        .assert()
        .failure();
}
