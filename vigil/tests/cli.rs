//! CLI smoke tests
//!
//! These run the real binary with XDG directories pointed at temp dirs so
//! nothing touches the invoking user's store or logs.

use assert_cmd::Command;
use tempfile::TempDir;

fn vigil(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("vigil").unwrap();
    cmd.env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("XDG_DATA_HOME", home.path().join("data"))
        .env("XDG_STATE_HOME", home.path().join("state"));
    cmd
}

#[test]
fn test_help() {
    let home = TempDir::new().unwrap();
    vigil(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("run"))
        .stdout(predicates::str::contains("tail"));
}

#[test]
fn test_list_empty_store() {
    let home = TempDir::new().unwrap();
    vigil(&home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicates::str::contains("No sessions found"));
}

#[test]
fn test_show_unknown_session_fails() {
    let home = TempDir::new().unwrap();
    vigil(&home).args(["show", "ghost"]).assert().failure();
}

#[test]
fn test_run_reports_unavailable_for_missing_root() {
    let home = TempDir::new().unwrap();
    // Point the transcript root somewhere that does not exist; the wrapped
    // command must still run and its exit code must pass through.
    std::fs::create_dir_all(home.path().join("config/vigil")).unwrap();
    std::fs::write(
        home.path().join("config/vigil/config.toml"),
        "[agents]\nclaude_code_path = \"/nonexistent/transcripts\"\n",
    )
    .unwrap();

    vigil(&home)
        .args(["run", "--project", "/tmp", "--", "true"])
        .assert()
        .success()
        .stderr(predicates::str::contains("monitoring unavailable"));
}
