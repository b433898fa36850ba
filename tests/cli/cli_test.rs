//! CLI contract tests.

use assert_cmd::Command;
use uuid::Uuid;

struct Sandbox {
    _dir: tempfile::TempDir,
    database: std::path::PathBuf,
    config: std::path::PathBuf,
}

fn sandbox() -> Sandbox {
    let dir = tempfile::tempdir().expect("tempdir");
    let database = dir.path().join("jotter.db");
    let config = dir.path().join("absent.toml");
    Sandbox {
        _dir: dir,
        database,
        config,
    }
}

fn jotter(sandbox: &Sandbox) -> Command {
    let mut cmd = Command::cargo_bin("jotter").expect("binary should build");
    cmd.env("JOTTER_CONFIG_PATH", &sandbox.config)
        .env("JOTTER_DATABASE", &sandbox.database)
        .env("JOTTER_OLLAMA_URL", "http://127.0.0.1:9")
        .env_remove("RUST_LOG");
    cmd
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_primary_subcommands() {
    let sandbox = sandbox();
    let output = jotter(&sandbox).arg("--help").output().expect("run");
    assert!(output.status.success());
    let help = stdout_of(&output);
    for sub in ["create", "retry", "show", "list", "logs", "analyze", "watch"] {
        assert!(help.contains(sub), "help should mention {sub}");
    }
}

#[test]
fn malformed_id_is_a_usage_error() {
    let sandbox = sandbox();
    let output = jotter(&sandbox)
        .args(["show", "not-a-uuid"])
        .output()
        .expect("run");
    assert!(!output.status.success());
    assert!(!sandbox.database.exists(), "arguments are checked before startup");
}

#[test]
fn list_on_fresh_database_is_empty() {
    let sandbox = sandbox();
    let output = jotter(&sandbox).arg("list").output().expect("run");
    assert!(output.status.success(), "{output:?}");
    let listed: serde_json::Value =
        serde_json::from_str(stdout_of(&output).trim()).expect("json on stdout");
    assert_eq!(listed, serde_json::json!([]));
    assert!(sandbox.database.exists());
}

#[test]
fn show_unknown_entry_fails() {
    let sandbox = sandbox();
    let output = jotter(&sandbox)
        .args(["show", &Uuid::new_v4().to_string()])
        .output()
        .expect("run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}
