use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn prism_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_prism"))
}

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/prism.sqlite"

[engine]
interval_secs = 60
concurrency = 2

[notion.databases]
inbox = "inbox-db"
task = "task-db"
{}
"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("prism.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_prism(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = prism_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("NOTION_API_KEY")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run prism binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_prism(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/prism.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, success1) = run_prism(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_prism(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_status_without_runs() {
    let (_tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_prism(&config_path, &["status"]);
    assert!(success, "status failed: stderr={}", stderr);
    assert!(stdout.contains("No runs recorded yet."));
    assert!(stdout.contains("No open checkpoints."));
    assert!(stdout.contains("Mirror:          disabled"));
}

#[test]
fn test_once_requires_notion_credentials() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, stderr, success) = run_prism(&config_path, &["once"]);
    assert!(!success);
    assert!(stderr.contains("NOTION_API_KEY"), "stderr={}", stderr);
}

#[test]
fn test_mirror_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, stderr, success) = run_prism(&config_path, &["mirror"]);
    assert!(!success);
    assert!(stderr.contains("mirror is disabled"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env("\n[classifier]\npresets = [\"shopping\"]\n");

    let (_, stderr, success) = run_prism(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("Unknown classifier preset: 'shopping'"), "stderr={}", stderr);
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (_, stderr, success) = run_prism(&missing, &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr={}", stderr);
}
