//! Smoke tests for the `docflow` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docflow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docflow");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let notes = root.join("library/notes");
    fs::create_dir_all(&notes).unwrap();
    fs::write(
        notes.join("leases.txt"),
        "# Leases\n\nA worker keeps its lease alive with heartbeats.\n\n## Reclaim\n\nStale leases are reclaimed.",
    )
    .unwrap();
    fs::write(notes.join("ignored.bin"), b"\x00\x01").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docflow.sqlite"

[storage]
root = "{root}/library"

[pipeline]
target_language = "en"
max_tokens = 64

[log]
level = "warn"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("docflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run(config: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(docflow_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run docflow");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));

    let (_, stderr, ok) = run(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_enqueue_work_and_status() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);

    let (stdout, stderr, ok) = run(&config, &["enqueue", "notes/leases.txt", "--batch", "b1"]);
    assert!(ok, "enqueue failed: {}", stderr);
    let id = stdout.trim().to_string();
    assert!(!id.is_empty());

    let (stdout, _, _) = run(&config, &["counters"]);
    assert!(stdout.contains("\"queued\":1"), "counters: {}", stdout);

    let (stdout, stderr, ok) = run(&config, &["work", "--once"]);
    assert!(ok, "work failed: {}", stderr);
    assert!(stdout.contains(&format!("completed {}", id)), "work: {}", stdout);

    let (stdout, _, ok) = run(&config, &["status", &id]);
    assert!(ok);
    assert!(stdout.contains("completed"));
    assert!(stdout.contains("extract"));
    assert!(stdout.contains("ingest"));

    let (stdout, _, _) = run(&config, &["work", "--once"]);
    assert!(stdout.contains("no claimable job"));
}

#[test]
fn test_enqueue_missing_item_fails() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);
    let (_, _, ok) = run(&config, &["enqueue", "notes/missing.txt"]);
    assert!(!ok);
}

#[test]
fn test_enqueue_dir_matches_globs() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);

    let (stdout, stderr, ok) = run(&config, &["enqueue-dir", "notes"]);
    assert!(ok, "enqueue-dir failed: {}", stderr);
    assert!(stdout.contains("matched:  1"), "enqueue-dir: {}", stdout);
    assert!(stdout.contains("enqueued: 1"));
}

#[test]
fn test_restart_requires_confirm() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);
    run(&config, &["enqueue", "notes/leases.txt", "--batch", "b1"]);

    let (_, stderr, ok) = run(&config, &["restart", "--batch", "b1"]);
    assert!(!ok);
    assert!(stderr.contains("confirm"), "stderr: {}", stderr);

    let (stdout, stderr, ok) = run(&config, &["restart", "--batch", "b1", "--confirm"]);
    assert!(ok, "restart failed: {}", stderr);
    assert!(stdout.contains("restarted: 1"));
}

#[test]
fn test_bad_policy_is_rejected() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);
    let (_, _, ok) = run(&config, &["enqueue", "notes/leases.txt", "--policy", "extract=sometimes"]);
    assert!(!ok);
}
