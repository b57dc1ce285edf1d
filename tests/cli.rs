use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn vqa_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("vqa");
    path
}

fn setup_test_env(embedding_provider: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let vault = root.join("vault");
    fs::create_dir_all(vault.join("Work")).unwrap();
    fs::write(
        vault.join("alpha.md"),
        "# Alpha\n\nNotes about Rust programming, cargo and crates.",
    )
    .unwrap();
    fs::write(
        vault.join("Work").join("beta.md"),
        "# Beta\n\nQuarterly planning and the hiring pipeline.",
    )
    .unwrap();
    fs::write(vault.join("ignored.txt"), "not a note").unwrap();

    let config_content = format!(
        r#"[vault]
root = "{root}/vault"

[db]
path = "{root}/data/index.sqlite"

[embedding]
provider = "{provider}"
"#,
        root = root.display(),
        provider = embedding_provider,
    );

    let config_path = config_dir.join("vqa.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vqa(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = vqa_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vqa binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("openai");

    let (stdout, stderr, success) = run_vqa(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("index.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (_, _, success1) = run_vqa(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_vqa(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_status_counts_pending_notes() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (stdout, stderr, success) = run_vqa(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("notes: 2"), "got: {}", stdout);
    assert!(stdout.contains("indexed: 0"));
    assert!(stdout.contains("pending: 2"));
    assert!(stdout.contains("last full sync: never"));
}

#[test]
fn test_status_json() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (stdout, _, success) = run_vqa(&config_path, &["status", "--json"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["total_notes"], 2);
    assert_eq!(value["pending_notes"], 2);
    assert_eq!(value["chunk_vectors"], 0);
    assert_eq!(value["embedding_model"], "text-embedding-3-small");
}

#[test]
fn test_sync_requires_embedding_provider() {
    let (_tmp, config_path) = setup_test_env("disabled");

    let (_, stderr, success) = run_vqa(&config_path, &["sync"]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}

#[test]
fn test_route_simple_question() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (stdout, _, success) = run_vqa(&config_path, &["route", "Where is my passport?"]);
    assert!(success);
    assert!(stdout.contains("route openai/gpt-4o-mini"), "got: {}", stdout);
    assert!(stdout.contains("tier: simple"));
    assert!(stdout.contains("no complexity cues found"));
}

#[test]
fn test_route_json_and_override() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (stdout, _, success) = run_vqa(
        &config_path,
        &["route", "Compare my Q1 and Q2 retros", "--json"],
    );
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["tier"], "complex");
    assert_eq!(value["provider"], "anthropic");
    assert_eq!(value["overridden"], false);
    assert!(value["analysis"]["score"].as_u64().unwrap() >= 2);

    let (stdout, _, success) = run_vqa(
        &config_path,
        &["route", "Compare my Q1 and Q2 retros", "--complexity", "simple", "--json"],
    );
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["tier"], "simple");
    assert_eq!(value["overridden"], true);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (_, stderr, success) = run_vqa(&missing, &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "got: {}", stderr);
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env("carrier-pigeon");

    let (_, stderr, success) = run_vqa(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("Unknown embedding provider"), "got: {}", stderr);
}

#[test]
fn test_folders_lists_top_level() {
    let (tmp, config_path) = setup_test_env("openai");
    let nested = tmp.path().join("vault").join("Work").join("2024");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("retro.md"), "# Retro\n\nWhat went well.").unwrap();

    let (stdout, stderr, success) = run_vqa(&config_path, &["folders"]);
    assert!(success, "folders failed: stdout={}, stderr={}", stdout, stderr);
    assert_eq!(stdout.trim(), "Work (2)");

    let (stdout, _, success) = run_vqa(&config_path, &["folders", "--json"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["total"], 1);
    assert_eq!(value["folders"][0]["name"], "Work");
    assert_eq!(value["folders"][0]["notes"], 2);
}

#[test]
fn test_notes_filtered_by_folder() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (stdout, stderr, success) = run_vqa(&config_path, &["notes", "--folder", "Work"]);
    assert!(success, "notes failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Work/beta.md"), "got: {}", stdout);
    assert!(stdout.contains("(Beta)"));
    assert!(!stdout.contains("alpha.md"));

    let (stdout, _, success) = run_vqa(&config_path, &["notes", "--json"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["total"], 2);
    let notes = value["notes"].as_array().unwrap();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n["modified"].is_string()));
    assert!(notes
        .iter()
        .any(|n| n["path"] == "alpha.md" && n["folder"] == "" && n["title"] == "Alpha"));
}

#[test]
fn test_notes_pagination() {
    let (_tmp, config_path) = setup_test_env("openai");

    let (stdout, _, success) = run_vqa(&config_path, &["notes", "--limit", "1", "--json"]);
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["total"], 2);
    assert_eq!(value["notes"].as_array().unwrap().len(), 1);

    let (stdout, _, success) = run_vqa(&config_path, &["notes", "--offset", "5"]);
    assert!(success);
    assert!(stdout.contains("No notes."));

    let (_, stderr, success) = run_vqa(&config_path, &["notes", "--limit", "0"]);
    assert!(!success);
    assert!(stderr.contains("--limit"), "got: {}", stderr);
}
