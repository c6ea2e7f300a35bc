use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn hvst_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hvst"))
}

fn record_xml(remote_id: &str, title: &str, pdf: Option<&str>) -> String {
    let resources = match pdf {
        Some(href) => format!(
            r#"<resourceMap><resource href="{}" bundle="ORIGINAL" mimetype="application/pdf"/></resourceMap>"#,
            href
        ),
        None => String::new(),
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<record>
  <header>
    <identifier>{}</identifier>
    <datestamp>2024-01-01T00:00:00Z</datestamp>
  </header>
  <metadata>
    <oai_dc:dc>
      <dc:title xml:lang="en">{}</dc:title>
      <dc:type>thesis</dc:type>
    </oai_dc:dc>
  </metadata>
  {}
</record>
"#,
        remote_id, title, resources
    )
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let records = root.join("records");
    fs::create_dir_all(records.join("files")).unwrap();
    fs::write(records.join("files/a.pdf"), b"%PDF-1.4 alpha").unwrap();
    fs::write(
        records.join("alpha.xml"),
        record_xml("oai:example.org:1", "Alpha", Some("files/a.pdf")),
    )
    .unwrap();
    fs::write(
        records.join("beta.xml"),
        record_xml("oai:example.org:2", "Beta", None),
    )
    .unwrap();
    fs::write(
        records.join("gone.xml"),
        r#"<record><header status="deleted"><identifier>oai:example.org:3</identifier></header></record>"#,
    )
    .unwrap();
    fs::write(records.join("broken.xml"), "<record><metadata>").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/hvst.sqlite"

[logging]
level = "warn"

[harvest]
metadata_remover = "all"
"#,
        root.display()
    );

    let config_path = config_dir.join("hvst.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_hvst(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = hvst_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run hvst binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn prepared(tmp: &TempDir, config_path: &Path) -> String {
    let (_, stderr, ok) = run_hvst(config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (_, stderr, ok) = run_hvst(config_path, &["collection", "create", "theses"]);
    assert!(ok, "collection create failed: {}", stderr);
    tmp.path().join("records").to_string_lossy().to_string()
}

fn item_id_for(config_path: &Path, remote_id: &str) -> String {
    let (stdout, stderr, ok) = run_hvst(config_path, &["resolve", "theses", remote_id]);
    assert!(ok, "resolve failed: {}", stderr);
    stdout
        .split_whitespace()
        .nth(2)
        .unwrap_or_else(|| panic!("unexpected resolve output: {}", stdout))
        .to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success1) = run_hvst(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_hvst(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_collection_create_and_list() {
    let (tmp, config_path) = setup_test_env();
    prepared(&tmp, &config_path);

    let (_, _, dup) = run_hvst(&config_path, &["collection", "create", "theses"]);
    assert!(!dup, "duplicate collection name should fail");

    let (stdout, _, ok) = run_hvst(&config_path, &["collection", "list"]);
    assert!(ok);
    assert!(stdout.contains("theses"));
}

#[test]
fn test_harvest_dry_run() {
    let (tmp, config_path) = setup_test_env();
    let records = prepared(&tmp, &config_path);

    let (stdout, stderr, ok) = run_hvst(&config_path, &["harvest", "theses", &records, "--dry-run"]);
    assert!(ok, "dry run failed: {}", stderr);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("files found: 4"));
    assert!(stdout.contains("records: 2"));
    assert!(stdout.contains("deleted: 1"));
    assert!(stdout.contains("unreadable: 1"));
}

#[test]
fn test_harvest_twice_creates_then_updates() {
    let (tmp, config_path) = setup_test_env();
    let records = prepared(&tmp, &config_path);

    let (stdout, stderr, ok) = run_hvst(&config_path, &["harvest", "theses", &records]);
    assert!(ok, "harvest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("created: 2"), "got: {}", stdout);
    assert!(stdout.contains("failed: 1"), "got: {}", stdout);
    assert!(stdout.contains("ok"));

    let (stdout, _, ok) = run_hvst(&config_path, &["harvest", "theses", &records]);
    assert!(ok);
    assert!(stdout.contains("created: 0"), "got: {}", stdout);
    assert!(stdout.contains("updated: 2"), "got: {}", stdout);

    let (stdout, _, ok) = run_hvst(&config_path, &["stats"]);
    assert!(ok);
    assert!(stdout.contains("Archived:      2"), "got: {}", stdout);
    assert!(stdout.contains("Harvested:     2"), "got: {}", stdout);
}

#[test]
fn test_item_dump_and_forget() {
    let (tmp, config_path) = setup_test_env();
    let records = prepared(&tmp, &config_path);
    run_hvst(&config_path, &["harvest", "theses", &records]);

    let item_id = item_id_for(&config_path, "oai:example.org:1");

    let (stdout, stderr, ok) = run_hvst(&config_path, &["item", &item_id, "--json"]);
    assert!(ok, "item failed: {}", stderr);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["stage"], "archived");
    assert_eq!(json["harvest"]["remote_id"], "oai:example.org:1");
    assert_eq!(json["bitstreams"][0]["name"], "a.pdf");
    assert_eq!(json["handle"], "123456789/1");

    let (_, stderr, ok) = run_hvst(&config_path, &["record", "forget", &item_id]);
    assert!(ok, "forget failed: {}", stderr);

    let (stdout, _, ok) = run_hvst(&config_path, &["resolve", "theses", "oai:example.org:1"]);
    assert!(ok);
    assert!(stdout.contains("is not bound"), "got: {}", stdout);

    let (_, _, again) = run_hvst(&config_path, &["record", "forget", &item_id]);
    assert!(!again, "forgetting twice should fail");
}

#[test]
fn test_unknown_collection_fails() {
    let (tmp, config_path) = setup_test_env();
    let records = prepared(&tmp, &config_path);

    let (_, stderr, ok) = run_hvst(&config_path, &["harvest", "nope", &records]);
    assert!(!ok);
    assert!(stderr.contains("Collection not found"), "got: {}", stderr);
}
