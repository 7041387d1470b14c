use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cgx_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cgx"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    // One ChatGPT-style record, the rest in the simple shape.
    let export = r#"[
  {
    "title": "Borrow checker",
    "create_time": 1700000000,
    "current_node": "n3",
    "mapping": {
      "n1": {"id": "n1", "parent": null, "message": null},
      "n2": {"id": "n2", "parent": "n1", "message": {
        "author": {"role": "user"},
        "content": {"content_type": "text",
                    "parts": ["Why can't I borrow this vector mutably twice in Rust?"]}}},
      "n3": {"id": "n3", "parent": "n2", "message": {
        "author": {"role": "assistant"},
        "content": {"content_type": "text",
                    "parts": ["Rust forbids two live mutable borrows; end the first one early."]}}}
    }
  },
  {
    "title": "Starter care",
    "messages": [
      {"role": "user", "content": "How often should I feed a sourdough starter?"},
      {"role": "assistant",
       "content": "Feed the sourdough starter daily with equal weights of flour and water."}
    ]
  },
  {
    "title": "Async runtimes",
    "messages": [
      {"role": "user", "content": "Should I use tokio or async-std for a Rust web service?"},
      {"role": "assistant", "content": "Tokio has the larger ecosystem for Rust web services."}
    ]
  }
]"#;
    fs::write(data_dir.join("export.json"), export).unwrap();

    let config_content = format!(
        r#"[paths]
input = "{root}/data/export.json"
work_dir = "{root}/data/work"

[chunking]
max_tokens = 200

[embedding]
provider = "hashing"
dims = 64

[clustering]
min_cluster_size = 2

[stores]
backend = "sqlite"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("cgx.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cgx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cgx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cgx binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

/// The summary line for `stage` in `cgx run` output.
fn stage_line<'a>(stdout: &'a str, stage: &str) -> &'a str {
    stdout
        .lines()
        .find(|l| l.trim_start().starts_with(&format!("{} ", stage)))
        .unwrap_or_else(|| panic!("no line for stage {} in:\n{}", stage, stdout))
}

#[test]
fn test_init_creates_stores() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cgx(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/work/graph.sqlite").exists());
    assert!(tmp.path().join("data/work/vectors.sqlite").exists());

    let (_, _, again) = run_cgx(&config_path, &["init"]);
    assert!(again, "Second init failed (not idempotent)");
}

#[test]
fn test_run_then_rerun_is_incremental() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cgx(&config_path, &["run"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stage_line(&stdout, "extract").contains("written: 3"));
    assert!(stage_line(&stdout, "load").contains("committed"));
    assert!(stdout.contains("ok"));

    let manifest = tmp.path().join("data/work/manifests/extract.log");
    let before = fs::read_to_string(&manifest).unwrap();

    let (stdout, _, success) = run_cgx(&config_path, &["run"]);
    assert!(success);
    for stage in ["extract", "chunk", "enrich", "embed", "cluster", "position", "load"] {
        assert!(
            stage_line(&stdout, stage).contains("skipped "),
            "expected {} skipped, got: {}",
            stage,
            stdout
        );
    }
    assert_eq!(fs::read_to_string(&manifest).unwrap(), before);
}

#[test]
fn test_status_reports_counts() {
    let (_tmp, config_path) = setup_test_env();
    run_cgx(&config_path, &["run"]);

    let (stdout, _, success) = run_cgx(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("extract: 9"), "got: {}", stdout);
    assert!(stdout.contains("Conversation: 3"));
    assert!(stdout.contains("Message: 6"));
    assert!(stdout.contains("chunks: 6"));
}

#[test]
fn test_audit_strict_passes_after_run() {
    let (_tmp, config_path) = setup_test_env();
    run_cgx(&config_path, &["run"]);

    let (stdout, stderr, success) = run_cgx(&config_path, &["audit", "--strict"]);
    assert!(success, "audit failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("audit Chunk"));
    assert!(stdout.contains("only in graph: 0"));
    assert!(stdout.contains("only in vectors: 0"));

    let (_, _, success) = run_cgx(&config_path, &["audit", "tag"]);
    assert!(!success, "unknown audit entity should fail");
}

#[test]
fn test_search_finds_related_chunk() {
    let (_tmp, config_path) = setup_test_env();
    run_cgx(&config_path, &["run"]);

    let (stdout, _, success) = run_cgx(
        &config_path,
        &["search", "feed sourdough starter", "--limit", "2"],
    );
    assert!(success, "search failed");
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.starts_with("1. ["), "got: {}", stdout);
    assert!(first.contains("Starter care"), "got: {}", stdout);
    assert!(!stdout.contains("3. ["));
}

#[test]
fn test_filter_by_tag_pages() {
    let (_tmp, config_path) = setup_test_env();
    run_cgx(&config_path, &["run"]);

    let (stdout, _, success) = run_cgx(
        &config_path,
        &["filter", "--tag", "untagged", "--page-size", "4"],
    );
    assert!(success);
    assert!(stdout.contains("6 total"), "got: {}", stdout);
    assert!(stdout.contains("4. "));
    assert!(!stdout.contains("5. "));

    let (stdout, _, _) = run_cgx(
        &config_path,
        &["filter", "--tag", "untagged", "--page", "2", "--page-size", "4"],
    );
    assert!(stdout.contains("5. "));
    assert!(stdout.contains("6. "));

    let (stdout, _, success) = run_cgx(&config_path, &["filter", "--domain", "nothing-here"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_single_stage_with_explicit_paths() {
    let (tmp, config_path) = setup_test_env();
    let out = tmp.path().join("manual");
    let export = tmp.path().join("data/export.json");
    let manifest = tmp.path().join("manual/extract.log");

    let (stdout, stderr, success) = run_cgx(
        &config_path,
        &[
            "stage",
            "extract",
            "--input",
            export.to_str().unwrap(),
            "--output",
            out.to_str().unwrap(),
            "--manifest",
            manifest.to_str().unwrap(),
        ],
    );
    assert!(success, "stage failed: stdout={}, stderr={}", stdout, stderr);
    assert!(out.join("conversations.jsonl").exists());
    assert!(out.join("messages.jsonl").exists());
    assert_eq!(fs::read_to_string(&manifest).unwrap().lines().count(), 9);

    let (stdout, _, success) = run_cgx(
        &config_path,
        &[
            "stage",
            "chunk",
            "--input",
            out.to_str().unwrap(),
            "--output",
            out.to_str().unwrap(),
            "--manifest",
            tmp.path().join("manual/chunk.log").to_str().unwrap(),
        ],
    );
    assert!(success);
    assert!(stdout.contains("written: 6"), "got: {}", stdout);
    assert!(out.join("chunks.jsonl").exists());
}

#[test]
fn test_unknown_stage_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_cgx(
        &config_path,
        &["stage", "index", "--input", "a", "--output", "b", "--manifest", "c"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown stage"));
}

#[test]
fn test_corrupt_manifest_fails_run() {
    let (tmp, config_path) = setup_test_env();
    let manifests = tmp.path().join("data/work/manifests");
    fs::create_dir_all(&manifests).unwrap();
    fs::write(manifests.join("enrich.log"), "definitely not hex\n").unwrap();

    let (stdout, _, success) = run_cgx(&config_path, &["run"]);
    assert!(!success, "run should fail on a corrupt manifest");
    assert!(stage_line(&stdout, "chunk").contains("committed"));
    assert!(stage_line(&stdout, "enrich").contains("failed"));
    assert!(stage_line(&stdout, "load").contains("pending"));
    assert!(!tmp.path().join("data/work/artifacts/enriched.jsonl").exists());
}

#[test]
fn test_filter_needs_exactly_one_criterion() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_cgx(
        &config_path,
        &["filter", "--tag", "rust", "--domain", "cooking"],
    );
    assert!(!success, "combined criteria should be rejected");
    assert!(stderr.contains("cannot be used with"), "got: {}", stderr);

    let (_, _, success) = run_cgx(&config_path, &["filter"]);
    assert!(!success, "filter without a criterion should be rejected");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cgx(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
