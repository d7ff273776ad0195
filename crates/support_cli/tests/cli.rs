use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

fn supportbot() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("supportbot"));
    cmd.env_remove("SUPPORTBOT_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn build_kb() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("build-kb"));
    cmd.env_remove("SUPPORTBOT_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// A project tree using the hashing embedder, so no model download is needed.
fn hash_project() -> tempfile::TempDir {
    let home = tempfile::tempdir().unwrap();
    let config = home.path().join("config");
    fs::create_dir_all(&config).unwrap();
    fs::write(config.join("settings.toml"), "embedder = \"hash\"\n").unwrap();

    let policies = home.path().join("data/raw/policies");
    fs::create_dir_all(&policies).unwrap();
    fs::write(
        policies.join("shipping_policy.txt"),
        "Standard shipping takes 3-5 business days.\n\nExpress orders ship the same day.\n",
    )
    .unwrap();
    fs::write(
        policies.join("refund_policy.txt"),
        "Refunds are issued within 30 days of purchase.",
    )
    .unwrap();
    home
}

fn default_collection(home: &Path) -> PathBuf {
    home.join("artifacts/chroma_db_data/company_knowledge_base.jsonl")
}

/// The collection file named by the `output=` field of the summary line.
fn reported_output(stdout: &[u8]) -> PathBuf {
    let stdout = String::from_utf8_lossy(stdout);
    let field = stdout
        .split_whitespace()
        .find_map(|f| f.strip_prefix("output="))
        .unwrap_or_else(|| panic!("no output= field in {stdout:?}"));
    PathBuf::from(field)
}

#[test]
fn startup_without_artifacts_is_critical() {
    let home = tempfile::tempdir().unwrap();
    supportbot()
        .arg("--home")
        .arg(home.path())
        .write_stdin("hello\nexit\n")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("CRITICAL ERROR during startup"))
        .stdout(predicate::str::contains("Session ID").not());
}

#[test]
fn explicit_config_must_exist() {
    let home = tempfile::tempdir().unwrap();
    supportbot()
        .arg("--home")
        .arg(home.path())
        .arg("--config")
        .arg(home.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.toml"));
}

#[test]
fn build_kb_reports_a_missing_policy_folder() {
    let home = hash_project();
    build_kb()
        .arg("--home")
        .arg(home.path())
        .arg("--policies")
        .arg(home.path().join("nowhere"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no policy folder found"));
    assert!(!default_collection(home.path()).exists());
    assert!(!home.path().join("artifacts/chroma_db_data").exists());
}

#[test]
fn build_kb_writes_one_line_per_paragraph() {
    let home = hash_project();
    let assert = build_kb()
        .arg("--home")
        .arg(home.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("files=2 chunks=3 replaced=false"));

    let output = reported_output(&assert.get_output().stdout);
    assert_eq!(output, default_collection(home.path()));
    let contents = fs::read_to_string(&output).unwrap();
    assert_eq!(contents.lines().count(), 3);
    assert!(contents.contains("\"id\":\"shipping_policy_chunk_1\""));
    assert!(contents.contains("\"category\":\"refund\""));
}

#[test]
fn rebuilding_replaces_the_collection() {
    let home = hash_project();
    let mut outputs = Vec::new();
    for expected in ["replaced=false", "replaced=true"] {
        let assert = build_kb()
            .arg("--home")
            .arg(home.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(expected));
        outputs.push(reported_output(&assert.get_output().stdout));
    }
    assert_eq!(outputs[0], outputs[1]);
    let contents = fs::read_to_string(&outputs[1]).unwrap();
    assert_eq!(contents.lines().count(), 3);
}
