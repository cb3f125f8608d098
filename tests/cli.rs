//! Binary smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

fn quarry() -> Command {
    let mut cmd = Command::cargo_bin("quarry").unwrap_or_else(|_| unreachable!());
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    quarry()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("research"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_models_as_json() {
    quarry()
        .args(["--format", "json", "models"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"provider\""));
}

#[test]
fn test_validate_reports_bad_document() {
    let dir = TempDir::new().unwrap_or_else(|_| unreachable!());
    let schema = dir.path().join("schema.json");
    let input = dir.path().join("input.json");
    std::fs::write(
        &schema,
        json!({"type": "object", "required": ["name"]}).to_string(),
    )
    .unwrap_or_else(|_| unreachable!());
    std::fs::write(&input, "{}").unwrap_or_else(|_| unreachable!());

    quarry()
        .arg("validate")
        .arg("--schema")
        .arg(&schema)
        .arg("--input")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not match the schema"));
}

#[test]
fn test_research_needs_entity_type() {
    quarry()
        .args(["research", "rocket companies"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--entity-type"));
}
