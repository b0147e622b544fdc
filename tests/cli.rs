//! CLI test cases.
//!
//! Everything here runs without a network: preview mode and the error
//! paths exit before any LLM call is made.

use assert_cmd::Command;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("prompt-batch").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_process_requires_a_prompt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.jsonl"), "{\"t\": \"a\"}\n").unwrap();
    cmd()
        .current_dir(dir.path())
        .args(["process", "in.jsonl", "out.jsonl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("prompt"));
}

#[test]
fn test_process_rejects_unknown_formats() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(dir.path())
        .args(["process", "in.parquet", "out.parquet", "--prompt", "X {t}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported input format"));
}

#[test]
fn test_preview_renders_prompts_without_credentials() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("in.jsonl"),
        "{\"t\": \"hello\"}\n{\"t\": \"world\"}\n",
    )
    .unwrap();

    cmd()
        .current_dir(dir.path())
        .env_remove("OPENAI_API_KEY")
        .args([
            "process",
            "in.jsonl",
            "out.jsonl",
            "--prompt",
            "Say {t}",
            "--preview",
            "1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Say hello"))
        .stdout(predicate::str::contains("Say world").not());

    // Preview never writes the output file.
    assert!(!dir.path().join("out.jsonl").exists());
}

#[test]
fn test_process_rejects_a_template_field_the_input_lacks() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.jsonl"), "{\"t\": \"a\"}\n").unwrap();
    cmd()
        .current_dir(dir.path())
        .env_remove("OPENAI_API_KEY")
        .args(["process", "in.jsonl", "out.jsonl", "--prompt", "Say {missing}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn test_process_requires_an_api_key() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.jsonl"), "{\"t\": \"a\"}\n").unwrap();
    cmd()
        .current_dir(dir.path())
        .env_remove("OPENAI_API_KEY")
        .args(["process", "in.jsonl", "out.jsonl", "--prompt", "Say {t}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("API key"));
}

#[test]
fn test_empty_input_completes_without_calling_the_model() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("in.jsonl"), "").unwrap();
    cmd()
        .current_dir(dir.path())
        .env_remove("OPENAI_API_KEY")
        .args(["process", "in.jsonl", "out.jsonl", "--prompt", "Say {t}"])
        .assert()
        .success();
    assert!(dir.path().join("out.jsonl").exists());
}

#[test]
fn test_resume_unknown_job_fails() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .current_dir(dir.path())
        .args(["resume", "no_such_job"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no checkpoint"));
}
