#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use rusqlite::Connection;
use serde_json::{json, Value};
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn pull_schema() -> PathBuf {
    repo_root().join("contracts/v1/schemas/pull-result.schema.json")
}

fn fixture_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hookbuffer-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.as_os_str().to_owned();
        file.push(suffix);
        let _ = fs::remove_file(PathBuf::from(file));
    }
}

fn hb_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_hb"));
    command.arg("--db").arg(db_path);
    command.env_remove("HOOKBUFFER_LOG");
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run hb command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn register_github(db_path: &Path) {
    let output = hb_output(
        db_path,
        &[
            "webhook",
            "register",
            "--name",
            "github",
            "--thread-id-path",
            "pull_request.id",
            "--revision-path",
            "pull_request.updated_at",
        ],
    );
    assert_success(&output);
}

fn ingest_github(db_path: &Path, thread_id: &str, revision: i64) -> Value {
    let payload = json!({"pull_request": {"id": thread_id, "updated_at": revision}});
    let output = hb_output(
        db_path,
        &[
            "ingest",
            "--webhook",
            "github",
            "--payload-json",
            &payload.to_string(),
        ],
    );
    assert_success(&output);
    stdout_json(&output)
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(env!("CARGO_BIN_EXE_hb")).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["webhook", "ingest", "pull", "thread", "updates"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn pull_fixture_matches_schema() {
    let fixture = read_json(&repo_root().join("contracts/v1/fixtures/pull-result.sample.json"));
    assert_schema(&pull_schema(), &fixture);
    assert_schema(&pull_schema(), &json!({"update": null}));
}

#[test]
fn pull_delivers_only_newest_revision_per_thread() {
    let db_path = fixture_db_path("coalesce");
    register_github(&db_path);

    for revision in [3, 1, 5, 2, 4] {
        let ingested = ingest_github(&db_path, "pr-7", revision);
        assert_eq!(ingested["status"], json!("pending"));
    }

    let output = hb_output(&db_path, &["pull"]);
    assert_success(&output);
    let pulled = stdout_json(&output);
    assert_schema(&pull_schema(), &pulled);
    assert_eq!(pulled["update"]["revision"], json!(5.0));
    assert_eq!(pulled["update"]["thread_key"]["thread_id"], json!("pr-7"));

    let output = hb_output(&db_path, &["pull"]);
    assert_success(&output);
    let empty = stdout_json(&output);
    assert_schema(&pull_schema(), &empty);
    assert_eq!(empty, json!({"update": null}));

    let output = hb_output(
        &db_path,
        &["thread", "show", "--webhook", "github", "--thread-id", "pr-7"],
    );
    assert_success(&output);
    assert_eq!(stdout_json(&output)["last_delivered_revision"], json!(5.0));

    let output = hb_output(&db_path, &["updates", "list", "--status", "skipped"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["total"], json!(4));

    remove_db_files(&db_path);
}

#[test]
fn pull_buffer_defers_fresh_updates() {
    let db_path = fixture_db_path("buffer");
    register_github(&db_path);
    let _ = ingest_github(&db_path, "pr-1", 1);

    let output = hb_output(&db_path, &["pull", "--buffer-seconds", "3600"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output), json!({"update": null}));

    let output = hb_output(&db_path, &["updates", "list", "--status", "pending"]);
    assert_success(&output);
    assert_eq!(stdout_json(&output)["total"], json!(1));

    remove_db_files(&db_path);
}

#[test]
fn pull_fail_with_exits_non_zero_and_records_error() {
    let db_path = fixture_db_path("fail-with");
    register_github(&db_path);
    let _ = ingest_github(&db_path, "pr-9", 1);

    let output = hb_output(&db_path, &["pull", "--fail-with", "downstream unavailable"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("downstream unavailable"),
        "expected failure message on stderr, got stderr={stderr}"
    );

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let status: String = match conn.query_row(
        "SELECT status FROM thread_updates WHERE thread_id = 'pr-9'",
        [],
        |row| row.get(0),
    ) {
        Ok(value) => value,
        Err(err) => panic!("failed to read status: {err}"),
    };
    assert_eq!(status, "error");

    remove_db_files(&db_path);
}

#[test]
fn zero_lock_ttl_is_rejected() {
    let db_path = fixture_db_path("zero-ttl");
    let output = hb_output(&db_path, &["--lock-ttl-seconds", "0", "pull"]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    remove_db_files(&db_path);
}

#[test]
fn ingest_unknown_webhook_fails_with_stable_message() {
    let db_path = fixture_db_path("unknown-webhook");
    let output = hb_output(
        &db_path,
        &["ingest", "--webhook", "missing", "--payload-json", "{}"],
    );
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("webhook missing is not registered"),
        "expected stable error shape, got stderr={stderr}"
    );

    remove_db_files(&db_path);
}
