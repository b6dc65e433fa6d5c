use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_warningd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn warningd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn health_works_without_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let result = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(result["status"], "ok");
    assert!(result["version"].is_string());
    assert!(result["workspacePath"].is_null());
}

#[test]
fn data_methods_require_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    for (id, method) in [
        ("1", "warnings.list"),
        ("2", "priority.list"),
        ("3", "overview.dashboardStats"),
        ("4", "settings.get"),
    ] {
        let resp = request(&mut stdin, &mut reader, id, method, json!({}));
        assert_eq!(resp["ok"], false, "{} without workspace", method);
        assert_eq!(resp["error"]["code"], "no_workspace");
    }
}

#[test]
fn unknown_method_is_not_implemented() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "warnings.purge", json!({}));
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "not_implemented");
}

#[test]
fn malformed_json_line_yields_bad_json() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse");
    assert_eq!(value["ok"], false);
    assert_eq!(value["error"]["code"], "bad_json");
}

#[test]
fn every_handler_family_answers_after_workspace_select() {
    let workspace = temp_dir("warningd-smoke");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(selected["workspacePath"].is_string());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sync.students",
        json!({ "rows": [{ "studentId": "st-1", "name": "Avery Hill", "className": "9A" }] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "sync.examParticipation",
        json!({ "rows": [{ "studentId": "st-1", "examTitle": "midterm-1" }] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sync.riskScores",
        json!({ "rows": [{ "studentId": "st-1", "score": 42.0, "riskFactors": ["grades"] }] }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "5", "warnings.list", json!({}));
    assert_eq!(listed["total"], 0);

    let entries = request_ok(&mut stdin, &mut reader, "6", "priority.list", json!({}));
    assert_eq!(entries["entries"].as_array().expect("entries").len(), 0);

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "overview.priorityStudents",
        json!({ "examTitles": ["midterm-1"], "timeRange": "semester" }),
    );
    assert_eq!(
        overview["students"].as_array().expect("students").len(),
        1
    );

    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "overview.dashboardStats",
        json!({}),
    );
    assert_eq!(stats["activeWarnings"], 0);

    let settings = request_ok(&mut stdin, &mut reader, "9", "settings.get", json!({}));
    assert!(settings["riskThresholds"]["high"].is_number());

    let note = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "tracking.addNote",
        json!({
            "studentId": "st-1",
            "noteType": "observation",
            "content": "quiet this week",
            "createdBy": "teacher-1"
        }),
    );
    assert_eq!(note["noteType"], "observation");

    // The same workspace can be reopened by a fresh process.
    let (_child2, mut stdin2, mut reader2) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin2,
        &mut reader2,
        "11",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let profile = request_ok(
        &mut stdin2,
        &mut reader2,
        "12",
        "warnings.studentProfile",
        json!({ "studentId": "st-1" }),
    );
    assert_eq!(profile["trackingNotes"].as_array().expect("notes").len(), 1);
}
