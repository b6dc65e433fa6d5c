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

fn seed_students(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "sync.students",
        json!({ "rows": [
            { "studentId": "st-1", "name": "Avery Hill", "className": "9A" },
            { "studentId": "st-2", "name": "Blair Osei", "className": "9B" }
        ] }),
    );
}

#[test]
fn add_rejects_second_active_entry_for_same_student() {
    let workspace = temp_dir("warningd-priority-conflict");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_students(&mut stdin, &mut reader, &workspace);

    let added = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "priority.add",
        json!({
            "studentId": "st-1",
            "priorityLevel": "high",
            "reasonDescription": "three failed math exams",
            "customTags": ["math"],
            "interventionGoals": ["weekly tutoring"]
        }),
    );
    let entry = &added["entry"];
    assert_eq!(entry["studentId"], "st-1");
    assert_eq!(entry["sourceType"], "manual");
    assert_eq!(entry["priorityLevel"], "high");
    assert_eq!(entry["isActive"], true);
    let entry_id = entry["id"].as_str().expect("entry id").to_string();

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "2",
        "priority.add",
        json!({
            "studentId": "st-1",
            "priorityLevel": "low",
            "reasonDescription": "another reason"
        }),
    );
    assert_eq!(duplicate["ok"], false);
    assert_eq!(duplicate["error"]["code"], "conflict");
    assert_eq!(duplicate["error"]["details"]["entryId"], entry_id.as_str());

    // The conflicting call must not have altered the existing entry.
    let listed = request_ok(&mut stdin, &mut reader, "3", "priority.list", json!({}));
    let entries = listed["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["priorityLevel"], "high");
}

#[test]
fn add_validates_inputs_and_student_existence() {
    let workspace = temp_dir("warningd-priority-validate");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_students(&mut stdin, &mut reader, &workspace);

    let blank_reason = request(
        &mut stdin,
        &mut reader,
        "1",
        "priority.add",
        json!({ "studentId": "st-1", "priorityLevel": "high", "reasonDescription": "   " }),
    );
    assert_eq!(blank_reason["error"]["code"], "validation_error");

    let bad_level = request(
        &mut stdin,
        &mut reader,
        "2",
        "priority.add",
        json!({ "studentId": "st-1", "priorityLevel": "urgent", "reasonDescription": "x" }),
    );
    assert_eq!(bad_level["error"]["code"], "validation_error");

    let bad_source = request(
        &mut stdin,
        &mut reader,
        "3",
        "priority.add",
        json!({
            "studentId": "st-1",
            "priorityLevel": "high",
            "reasonDescription": "x",
            "sourceType": "import"
        }),
    );
    assert_eq!(bad_source["error"]["code"], "validation_error");

    let unknown_student = request(
        &mut stdin,
        &mut reader,
        "4",
        "priority.add",
        json!({ "studentId": "st-404", "priorityLevel": "high", "reasonDescription": "x" }),
    );
    assert_eq!(unknown_student["error"]["code"], "not_found");
}

#[test]
fn update_patches_mutable_fields_only() {
    let workspace = temp_dir("warningd-priority-update");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_students(&mut stdin, &mut reader, &workspace);

    let added = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "priority.add",
        json!({
            "studentId": "st-1",
            "priorityLevel": "medium",
            "reasonDescription": "attendance slipping",
            "notes": "check in weekly"
        }),
    );
    let entry_id = added["entry"]["id"].as_str().expect("entry id").to_string();

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "priority.update",
        json!({
            "entryId": entry_id,
            "patch": {
                "priorityLevel": "high",
                "customTags": ["attendance", "family"],
                "notes": null
            }
        }),
    );
    let entry = &updated["entry"];
    assert_eq!(entry["priorityLevel"], "high");
    assert_eq!(entry["customTags"], json!(["attendance", "family"]));
    assert!(entry["notes"].is_null());
    // Untouched fields survive the patch.
    assert_eq!(entry["reasonDescription"], "attendance slipping");
    assert_eq!(entry["sourceType"], "manual");

    let immutable = request(
        &mut stdin,
        &mut reader,
        "3",
        "priority.update",
        json!({ "entryId": entry_id, "patch": { "reasonDescription": "rewritten" } }),
    );
    assert_eq!(immutable["ok"], false);
    assert_eq!(immutable["error"]["code"], "validation_error");

    let unknown_field = request(
        &mut stdin,
        &mut reader,
        "4",
        "priority.update",
        json!({ "entryId": entry_id, "patch": { "studentId": "st-2" } }),
    );
    assert_eq!(unknown_field["error"]["code"], "validation_error");

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "priority.update",
        json!({ "entryId": "no-such-entry", "patch": { "notes": "x" } }),
    );
    assert_eq!(missing["error"]["code"], "not_found");
}

#[test]
fn remove_is_a_soft_delete_and_frees_the_student_slot() {
    let workspace = temp_dir("warningd-priority-remove");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_students(&mut stdin, &mut reader, &workspace);

    let added = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "priority.add",
        json!({ "studentId": "st-1", "priorityLevel": "low", "reasonDescription": "watchlist" }),
    );
    let entry_id = added["entry"]["id"].as_str().expect("entry id").to_string();

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "priority.remove",
        json!({ "entryId": entry_id }),
    );
    assert_eq!(removed["entryId"], entry_id.as_str());
    assert_eq!(removed["isActive"], false);

    // Removing twice is a no-op, not an error.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "priority.remove",
        json!({ "entryId": entry_id }),
    );
    assert_eq!(again["isActive"], false);

    // The default list hides it; includeInactive shows the history.
    let active_only = request_ok(&mut stdin, &mut reader, "4", "priority.list", json!({}));
    assert_eq!(active_only["entries"].as_array().expect("entries").len(), 0);
    let with_history = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "priority.list",
        json!({ "includeInactive": true }),
    );
    let entries = with_history["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["isActive"], false);
    assert!(entries[0]["removedAt"].is_string());

    // A removed entry cannot be edited.
    let edit_removed = request(
        &mut stdin,
        &mut reader,
        "6",
        "priority.update",
        json!({ "entryId": entry_id, "patch": { "notes": "x" } }),
    );
    assert_eq!(edit_removed["error"]["code"], "not_found");

    // The student can be tracked again with a fresh entry.
    let readded = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "priority.add",
        json!({ "studentId": "st-1", "priorityLevel": "medium", "reasonDescription": "back on the list" }),
    );
    assert_ne!(readded["entry"]["id"], entry_id.as_str());
    assert_eq!(readded["entry"]["isActive"], true);
}

#[test]
fn list_scopes_by_student() {
    let workspace = temp_dir("warningd-priority-list");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_students(&mut stdin, &mut reader, &workspace);

    for (id, student, level) in [("1", "st-1", "high"), ("2", "st-2", "low")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "priority.add",
            json!({ "studentId": student, "priorityLevel": level, "reasonDescription": "seeded" }),
        );
    }

    let all = request_ok(&mut stdin, &mut reader, "3", "priority.list", json!({}));
    assert_eq!(all["entries"].as_array().expect("entries").len(), 2);

    let one = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "priority.list",
        json!({ "studentId": "st-2" }),
    );
    let entries = one["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["studentName"], "Blair Osei");
}
