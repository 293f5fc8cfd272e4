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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
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
fn grading_config_persists_and_drives_calculations() {
    let workspace = temp_dir("gradebook-config");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "grading.config.get", json!({}));
    assert_eq!(defaults["projectMax"].as_f64(), Some(10.0));
    assert_eq!(defaults["passThreshold"].as_f64(), Some(50.0));
    assert_eq!(defaults["eligibilityRule"]["kind"].as_str(), Some("allSubjects"));
    assert_eq!(defaults["gradeBands"].as_array().map(|b| b.len()), Some(6));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grading.config.update",
        json!({
            "passThreshold": 40,
            "gradeBands": [
                { "minScore": 0, "maxScore": 39, "letter": "U", "descriptor": "Ungraded" },
                { "minScore": 40, "maxScore": 74, "letter": "P", "descriptor": "Pass" },
                { "minScore": 75, "maxScore": 100, "letter": "D", "descriptor": "Distinction" }
            ]
        }),
    );
    assert_eq!(updated["passThreshold"].as_f64(), Some(40.0));
    assert_eq!(updated["projectMax"].as_f64(), Some(10.0));

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calc.totalAndGrade",
        json!({ "continuousScore": 16.0, "eotScore": 70 }),
    );
    assert_eq!(graded["grade"].as_str(), Some("D"));
    assert_eq!(graded["descriptor"].as_str(), Some("Distinction"));

    let evaluated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "promotion.evaluate",
        json!({
            "studentId": "s1",
            "currentClassId": "S1",
            "suggestedClassId": "S2",
            "subjects": [{ "subjectName": "Chemistry", "total": 42 }]
        }),
    );
    assert_eq!(evaluated["qualifiesForPromotion"].as_bool(), Some(true));

    let overlapping = request(
        &mut stdin,
        &mut reader,
        "6",
        "grading.config.update",
        json!({
            "gradeBands": [
                { "minScore": 0, "maxScore": 60, "letter": "U", "descriptor": "Ungraded" },
                { "minScore": 50, "maxScore": 100, "letter": "P", "descriptor": "Pass" }
            ]
        }),
    );
    assert_eq!(overlapping["ok"].as_bool(), Some(false));
    assert_eq!(overlapping["error"]["code"].as_str(), Some("validation_error"));

    let bad_rule = request(
        &mut stdin,
        &mut reader,
        "7",
        "grading.config.update",
        json!({ "eligibilityRule": { "kind": "minimumPassed", "count": 0 } }),
    );
    assert_eq!(bad_rule["error"]["code"].as_str(), Some("validation_error"));

    drop(stdin);
    let _ = child.wait();

    // A fresh process on the same workspace sees the stored config.
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reloaded = request_ok(&mut stdin, &mut reader, "2", "grading.config.get", json!({}));
    assert_eq!(reloaded["passThreshold"].as_f64(), Some(40.0));
    assert_eq!(reloaded["gradeBands"][2]["letter"].as_str(), Some("D"));

    let reset = request_ok(&mut stdin, &mut reader, "3", "grading.config.reset", json!({}));
    assert_eq!(reset["passThreshold"].as_f64(), Some(50.0));
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "calc.totalAndGrade",
        json!({ "continuousScore": 16.0, "eotScore": 70 }),
    );
    assert_eq!(after["grade"].as_str(), Some("A"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn config_methods_require_a_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "grading.config.get", json!({}));
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("no_workspace"));
    drop(stdin);
    let _ = child.wait();
}
