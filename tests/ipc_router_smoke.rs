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

fn assert_routed(value: &serde_json::Value, method: &str) {
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradebook-router-smoke");
    let bundle_out = workspace.join("smoke-backup.gbbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let calls: Vec<(&str, serde_json::Value)> = vec![
        ("health", json!({})),
        ("workspace.select", json!({ "path": workspace.to_string_lossy() })),
        ("calc.continuousScore", json!({})),
        ("calc.totalAndGrade", json!({ "continuousScore": 10, "eotScore": 40 })),
        ("calc.subjectResult", json!({ "subjectName": "Smoke" })),
        ("calc.reportCard", json!({ "subjects": [] })),
        ("grading.config.get", json!({})),
        ("grading.config.update", json!({})),
        ("grading.config.reset", json!({})),
        ("promotion.evaluate", json!({})),
        ("promotion.validateReason", json!({ "reason": "" })),
        ("promotion.stage", json!({ "cycleId": "smoke", "students": [] })),
        ("promotion.override", json!({})),
        ("promotion.submit", json!({ "cycleId": "smoke" })),
        ("promotion.list", json!({ "cycleId": "smoke" })),
        ("backup.exportWorkspaceBundle", json!({ "outPath": bundle_out.to_string_lossy() })),
        ("backup.importWorkspaceBundle", json!({ "inPath": bundle_out.to_string_lossy() })),
    ];

    for (i, (method, params)) in calls.into_iter().enumerate() {
        let resp = request(&mut stdin, &mut reader, &i.to_string(), method, params);
        assert_routed(&resp, method);
    }

    let unknown = request(&mut stdin, &mut reader, "x", "fees.ledger", json!({}));
    assert_eq!(unknown["ok"].as_bool(), Some(false));
    assert_eq!(unknown["error"]["code"].as_str(), Some("not_implemented"));

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush garbage");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json response");
    let bad: serde_json::Value = serde_json::from_str(line.trim()).expect("parse");
    assert_eq!(bad["error"]["code"].as_str(), Some("bad_json"));

    let health = request(&mut stdin, &mut reader, "y", "health", json!({}));
    assert_eq!(health["ok"].as_bool(), Some(true));
    assert!(health["result"]["workspacePath"].as_str().is_some());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn workspace_open_failure_reports_a_single_line_message() {
    let dir = temp_dir("gradebook-router-open-fail");
    let not_a_dir = dir.join("occupied");
    std::fs::write(&not_a_dir, b"plain file").expect("write file");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": not_a_dir.to_string_lossy() }),
    );
    assert_eq!(resp["error"]["code"].as_str(), Some("db_open_failed"));
    let message = resp["error"]["message"].as_str().unwrap_or("");
    assert!(!message.is_empty());
    assert!(!message.contains('\n'), "{}", message);
    assert!(!message.contains("backtrace"), "{}", message);

    let health = request(&mut stdin, &mut reader, "2", "health", json!({}));
    assert!(health["result"]["workspacePath"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}
