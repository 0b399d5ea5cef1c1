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
    let exe = env!("CARGO_BIN_EXE_evald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evald");
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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn seeded_overall(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        "seed",
        "assessments.create",
        json!({ "name": "Thresholds" }),
    );
    let assessment_id = created
        .get("assessmentId")
        .and_then(|v| v.as_str())
        .expect("assessmentId")
        .to_string();
    for base_id in [1, 2] {
        request_ok(
            stdin,
            reader,
            &format!("base-{}", base_id),
            "bases.upsert",
            json!({
                "assessmentId": assessment_id,
                "baseId": base_id,
                "name": format!("Base {}", base_id),
                "criteria": ["A", "B", "C"]
            }),
        );
    }
    let p = request_ok(
        stdin,
        reader,
        "p",
        "participants.create",
        json!({ "assessmentId": assessment_id, "name": "Ana" }),
    );
    let participant_id = p
        .get("participantId")
        .and_then(|v| v.as_str())
        .expect("participantId")
        .to_string();
    // Overall 13/3.
    for (base_id, scores) in [(1, json!([4, 4, 4])), (2, json!([5, 5, 4]))] {
        request_ok(
            stdin,
            reader,
            &format!("score-{}", base_id),
            "scores.submit",
            json!({
                "assessmentId": assessment_id,
                "raterId": "r1",
                "participantId": participant_id,
                "baseId": base_id,
                "scores": scores
            }),
        );
    }
    assessment_id
}

fn first_status(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    assessment_id: &str,
) -> String {
    let results = request_ok(
        stdin,
        reader,
        id,
        "results.get",
        json!({ "assessmentId": assessment_id }),
    );
    results
        .get("rows")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|r| r.get("status"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn setup_get_returns_defaults() {
    let workspace = temp_dir("evald-setup-defaults");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        setup.get("allocation"),
        Some(&json!({ "defaultGroupCount": 4, "balancePolicy": "smallestFirst" }))
    );
    let classification = setup.get("classification").expect("classification");
    assert_eq!(
        classification.get("passesToGroup").and_then(|v| v.as_f64()),
        Some(4.7)
    );
    assert_eq!(
        classification.get("passesToInterview").and_then(|v| v.as_f64()),
        Some(4.0)
    );
    assert_eq!(
        classification.get("passesToDiscussion").and_then(|v| v.as_f64()),
        Some(3.599)
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn classification_override_changes_status_and_reset_restores_it() {
    let workspace = temp_dir("evald-setup-classification");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let assessment_id = seeded_overall(&mut stdin, &mut reader);
    assert_eq!(
        first_status(&mut stdin, &mut reader, "2", &assessment_id),
        "passesToInterview"
    );

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "classification", "patch": { "passesToInterview": 4.5 } }),
    );
    assert_eq!(
        updated
            .get("values")
            .and_then(|v| v.get("passesToInterview"))
            .and_then(|v| v.as_f64()),
        Some(4.5)
    );
    assert_eq!(
        first_status(&mut stdin, &mut reader, "4", &assessment_id),
        "passesToDiscussion"
    );

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "results.get",
        json!({ "assessmentId": assessment_id }),
    );
    assert_eq!(
        results
            .get("thresholds")
            .and_then(|t| t.get("passesToInterview"))
            .and_then(|v| v.as_f64()),
        Some(4.5)
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.reset",
        json!({ "section": "classification" }),
    );
    assert_eq!(
        first_status(&mut stdin, &mut reader, "7", &assessment_id),
        "passesToInterview"
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn invalid_threshold_patches_are_rejected() {
    let workspace = temp_dir("evald-setup-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bad_patches = [
        json!({ "passesToDiscussion": 4.5 }),
        json!({ "passesToGroup": 5.5 }),
        json!({ "passesToInterview": "high" }),
        json!({ "passesToNowhere": 3.0 }),
    ];
    for (i, patch) in bad_patches.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("bad-{}", i),
            "setup.update",
            json!({ "section": "classification", "patch": patch }),
        );
        assert_eq!(error_code(&resp), "bad_params", "{}", resp);
    }

    let resp = request(
        &mut stdin,
        &mut reader,
        "alloc",
        "setup.update",
        json!({ "section": "allocation", "patch": { "defaultGroupCount": 11 } }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "section",
        "setup.update",
        json!({ "section": "planner", "patch": {} }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    // Nothing was persisted by the rejected patches.
    let setup = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        setup
            .get("classification")
            .and_then(|c| c.get("passesToDiscussion"))
            .and_then(|v| v.as_f64()),
        Some(3.599)
    );

    drop(stdin);
    let _ = child.wait();
}
