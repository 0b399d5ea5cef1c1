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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

struct Fixture {
    assessment_id: String,
    participant_ids: Vec<String>,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, names: &[&str]) -> Fixture {
    let created = request_ok(
        stdin,
        reader,
        "seed",
        "assessments.create",
        json!({ "name": "Results" }),
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
                "criteria": ["Teamwork", "Leadership", "Communication"]
            }),
        );
    }
    let mut participant_ids = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let p = request_ok(
            stdin,
            reader,
            &format!("p-{}", i),
            "participants.create",
            json!({ "assessmentId": assessment_id, "name": name }),
        );
        participant_ids.push(
            p.get("participantId")
                .and_then(|v| v.as_str())
                .expect("participantId")
                .to_string(),
        );
    }
    Fixture {
        assessment_id,
        participant_ids,
    }
}

fn submit(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    fx: &Fixture,
    rater: &str,
    participant: usize,
    base_id: i64,
    scores: serde_json::Value,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "scores.submit",
        json!({
            "assessmentId": fx.assessment_id,
            "raterId": rater,
            "participantId": fx.participant_ids[participant],
            "baseId": base_id,
            "scores": scores
        }),
    )
}

fn row_for<'a>(results: &'a serde_json::Value, participant_id: &str) -> &'a serde_json::Value {
    results
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .iter()
        .find(|r| r.get("participantId").and_then(|v| v.as_str()) == Some(participant_id))
        .expect("participant row")
}

#[test]
fn averages_across_raters_and_bases_drive_status() {
    let workspace = temp_dir("evald-results-status");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader, &["Ana", "Bruno", "Carla", "Diego"]);

    // Ana: base 1 from two raters -> 4.0, base 2 -> 14/3, overall 13/3.
    submit(&mut stdin, &mut reader, "s1", &fx, "r1", 0, 1, json!([4, 5, 3]));
    submit(&mut stdin, &mut reader, "s2", &fx, "r2", 0, 1, json!([4, 4, 4]));
    let s3 = submit(&mut stdin, &mut reader, "s3", &fx, "r1", 0, 2, json!([5, 5, 4]));
    assert!(approx(
        s3.get("baseAverage").and_then(|v| v.as_f64()).expect("baseAverage"),
        14.0 / 3.0
    ));

    // Bruno: a null sub-score is skipped, not counted as zero.
    submit(&mut stdin, &mut reader, "s4", &fx, "r1", 1, 1, json!([5, null, 5]));
    submit(&mut stdin, &mut reader, "s5", &fx, "r1", 1, 2, json!([5, 4.8, null]));

    // Carla: exactly on the lowest passing boundary.
    submit(&mut stdin, &mut reader, "s6", &fx, "r1", 2, 1, json!([3.599, null, null]));

    // Diego: no submissions.

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "results.get",
        json!({ "assessmentId": fx.assessment_id }),
    );

    let ana = row_for(&results, &fx.participant_ids[0]);
    let per_base = ana.get("perBase").and_then(|v| v.as_array()).expect("perBase");
    assert_eq!(per_base.len(), 2);
    assert!(approx(
        per_base[0].get("average").and_then(|v| v.as_f64()).expect("base 1"),
        4.0
    ));
    assert!(approx(
        per_base[1].get("average").and_then(|v| v.as_f64()).expect("base 2"),
        14.0 / 3.0
    ));
    assert!(approx(
        ana.get("overallAverage").and_then(|v| v.as_f64()).expect("overall"),
        13.0 / 3.0
    ));
    assert_eq!(
        ana.get("status").and_then(|v| v.as_str()),
        Some("passesToInterview")
    );
    assert_eq!(
        ana.get("statusLabel").and_then(|v| v.as_str()),
        Some("Passes to interview")
    );
    assert_eq!(ana.get("submissionCount").and_then(|v| v.as_u64()), Some(3));

    let bruno = row_for(&results, &fx.participant_ids[1]);
    assert!(approx(
        bruno.get("overallAverage").and_then(|v| v.as_f64()).expect("overall"),
        4.95
    ));
    assert_eq!(bruno.get("status").and_then(|v| v.as_str()), Some("passesToGroup"));

    let carla = row_for(&results, &fx.participant_ids[2]);
    let carla_bases = carla.get("perBase").and_then(|v| v.as_array()).expect("perBase");
    assert!(carla_bases[1].get("average").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        carla.get("status").and_then(|v| v.as_str()),
        Some("passesToDiscussion")
    );

    let diego = row_for(&results, &fx.participant_ids[3]);
    assert!(diego.get("overallAverage").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(diego.get("status").and_then(|v| v.as_str()), Some("pending"));
    assert_eq!(diego.get("submissionCount").and_then(|v| v.as_u64()), Some(0));

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "results.summary",
        json!({ "assessmentId": fx.assessment_id }),
    );
    let by_status = summary.get("byStatus").expect("byStatus");
    assert_eq!(by_status.get("passesToGroup").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(by_status.get("passesToInterview").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(by_status.get("passesToDiscussion").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(by_status.get("pending").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(by_status.get("fails").and_then(|v| v.as_u64()), Some(0));

    let pending_only = request_ok(
        &mut stdin,
        &mut reader,
        "filter",
        "results.get",
        json!({ "assessmentId": fx.assessment_id, "filters": { "status": "pending" } }),
    );
    let rows = pending_only.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("participantId").and_then(|v| v.as_str()),
        Some(fx.participant_ids[3].as_str())
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn results_csv_export_writes_one_line_per_participant() {
    let workspace = temp_dir("evald-results-csv");
    let out_path = workspace.join("exports").join("results.csv");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = seed(&mut stdin, &mut reader, &["Silva, Ana", "Bruno"]);
    submit(&mut stdin, &mut reader, "s1", &fx, "r1", 0, 1, json!([2, 2, 2]));

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "x",
        "exchange.exportResultsCsv",
        json!({ "assessmentId": fx.assessment_id, "outPath": out_path.to_string_lossy() }),
    );
    assert_eq!(exported.get("rowsExported").and_then(|v| v.as_u64()), Some(2));

    let text = std::fs::read_to_string(&out_path).expect("read csv");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines[0],
        "participant_id,name,email,role,group,Base 1,Base 2,overall_average,status"
    );
    assert_eq!(lines.len(), 3);
    assert!(lines[1].contains("\"Silva, Ana\""));
    assert!(lines[1].ends_with(",2.00,,2.00,Fails"), "{}", lines[1]);
    assert!(lines[2].ends_with(",,,,Pending"), "{}", lines[2]);

    drop(stdin);
    let _ = child.wait();
}
