use crate::calc::{self, SUB_SCORES_PER_BASE};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    ensure_assessment, optional_str, participant_assessment, require_db, required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn parse_sub_scores(raw: Option<&serde_json::Value>) -> Result<[Option<f64>; 3], HandlerErr> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "scores must be an array of 3 values"));
    };
    if arr.len() != SUB_SCORES_PER_BASE {
        return Err(HandlerErr::new("bad_params", "scores must be an array of 3 values")
            .with_details(json!({ "count": arr.len() })));
    }
    let mut out = [None; SUB_SCORES_PER_BASE];
    for (i, v) in arr.iter().enumerate() {
        if v.is_null() {
            continue;
        }
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr::new("bad_params", "each score must be a number or null")
                .with_details(json!({ "index": i })));
        };
        calc::validate_sub_score(&format!("score{}", i + 1), n)?;
        out[i] = Some(n);
    }
    Ok(out)
}

fn scores_submit(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let rater_id = required_str(req, "raterId")?;
    let participant_id = required_str(req, "participantId")?;
    let base_id = req
        .params
        .get("baseId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing baseId"))?;
    let scores = parse_sub_scores(req.params.get("scores"))?;

    ensure_assessment(conn, &assessment_id)?;
    if participant_assessment(conn, &participant_id)? != assessment_id {
        return Err(HandlerErr::new(
            "bad_params",
            "participant belongs to a different assessment",
        ));
    }
    let base_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM bases WHERE assessment_id = ? AND id = ?",
            (&assessment_id, base_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if base_exists.is_none() {
        return Err(HandlerErr::new("not_found", "base not found")
            .with_details(json!({ "baseId": base_id })));
    }

    let previous: Option<String> = conn
        .query_row(
            "SELECT id FROM score_submissions
             WHERE rater_id = ? AND participant_id = ? AND base_id = ?",
            (&rater_id, &participant_id, base_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;

    // One row per (rater, participant, base): a resubmission replaces the scores.
    conn.execute(
        "INSERT INTO score_submissions(id, assessment_id, rater_id, participant_id, base_id, score1, score2, score3, submitted_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(rater_id, participant_id, base_id) DO UPDATE SET
           score1 = excluded.score1,
           score2 = excluded.score2,
           score3 = excluded.score3,
           submitted_at = excluded.submitted_at",
        (
            Uuid::new_v4().to_string(),
            &assessment_id,
            &rater_id,
            &participant_id,
            base_id,
            scores[0],
            scores[1],
            scores[2],
            db::now_timestamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "score_submissions" }))
    })?;

    tracing::debug!(
        rater_id = %rater_id,
        participant_id = %participant_id,
        base_id,
        updated = previous.is_some(),
        "score submitted"
    );
    Ok(json!({
        "ok": true,
        "updated": previous.is_some(),
        "baseAverage": calc::mean_present(scores)
    }))
}

fn scores_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;
    let rater_filter = optional_str(&req.params, "raterId");
    let participant_filter = optional_str(&req.params, "participantId");

    let mut stmt = conn
        .prepare(
            "SELECT s.rater_id, s.participant_id, p.name, s.base_id, s.score1, s.score2, s.score3, s.submitted_at
             FROM score_submissions s
             JOIN participants p ON p.id = s.participant_id
             WHERE s.assessment_id = ?1
               AND (?2 IS NULL OR s.rater_id = ?2)
               AND (?3 IS NULL OR s.participant_id = ?3)
             ORDER BY p.sort_order, s.base_id, s.rater_id",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&assessment_id, &rater_filter, &participant_filter), |r| {
            let s1: Option<f64> = r.get(4)?;
            let s2: Option<f64> = r.get(5)?;
            let s3: Option<f64> = r.get(6)?;
            Ok(json!({
                "raterId": r.get::<_, String>(0)?,
                "participantId": r.get::<_, String>(1)?,
                "participantName": r.get::<_, String>(2)?,
                "baseId": r.get::<_, i64>(3)?,
                "scores": [s1, s2, s3],
                "submittedAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "submissions": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "scores.submit" => scores_submit(state, req),
        "scores.list" => scores_list(state, req),
        _ => return None,
    };
    Some(respond(req, resp))
}
