use crate::allocate::{Candidate, ParticipantRole};
use crate::calc::{BaseId, ScoreSubmission};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(HandlerErr::new("bad_params", format!("missing {}", key))),
    }
}

pub fn optional_str(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn ensure_assessment(conn: &Connection, assessment_id: &str) -> Result<(), HandlerErr> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM assessments WHERE id = ?",
            [assessment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "assessment not found")
            .with_details(json!({ "assessmentId": assessment_id })));
    }
    Ok(())
}

/// Returns the owning assessment id of a participant.
pub fn participant_assessment(conn: &Connection, participant_id: &str) -> Result<String, HandlerErr> {
    let assessment_id: Option<String> = conn
        .query_row(
            "SELECT assessment_id FROM participants WHERE id = ?",
            [participant_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    assessment_id.ok_or_else(|| {
        HandlerErr::new("not_found", "participant not found")
            .with_details(json!({ "participantId": participant_id }))
    })
}

pub fn load_candidates(conn: &Connection, assessment_id: &str) -> Result<Vec<Candidate>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, role FROM participants
             WHERE assessment_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::db_query)?;
    stmt.query_map([assessment_id], |r| {
        Ok(Candidate::new(
            r.get::<_, String>(0)?,
            ParticipantRole::from_flag(r.get(1)?),
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

pub fn load_base_ids(conn: &Connection, assessment_id: &str) -> Result<Vec<BaseId>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM bases WHERE assessment_id = ? ORDER BY sort_order, id")
        .map_err(HandlerErr::db_query)?;
    stmt.query_map([assessment_id], |r| r.get::<_, i64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)
}

/// Stored submissions: one row per (rater, participant, base) after upserts.
pub fn load_submissions(
    conn: &Connection,
    assessment_id: &str,
) -> Result<Vec<ScoreSubmission>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT rater_id, participant_id, base_id, score1, score2, score3
             FROM score_submissions
             WHERE assessment_id = ?
             ORDER BY participant_id, base_id, rater_id",
        )
        .map_err(HandlerErr::db_query)?;
    stmt.query_map([assessment_id], |r| {
        Ok(ScoreSubmission {
            rater_id: r.get(0)?,
            participant_id: r.get(1)?,
            base_id: r.get(2)?,
            scores: [r.get(3)?, r.get(4)?, r.get(5)?],
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

pub fn respond(req: &Request, result: Result<serde_json::Value, HandlerErr>) -> serde_json::Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::warn!(id = %req.id, method = %req.method, code = e.code, "request failed");
            e.response(&req.id)
        }
    }
}
