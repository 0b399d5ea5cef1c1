use crate::calc::SUB_SCORES_PER_BASE;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{ensure_assessment, require_db, required_str, respond};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn bases_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, criterion1, criterion2, criterion3, sort_order
             FROM bases
             WHERE assessment_id = ?
             ORDER BY sort_order, id",
        )
        .map_err(HandlerErr::db_query)?;
    let bases = stmt
        .query_map([&assessment_id], |r| {
            let c1: String = r.get(2)?;
            let c2: String = r.get(3)?;
            let c3: String = r.get(4)?;
            Ok(json!({
                "baseId": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "criteria": [c1, c2, c3],
                "sortOrder": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "bases": bases }))
}

fn bases_upsert(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;

    let base_id = req
        .params
        .get("baseId")
        .and_then(|v| v.as_i64())
        .filter(|n| *n >= 1)
        .ok_or_else(|| HandlerErr::new("bad_params", "baseId must be a positive integer"))?;
    let name = required_str(req, "name")?;
    let criteria: Vec<String> = req
        .params
        .get("criteria")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|c| c.as_str().map(|s| s.trim().to_string()).unwrap_or_default())
                .collect()
        })
        .unwrap_or_default();
    if criteria.len() != SUB_SCORES_PER_BASE || criteria.iter().any(|c| c.is_empty()) {
        return Err(HandlerErr::new(
            "bad_params",
            "criteria must be an array of 3 non-empty strings",
        ));
    }
    let sort_order = req
        .params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(base_id);

    conn.execute(
        "INSERT INTO bases(id, assessment_id, name, criterion1, criterion2, criterion3, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(assessment_id, id) DO UPDATE SET
           name = excluded.name,
           criterion1 = excluded.criterion1,
           criterion2 = excluded.criterion2,
           criterion3 = excluded.criterion3,
           sort_order = excluded.sort_order",
        (
            base_id,
            &assessment_id,
            &name,
            &criteria[0],
            &criteria[1],
            &criteria[2],
            sort_order,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "bases" }))
    })?;
    Ok(json!({ "ok": true, "baseId": base_id, "name": name }))
}

fn bases_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let base_id = req
        .params
        .get("baseId")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing baseId"))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_scores = tx
        .execute(
            "DELETE FROM score_submissions WHERE assessment_id = ? AND base_id = ?",
            (&assessment_id, base_id),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    let removed = tx
        .execute(
            "DELETE FROM bases WHERE assessment_id = ? AND id = ?",
            (&assessment_id, base_id),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if removed == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr::new("not_found", "base not found"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "removedScores": removed_scores }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "bases.list" => bases_list(state, req),
        "bases.upsert" => bases_upsert(state, req),
        "bases.delete" => bases_delete(state, req),
        _ => return None,
    };
    Some(respond(req, resp))
}
