use crate::allocate::ParticipantRole;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    ensure_assessment, optional_str, participant_assessment, require_db, required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Role values arrive as booleans, 0/1 numbers, or the roster string forms.
fn parse_role_value(v: &serde_json::Value) -> Option<ParticipantRole> {
    if let Some(b) = v.as_bool() {
        return Some(if b {
            ParticipantRole::Distinguished
        } else {
            ParticipantRole::Ordinary
        });
    }
    if let Some(n) = v.as_i64() {
        return match n {
            0 => Some(ParticipantRole::Ordinary),
            1 => Some(ParticipantRole::Distinguished),
            _ => None,
        };
    }
    v.as_str().and_then(roster::parse_role)
}

fn validate_email(email: &str) -> Result<(), HandlerErr> {
    if !roster::is_valid_email(email) {
        return Err(HandlerErr::new("bad_params", "email is not valid")
            .with_details(json!({ "email": email })));
    }
    Ok(())
}

fn next_sort_order(conn: &Connection, assessment_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM participants WHERE assessment_id = ?",
        [assessment_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db_query)
}

fn insert_participant(
    conn: &Connection,
    assessment_id: &str,
    name: &str,
    email: Option<&str>,
    photo_ref: Option<&str>,
    role: ParticipantRole,
) -> Result<String, HandlerErr> {
    let participant_id = Uuid::new_v4().to_string();
    let sort_order = next_sort_order(conn, assessment_id)?;
    conn.execute(
        "INSERT INTO participants(id, assessment_id, name, email, photo_ref, role, group_id, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?, NULL, ?, ?)",
        (
            &participant_id,
            assessment_id,
            name,
            email,
            photo_ref,
            role.as_flag(),
            sort_order,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "participants" }))
    })?;
    Ok(participant_id)
}

fn participants_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;
    let group_filter = optional_str(&req.params, "groupId");

    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.name, p.email, p.photo_ref, p.role, p.group_id, g.name, p.sort_order
             FROM participants p
             LEFT JOIN participant_groups g ON g.id = p.group_id
             WHERE p.assessment_id = ?1 AND (?2 IS NULL OR p.group_id = ?2)
             ORDER BY p.sort_order",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&assessment_id, &group_filter), |r| {
            let role = ParticipantRole::from_flag(r.get(4)?);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, Option<String>>(2)?,
                "photoRef": r.get::<_, Option<String>>(3)?,
                "role": role,
                "distinguished": role.is_distinguished(),
                "groupId": r.get::<_, Option<String>>(5)?,
                "groupName": r.get::<_, Option<String>>(6)?,
                "sortOrder": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "participants": rows }))
}

fn participants_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let name = required_str(req, "name")?;
    ensure_assessment(conn, &assessment_id)?;

    let email = optional_str(&req.params, "email");
    if let Some(e) = email.as_deref() {
        validate_email(e)?;
    }
    let photo_ref = optional_str(&req.params, "photoRef");
    let role = match req.params.get("role") {
        None => ParticipantRole::Ordinary,
        Some(v) if v.is_null() => ParticipantRole::Ordinary,
        Some(v) => parse_role_value(v).ok_or_else(|| {
            HandlerErr::new("bad_params", "role must be ordinary or distinguished")
                .with_details(json!({ "role": v }))
        })?,
    };

    let participant_id = insert_participant(
        conn,
        &assessment_id,
        &name,
        email.as_deref(),
        photo_ref.as_deref(),
        role,
    )?;
    Ok(json!({ "participantId": participant_id, "name": name, "role": role }))
}

fn participants_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let participant_id = required_str(req, "participantId")?;
    participant_assessment(conn, &participant_id)?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "patch must be an object"));
    };

    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let name = v.as_str().map(|s| s.trim()).unwrap_or("");
                if name.is_empty() {
                    return Err(HandlerErr::new("bad_params", "name must not be empty"));
                }
                sets.push("name = ?");
                values.push(name.to_string().into());
            }
            "email" => {
                let email = v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
                if let Some(e) = email.as_deref() {
                    validate_email(e)?;
                }
                sets.push("email = ?");
                values.push(email.map_or(rusqlite::types::Value::Null, Into::into));
            }
            "photoRef" => {
                let photo = v.as_str().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
                sets.push("photo_ref = ?");
                values.push(photo.map_or(rusqlite::types::Value::Null, Into::into));
            }
            "role" => {
                let role = parse_role_value(v).ok_or_else(|| {
                    HandlerErr::new("bad_params", "role must be ordinary or distinguished")
                })?;
                sets.push("role = ?");
                values.push(role.as_flag().into());
            }
            other => {
                return Err(HandlerErr::new("bad_params", format!("unknown field: {}", other)));
            }
        }
    }
    if sets.is_empty() {
        return Ok(json!({ "ok": true, "changed": 0 }));
    }

    values.push(participant_id.clone().into());
    let sql = format!("UPDATE participants SET {} WHERE id = ?", sets.join(", "));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "changed": changed }))
}

fn participants_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let participant_id = required_str(req, "participantId")?;
    participant_assessment(conn, &participant_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_scores = tx
        .execute(
            "DELETE FROM score_submissions WHERE participant_id = ?",
            [&participant_id],
        )
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "score_submissions" }))
        })?;
    tx.execute("DELETE FROM participants WHERE id = ?", [&participant_id])
        .map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": "participants" }))
        })?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "removedScores": removed_scores }))
}

fn participants_assign_group(
    state: &AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let participant_id = required_str(req, "participantId")?;
    let assessment_id = participant_assessment(conn, &participant_id)?;

    let group_id = match req.params.get("groupId") {
        None => return Err(HandlerErr::new("bad_params", "missing groupId (use null to unassign)")),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return Err(HandlerErr::new("bad_params", "groupId must be string or null")),
        },
    };

    if let Some(gid) = group_id.as_deref() {
        let owner: Option<String> = conn
            .query_row(
                "SELECT assessment_id FROM participant_groups WHERE id = ?",
                [gid],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?;
        match owner {
            None => {
                return Err(HandlerErr::new("not_found", "group not found")
                    .with_details(json!({ "groupId": gid })))
            }
            Some(a) if a != assessment_id => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "group belongs to a different assessment",
                ))
            }
            Some(_) => {}
        }
    }

    conn.execute(
        "UPDATE participants SET group_id = ? WHERE id = ?",
        (&group_id, &participant_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "participantId": participant_id, "groupId": group_id }))
}

fn participants_import_csv(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let in_path = required_str(req, "inPath")?;
    ensure_assessment(conn, &assessment_id)?;

    let text = std::fs::read_to_string(&in_path).map_err(|e| {
        HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": in_path }))
    })?;
    let (rows, warnings) = roster::parse_roster(&text);

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut created = 0usize;
    let mut distinguished = 0usize;
    for row in &rows {
        insert_participant(
            &tx,
            &assessment_id,
            &row.name,
            row.email.as_deref(),
            row.photo_ref.as_deref(),
            row.role,
        )?;
        created += 1;
        if row.role.is_distinguished() {
            distinguished += 1;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        assessment_id = %assessment_id,
        created,
        skipped = warnings.len(),
        "roster imported"
    );
    let warnings_json: Vec<serde_json::Value> = warnings
        .iter()
        .map(|w| json!({ "line": w.line, "code": w.code, "message": w.message }))
        .collect();
    Ok(json!({
        "ok": true,
        "created": created,
        "distinguished": distinguished,
        "skipped": warnings.len(),
        "warnings": warnings_json
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "participants.list" => participants_list(state, req),
        "participants.create" => participants_create(state, req),
        "participants.update" => participants_update(state, req),
        "participants.delete" => participants_delete(state, req),
        "participants.assignGroup" => participants_assign_group(state, req),
        "participants.importCsv" => participants_import_csv(state, req),
        _ => return None,
    };
    Some(respond(req, resp))
}
