use crate::allocate::{self, BalancePolicy};
use crate::error::CoreError;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{ensure_assessment, load_candidates, require_db, required_str, respond};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn default_group_name(idx: i64) -> String {
    format!("Group {}", idx + 1)
}

fn group_rows(conn: &Connection, assessment_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT
               g.id,
               g.idx,
               g.name,
               (SELECT COUNT(*) FROM participants p WHERE p.group_id = g.id) AS member_count,
               (SELECT COUNT(*) FROM participants p WHERE p.group_id = g.id AND p.role = 1) AS distinguished_count
             FROM participant_groups g
             WHERE g.assessment_id = ?
             ORDER BY g.idx",
        )
        .map_err(HandlerErr::db_query)?;
    stmt.query_map([assessment_id], |r| {
        Ok(json!({
            "groupId": r.get::<_, String>(0)?,
            "idx": r.get::<_, i64>(1)?,
            "name": r.get::<_, String>(2)?,
            "memberCount": r.get::<_, i64>(3)?,
            "distinguishedCount": r.get::<_, i64>(4)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db_query)
}

fn groups_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;

    let groups = group_rows(conn, &assessment_id)?;
    let unassigned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM participants WHERE assessment_id = ? AND group_id IS NULL",
            [&assessment_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "groups": groups, "unassignedCount": unassigned }))
}

fn groups_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;

    let idx: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM participant_groups WHERE assessment_id = ?",
            [&assessment_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_group_name(idx));

    let group_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO participant_groups(id, assessment_id, idx, name) VALUES(?, ?, ?, ?)",
        (&group_id, &assessment_id, idx, &name),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "participant_groups" }))
    })?;
    Ok(json!({ "groupId": group_id, "idx": idx, "name": name }))
}

fn groups_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let group_id = required_str(req, "groupId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM participant_groups WHERE id = ?",
            [&group_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "group not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let unassigned = tx
        .execute(
            "UPDATE participants SET group_id = NULL WHERE group_id = ?",
            [&group_id],
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.execute("DELETE FROM participant_groups WHERE id = ?", [&group_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "unassigned": unassigned }))
}

/// `groupCount` must be a whole number. Integral floats such as `3.0` are
/// taken as that integer; fractions and non-numbers are rejected.
fn parse_group_count(v: &serde_json::Value) -> Result<usize, CoreError> {
    let count = match (v.as_i64(), v.as_f64()) {
        (Some(n), _) => n,
        (None, Some(f)) if f.is_finite() && f.fract() == 0.0 => f as i64,
        (None, Some(f)) => {
            return Err(CoreError::InvalidGroupCount {
                count: f.trunc() as i64,
                max: allocate::MAX_GROUP_COUNT,
            })
        }
        (None, None) => {
            return Err(CoreError::InvalidGroupCount {
                count: 0,
                max: allocate::MAX_GROUP_COUNT,
            })
        }
    };
    allocate::validate_group_count(count)
}

fn groups_allocate(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    ensure_assessment(conn, &assessment_id)?;

    let defaults = setup::load_allocation(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let group_count = match req.params.get("groupCount") {
        None => defaults.default_group_count,
        Some(v) if v.is_null() => defaults.default_group_count,
        Some(v) => parse_group_count(v)?,
    };
    let policy = match req.params.get("balancePolicy").and_then(|v| v.as_str()) {
        None => defaults.balance_policy,
        Some(s) => BalancePolicy::parse(s).ok_or_else(|| {
            HandlerErr::new("bad_params", "balancePolicy must be smallestFirst or roundRobin")
                .with_details(json!({ "balancePolicy": s }))
        })?,
    };

    let candidates = load_candidates(conn, &assessment_id)?;
    let allocation = allocate::allocate(&candidates, group_count, policy)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut group_ids: Vec<String> = Vec::with_capacity(group_count);
    let mut group_names: Vec<String> = Vec::with_capacity(group_count);
    for idx in 0..group_count as i64 {
        tx.execute(
            "INSERT INTO participant_groups(id, assessment_id, idx, name) VALUES(?, ?, ?, ?)
             ON CONFLICT(assessment_id, idx) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                &assessment_id,
                idx,
                default_group_name(idx),
            ),
        )
        .map_err(|e| {
            HandlerErr::new("db_insert_failed", e.to_string())
                .with_details(json!({ "table": "participant_groups" }))
        })?;
        let (gid, name): (String, String) = tx
            .query_row(
                "SELECT id, name FROM participant_groups WHERE assessment_id = ? AND idx = ?",
                (&assessment_id, idx),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(HandlerErr::db_query)?;
        group_ids.push(gid);
        group_names.push(name);
    }

    {
        let mut update = tx
            .prepare("UPDATE participants SET group_id = ? WHERE id = ?")
            .map_err(HandlerErr::db_query)?;
        for (participant_id, idx) in allocation.assignments() {
            update
                .execute((&group_ids[idx], &participant_id))
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
    }

    // Every participant now points at one of the first `group_count` groups,
    // so higher-indexed groups from an earlier run are empty.
    let removed_groups = tx
        .execute(
            "DELETE FROM participant_groups WHERE assessment_id = ? AND idx >= ?",
            (&assessment_id, group_count as i64),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        assessment_id = %assessment_id,
        participants = candidates.len(),
        group_count,
        policy = policy.as_str(),
        sizes = ?allocation.sizes(),
        "groups allocated"
    );

    let roles: HashMap<&str, bool> = candidates
        .iter()
        .map(|c| (c.id.as_str(), c.role.is_distinguished()))
        .collect();
    let groups: Vec<serde_json::Value> = allocation
        .groups
        .iter()
        .enumerate()
        .map(|(idx, members)| {
            let distinguished = members
                .iter()
                .filter(|id| roles.get(id.as_str()).copied().unwrap_or(false))
                .count();
            json!({
                "groupId": group_ids[idx],
                "idx": idx,
                "name": group_names[idx],
                "memberCount": members.len(),
                "distinguishedCount": distinguished,
                "participantIds": members,
            })
        })
        .collect();

    Ok(json!({
        "ok": true,
        "groupCount": group_count,
        "balancePolicy": policy.as_str(),
        "groups": groups,
        "removedGroups": removed_groups
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "groups.list" => groups_list(state, req),
        "groups.create" => groups_create(state, req),
        "groups.delete" => groups_delete(state, req),
        "groups.allocate" => groups_allocate(state, req),
        _ => return None,
    };
    Some(respond(req, resp))
}
