use crate::allocate::ParticipantRole;
use crate::calc::{self, BaseId, Status, Thresholds};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    ensure_assessment, load_base_ids, load_submissions, require_db, required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub struct ResultFilters {
    pub group_id: Option<String>,
    pub status: Option<Status>,
}

pub fn parse_result_filters(raw: Option<&serde_json::Value>) -> Result<ResultFilters, HandlerErr> {
    let Some(raw) = raw else {
        return Ok(ResultFilters::default());
    };
    if raw.is_null() {
        return Ok(ResultFilters::default());
    }
    let Some(obj) = raw.as_object() else {
        return Err(HandlerErr::new("bad_params", "filters must be an object"));
    };

    let group_id = match obj.get("groupId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "filters.groupId must be string or null",
                ))
            }
        },
    };

    let status = match obj.get("status") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v)
            if v.as_str()
                .map(|s| s.eq_ignore_ascii_case("ALL"))
                .unwrap_or(false) =>
        {
            None
        }
        Some(v) => {
            let parsed = v.as_str().and_then(Status::parse);
            let Some(st) = parsed else {
                return Err(HandlerErr::new("bad_params", "filters.status is not a known status")
                    .with_details(json!({ "status": v })));
            };
            Some(st)
        }
    };

    Ok(ResultFilters { group_id, status })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseResult {
    pub base_id: BaseId,
    pub base_name: Option<String>,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub participant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub role: ParticipantRole,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub sort_order: i64,
    pub per_base: Vec<BaseResult>,
    pub overall_average: Option<f64>,
    pub status: Status,
    pub status_label: &'static str,
    pub submission_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsModel {
    pub assessment_id: String,
    pub thresholds: Thresholds,
    pub rows: Vec<ResultRow>,
}

struct ParticipantInfo {
    id: String,
    name: String,
    email: Option<String>,
    role: ParticipantRole,
    group_id: Option<String>,
    group_name: Option<String>,
    sort_order: i64,
}

/// Aggregates the stored (post-upsert) submissions of one assessment into
/// per-participant results, ordered by participant sort order.
pub fn compute_results(
    conn: &Connection,
    assessment_id: &str,
    filters: &ResultFilters,
) -> Result<ResultsModel, HandlerErr> {
    ensure_assessment(conn, assessment_id)?;
    let thresholds = setup::load_thresholds(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.name, p.email, p.role, p.group_id, g.name, p.sort_order
             FROM participants p
             LEFT JOIN participant_groups g ON g.id = p.group_id
             WHERE p.assessment_id = ?
             ORDER BY p.sort_order",
        )
        .map_err(HandlerErr::db_query)?;
    let participants: Vec<ParticipantInfo> = stmt
        .query_map([assessment_id], |r| {
            Ok(ParticipantInfo {
                id: r.get(0)?,
                name: r.get(1)?,
                email: r.get(2)?,
                role: ParticipantRole::from_flag(r.get(3)?),
                group_id: r.get(4)?,
                group_name: r.get(5)?,
                sort_order: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let base_ids = load_base_ids(conn, assessment_id)?;
    let base_names: HashMap<BaseId, String> = {
        let mut stmt = conn
            .prepare("SELECT id, name FROM bases WHERE assessment_id = ?")
            .map_err(HandlerErr::db_query)?;
        let pairs = stmt
            .query_map([assessment_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db_query)?;
        pairs.into_iter().collect()
    };

    let submissions = load_submissions(conn, assessment_id)?;
    let mut submission_counts: HashMap<&str, usize> = HashMap::new();
    for s in &submissions {
        *submission_counts.entry(s.participant_id.as_str()).or_default() += 1;
    }

    let aggregates = calc::aggregate_for(
        participants.iter().map(|p| p.id.as_str()),
        &submissions,
        &base_ids,
        &thresholds,
    )?;

    let mut rows = Vec::with_capacity(participants.len());
    for p in &participants {
        let Some(agg) = aggregates.get(&p.id) else {
            continue;
        };
        if let Some(gid) = filters.group_id.as_deref() {
            if p.group_id.as_deref() != Some(gid) {
                continue;
            }
        }
        if let Some(st) = filters.status {
            if agg.status != st {
                continue;
            }
        }
        let per_base = agg
            .per_base_average
            .iter()
            .map(|(b, avg)| BaseResult {
                base_id: *b,
                base_name: base_names.get(b).cloned(),
                average: *avg,
            })
            .collect();
        rows.push(ResultRow {
            participant_id: p.id.clone(),
            name: p.name.clone(),
            email: p.email.clone(),
            role: p.role,
            group_id: p.group_id.clone(),
            group_name: p.group_name.clone(),
            sort_order: p.sort_order,
            per_base,
            overall_average: agg.overall_average,
            status: agg.status,
            status_label: agg.status.label(),
            submission_count: submission_counts.get(p.id.as_str()).copied().unwrap_or(0),
        });
    }

    Ok(ResultsModel {
        assessment_id: assessment_id.to_string(),
        thresholds,
        rows,
    })
}

fn results_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let filters = parse_result_filters(req.params.get("filters"))?;
    let model = compute_results(conn, &assessment_id, &filters)?;
    serde_json::to_value(&model).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

fn results_summary(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let model = compute_results(conn, &assessment_id, &ResultFilters::default())?;

    let mut counts: BTreeMap<&'static str, usize> =
        Status::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    for row in &model.rows {
        *counts.entry(row.status.as_str()).or_default() += 1;
    }
    let overall = calc::mean_present(model.rows.iter().map(|r| r.overall_average));
    tracing::info!(
        assessment_id = %assessment_id,
        participants = model.rows.len(),
        "results summarized"
    );
    Ok(json!({
        "assessmentId": assessment_id,
        "participantCount": model.rows.len(),
        "byStatus": counts,
        "meanOverallAverage": overall,
        "thresholds": model.thresholds
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let resp = match req.method.as_str() {
        "results.get" => results_get(state, req),
        "results.summary" => results_summary(state, req),
        _ => return None,
    };
    Some(respond(req, resp))
}
