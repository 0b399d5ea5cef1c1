use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::results::{compute_results, parse_result_filters};
use crate::ipc::types::{AppState, Request};
use crate::roster::csv_quote;
use serde_json::json;
use std::path::PathBuf;

fn fmt_avg(v: Option<f64>) -> String {
    v.map(|x| format!("{:.2}", x)).unwrap_or_default()
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace bundle exported");
    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            // Reopen whatever database is still in place.
            if let Ok(conn) = db::open_db(&workspace_path) {
                state.db = Some(conn);
            }
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": in_path })),
            );
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
        }
        Err(e) => return err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }

    tracing::info!(path = %in_path, "workspace bundle imported");
    ok(
        &req.id,
        json!({
            "ok": true,
            "workspacePath": workspace_path.to_string_lossy(),
            "bundleFormat": import.bundle_format,
            "dbSha256": import.db_sha256
        }),
    )
}

fn handle_exchange_export_results_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let assessment_id = match req.params.get("assessmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing assessmentId", None),
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let filters = match parse_result_filters(req.params.get("filters")) {
        Ok(f) => f,
        Err(e) => return e.response(&req.id),
    };

    let model = match compute_results(conn, &assessment_id, &filters) {
        Ok(m) => m,
        Err(e) => return e.response(&req.id),
    };

    // Base columns follow the first row; every row carries the same base set.
    let base_headers: Vec<(i64, String)> = model
        .rows
        .first()
        .map(|r| {
            r.per_base
                .iter()
                .map(|b| {
                    let label = b
                        .base_name
                        .clone()
                        .unwrap_or_else(|| format!("Base {}", b.base_id));
                    (b.base_id, label)
                })
                .collect()
        })
        .unwrap_or_default();

    let mut csv = String::from("participant_id,name,email,role,group");
    for (_, label) in &base_headers {
        csv.push(',');
        csv.push_str(&csv_quote(label));
    }
    csv.push_str(",overall_average,status\n");

    let rows_exported = model.rows.len();
    for row in &model.rows {
        let role = if row.role.is_distinguished() { "1" } else { "0" };
        csv.push_str(&format!(
            "{},{},{},{},{}",
            csv_quote(&row.participant_id),
            csv_quote(&row.name),
            csv_quote(row.email.as_deref().unwrap_or("")),
            role,
            csv_quote(row.group_name.as_deref().unwrap_or("")),
        ));
        for (base_id, _) in &base_headers {
            let avg = row
                .per_base
                .iter()
                .find(|b| b.base_id == *base_id)
                .and_then(|b| b.average);
            csv.push(',');
            csv.push_str(&fmt_avg(avg));
        }
        csv.push_str(&format!(
            ",{},{}\n",
            fmt_avg(row.overall_average),
            csv_quote(row.status_label)
        ));
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    tracing::info!(path = %out_path, rows = rows_exported, "results exported");
    ok(
        &req.id,
        json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exchange.exportResultsCsv" => Some(handle_exchange_export_results_csv(state, req)),
        _ => None,
    }
}
