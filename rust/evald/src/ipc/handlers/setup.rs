use crate::allocate::{BalancePolicy, MAX_GROUP_COUNT};
use crate::calc::Thresholds;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Allocation,
    Classification,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "allocation" => Some(Self::Allocation),
            "classification" => Some(Self::Classification),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Allocation => "setup.allocation",
            Self::Classification => "setup.classification",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Allocation => json!({
            "defaultGroupCount": 4,
            "balancePolicy": BalancePolicy::default().as_str()
        }),
        SetupSection::Classification => {
            let t = Thresholds::default();
            json!({
                "passesToGroup": t.passes_to_group,
                "passesToInterview": t.passes_to_interview,
                "passesToDiscussion": t.passes_to_discussion
            })
        }
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Allocation => match k.as_str() {
                "defaultGroupCount" => {
                    let n = parse_i64_range(v, k, 1, MAX_GROUP_COUNT as i64)?;
                    obj.insert(k.clone(), json!(n));
                }
                "balancePolicy" => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be string", k))?;
                    let policy = BalancePolicy::parse(s)
                        .ok_or_else(|| format!("{} must be smallestFirst or roundRobin", k))?;
                    obj.insert(k.clone(), json!(policy.as_str()));
                }
                _ => return Err(format!("unknown allocation field: {}", k)),
            },
            SetupSection::Classification => match k.as_str() {
                "passesToGroup" | "passesToInterview" | "passesToDiscussion" => {
                    let n = parse_f64_range(v, k, 1.0, 5.0)?;
                    obj.insert(k.clone(), json!(n));
                }
                _ => return Err(format!("unknown classification field: {}", k)),
            },
        }
    }
    if let SetupSection::Classification = section {
        thresholds_from_value(current)?.validate()?;
    }
    Ok(())
}

fn thresholds_from_value(v: &Value) -> Result<Thresholds, String> {
    let get = |key: &str| {
        v.get(key)
            .and_then(|x| x.as_f64())
            .ok_or_else(|| format!("{} must be a number", key))
    };
    Ok(Thresholds {
        passes_to_group: get("passesToGroup")?,
        passes_to_interview: get("passesToInterview")?,
        passes_to_discussion: get("passesToDiscussion")?,
    })
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed saved values fall back to the defaults rather than blocking.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone, Copy)]
pub struct AllocationDefaults {
    pub default_group_count: usize,
    pub balance_policy: BalancePolicy,
}

pub fn load_allocation(conn: &rusqlite::Connection) -> anyhow::Result<AllocationDefaults> {
    let v = load_section(conn, SetupSection::Allocation)?;
    Ok(AllocationDefaults {
        default_group_count: v
            .get("defaultGroupCount")
            .and_then(|x| x.as_u64())
            .map(|n| n as usize)
            .unwrap_or(4),
        balance_policy: v
            .get("balancePolicy")
            .and_then(|x| x.as_str())
            .and_then(BalancePolicy::parse)
            .unwrap_or_default(),
    })
}

pub fn load_thresholds(conn: &rusqlite::Connection) -> anyhow::Result<Thresholds> {
    let v = load_section(conn, SetupSection::Classification)?;
    Ok(thresholds_from_value(&v).unwrap_or_default())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let allocation = match load_section(conn, SetupSection::Allocation) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classification = match load_section(conn, SetupSection::Classification) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "allocation": allocation,
            "classification": classification
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.key(), "setup updated");
    ok(
        &req.id,
        json!({ "ok": true, "section": section_raw, "values": current }),
    )
}

fn handle_setup_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section) = req
        .params
        .get("section")
        .and_then(|v| v.as_str())
        .and_then(SetupSection::parse)
    else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    if let Err(e) = conn.execute("DELETE FROM settings WHERE key = ?", [section.key()]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        "setup.reset" => Some(handle_setup_reset(state, req)),
        _ => None,
    }
}
