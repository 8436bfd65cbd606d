use crate::calc::{GroupBy, DEFAULT_THRESHOLD_PERCENT};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Attendance,
    Reports,
    Security,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "reports" => Some(Self::Reports),
            "security" => Some(Self::Security),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "setup.attendance",
            Self::Reports => "setup.reports",
            Self::Security => "setup.security",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "thresholdPercent": DEFAULT_THRESHOLD_PERCENT,
            "periodsPerDay": 7
        }),
        SetupSection::Reports => json!({
            "showGeneratedAt": true,
            "defaultGroupBy": "subject"
        }),
        SetupSection::Security => json!({
            "minPasswordLength": 8
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
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

/// Validates one field of a section and returns its normalized value.
fn validate_field(section: SetupSection, k: &str, v: &Value) -> Result<Value, String> {
    match section {
        SetupSection::Attendance => match k {
            "thresholdPercent" => Ok(Value::from(parse_f64_range(v, k, 1.0, 100.0)?)),
            "periodsPerDay" => Ok(Value::from(parse_i64_range(v, k, 1, 12)?)),
            _ => Err(format!("unknown attendance field: {}", k)),
        },
        SetupSection::Reports => match k {
            "showGeneratedAt" => Ok(Value::Bool(parse_bool(v, k)?)),
            "defaultGroupBy" => {
                let g = v
                    .as_str()
                    .and_then(GroupBy::parse)
                    .ok_or_else(|| "defaultGroupBy must be one of: subject, none".to_string())?;
                Ok(Value::String(g.as_str().to_string()))
            }
            _ => Err(format!("unknown reports field: {}", k)),
        },
        SetupSection::Security => match k {
            "minPasswordLength" => Ok(Value::from(parse_i64_range(v, k, 6, 128)?)),
            _ => Err(format!("unknown security field: {}", k)),
        },
    }
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        obj.insert(k.clone(), validate_field(section, k, v)?);
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    let Some(saved) = db::settings_get_json(conn, section.key())? else {
        return Ok(current);
    };
    let Some(saved_obj) = saved.as_object() else {
        tracing::warn!(section = section.key(), "stored settings are not an object");
        return Ok(current);
    };
    // Each malformed stored field falls back to its default on its own.
    if let Some(obj) = current.as_object_mut() {
        for (k, v) in saved_obj {
            match validate_field(section, k, v) {
                Ok(value) => {
                    obj.insert(k.clone(), value);
                }
                Err(msg) => {
                    tracing::warn!(
                        section = section.key(),
                        field = %k,
                        %msg,
                        "ignoring stored setting"
                    );
                }
            }
        }
    }
    Ok(current)
}

/// Effective settings read by the attendance, report and auth handlers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub threshold_percent: f64,
    pub periods_per_day: i64,
    pub show_generated_at: bool,
    pub default_group_by: GroupBy,
    pub min_password_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            threshold_percent: DEFAULT_THRESHOLD_PERCENT,
            periods_per_day: 7,
            show_generated_at: true,
            default_group_by: GroupBy::Subject,
            min_password_length: 8,
        }
    }
}

pub fn load_settings(conn: &rusqlite::Connection) -> anyhow::Result<Settings> {
    let attendance = load_section(conn, SetupSection::Attendance)?;
    let reports = load_section(conn, SetupSection::Reports)?;
    let security = load_section(conn, SetupSection::Security)?;
    let d = Settings::default();
    Ok(Settings {
        threshold_percent: attendance["thresholdPercent"]
            .as_f64()
            .unwrap_or(d.threshold_percent),
        periods_per_day: attendance["periodsPerDay"]
            .as_i64()
            .unwrap_or(d.periods_per_day),
        show_generated_at: reports["showGeneratedAt"]
            .as_bool()
            .unwrap_or(d.show_generated_at),
        default_group_by: reports["defaultGroupBy"]
            .as_str()
            .and_then(GroupBy::parse)
            .unwrap_or(d.default_group_by),
        min_password_length: security["minPasswordLength"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(d.min_password_length),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let attendance = match load_section(conn, SetupSection::Attendance) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = match load_section(conn, SetupSection::Reports) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let security = match load_section(conn, SetupSection::Security) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "attendance": attendance,
            "reports": reports,
            "security": security
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
    tracing::info!(section = section.key(), "settings updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
