use crate::error::AppError;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::AppState;
use crate::session::SessionState;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => {
            tracing::warn!(request_id = id, code = e.code, message = %e.message, "request failed");
            e.response(id)
        }
    }
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Splits the state so handlers can read the store while updating the session.
pub fn conn_and_session(
    state: &mut AppState,
) -> Result<(&Connection, &mut SessionState), HandlerErr> {
    let AppState { db, session, .. } = state;
    let conn = db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    Ok((conn, session))
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

/// Absent, null and blank all read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!("{} must be string or null", key)));
            };
            let t = s.trim();
            if t.is_empty() {
                Ok(None)
            } else {
                Ok(Some(t.to_string()))
            }
        }
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn parse_day_of_week(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let day = get_optional_i64(params, key)?;
    if let Some(d) = day {
        if !(0..=6).contains(&d) {
            return Err(HandlerErr::bad_params(format!(
                "{} must be 0..=6 (0 = Sunday)",
                key
            )));
        }
    }
    Ok(day)
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn ensure_class(conn: &Connection, class_id: &str) -> Result<(), HandlerErr> {
    if !row_exists(conn, "classes", class_id)? {
        return Err(AppError::not_found("class not found").into());
    }
    Ok(())
}

pub fn ensure_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    if !row_exists(conn, "students", student_id)? {
        return Err(AppError::not_found("student not found").into());
    }
    Ok(())
}

pub fn ensure_faculty(conn: &Connection, faculty_id: &str) -> Result<(), HandlerErr> {
    if !row_exists(conn, "faculty", faculty_id)? {
        return Err(AppError::not_found("faculty not found").into());
    }
    Ok(())
}

/// Checks that `user_id` names a real identity and is not already linked
/// from `other_table`, so one identity never resolves to two profiles.
pub fn ensure_linkable_user(
    conn: &Connection,
    user_id: &str,
    other_table: &str,
) -> Result<(), HandlerErr> {
    if !crate::auth::identity_exists(conn, user_id)? {
        return Err(HandlerErr::new("not_found", "identity not found"));
    }
    let sql = format!("SELECT 1 FROM {} WHERE user_id = ?", other_table);
    let taken = conn
        .query_row(&sql, [user_id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some();
    if taken {
        return Err(HandlerErr::new(
            "conflict",
            "identity is already linked to another profile",
        )
        .with_details(serde_json::json!({ "userId": user_id, "table": other_table })));
    }
    Ok(())
}

/// Reads an optional `YYYY-MM-DD` param, defaulting to today's local date.
pub fn date_or_today(params: &Value, key: &str) -> Result<chrono::NaiveDate, HandlerErr> {
    Ok(crate::calc::optional_date(params, key)?
        .unwrap_or_else(|| chrono::Local::now().date_naive()))
}
