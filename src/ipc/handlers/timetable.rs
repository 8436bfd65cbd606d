use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::load_settings;
use crate::ipc::helpers::{
    db_conn, ensure_class, ensure_faculty, get_optional_str, get_required_i64, get_required_str,
    parse_day_of_week, respond,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// One weekly slot: class, weekday (0 = Sunday), period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableEntry {
    pub id: String,
    pub class_id: String,
    pub class_name: String,
    pub day_of_week: i64,
    pub period_number: i64,
    pub subject: String,
    pub faculty_id: Option<String>,
    pub faculty_name: Option<String>,
}

pub enum SlotOwner<'a> {
    Class(&'a str),
    Faculty(&'a str),
}

pub fn load_entries(
    conn: &Connection,
    owner: SlotOwner<'_>,
    day_of_week: Option<i64>,
) -> rusqlite::Result<Vec<TimetableEntry>> {
    let mut sql = String::from(
        "SELECT t.id, t.class_id, c.class_name, t.day_of_week, t.period_number, t.subject,
                t.faculty_id, f.full_name
         FROM timetable t
         JOIN classes c ON c.id = t.class_id
         LEFT JOIN faculty f ON f.id = t.faculty_id",
    );
    let mut binds: Vec<Value> = Vec::new();
    match owner {
        SlotOwner::Class(id) => {
            sql.push_str(" WHERE t.class_id = ?");
            binds.push(Value::Text(id.to_string()));
        }
        SlotOwner::Faculty(id) => {
            sql.push_str(" WHERE t.faculty_id = ?");
            binds.push(Value::Text(id.to_string()));
        }
    }
    if let Some(d) = day_of_week {
        sql.push_str(" AND t.day_of_week = ?");
        binds.push(Value::Integer(d));
    }
    sql.push_str(" ORDER BY t.day_of_week, t.period_number, c.class_name");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(TimetableEntry {
                id: r.get(0)?,
                class_id: r.get(1)?,
                class_name: r.get(2)?,
                day_of_week: r.get(3)?,
                period_number: r.get(4)?,
                subject: r.get(5)?,
                faculty_id: r.get(6)?,
                faculty_name: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Subject scheduled for a class slot, if any.
pub fn subject_for_slot(
    conn: &Connection,
    class_id: &str,
    day_of_week: i64,
    period_number: i64,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT subject FROM timetable
         WHERE class_id = ? AND day_of_week = ? AND period_number = ?",
        (class_id, day_of_week, period_number),
        |r| r.get(0),
    )
    .optional()
}

/// Rejects period numbers outside `1..=periodsPerDay`.
pub fn check_period(conn: &Connection, period_number: i64) -> Result<(), HandlerErr> {
    let settings =
        load_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if !(1..=settings.periods_per_day).contains(&period_number) {
        return Err(HandlerErr::bad_params(format!(
            "periodNumber must be in 1..={}",
            settings.periods_per_day
        )));
    }
    Ok(())
}

fn timetable_for_class(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let day = parse_day_of_week(params, "dayOfWeek")?;
    ensure_class(conn, &class_id)?;
    let entries = load_entries(conn, SlotOwner::Class(&class_id), day)?;
    Ok(json!({ "entries": entries }))
}

fn timetable_for_faculty(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty_id = get_required_str(params, "facultyId")?;
    let day = parse_day_of_week(params, "dayOfWeek")?;
    ensure_faculty(conn, &faculty_id)?;
    let entries = load_entries(conn, SlotOwner::Faculty(&faculty_id), day)?;
    Ok(json!({ "entries": entries }))
}

fn timetable_upsert(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let Some(day) = parse_day_of_week(params, "dayOfWeek")? else {
        return Err(HandlerErr::bad_params("missing dayOfWeek"));
    };
    let period_number = get_required_i64(params, "periodNumber")?;
    let subject = get_required_str(params, "subject")?;
    let faculty_id = get_optional_str(params, "facultyId")?;

    ensure_class(conn, &class_id)?;
    check_period(conn, period_number)?;
    if let Some(fid) = faculty_id.as_deref() {
        ensure_faculty(conn, fid)?;
    }

    let new_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO timetable(id, class_id, day_of_week, period_number, subject, faculty_id)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, day_of_week, period_number) DO UPDATE SET
           subject = excluded.subject,
           faculty_id = excluded.faculty_id",
        (&new_id, &class_id, day, period_number, &subject, &faculty_id),
    )
    .map_err(|e| {
        HandlerErr::new("upsert_conflict", e.to_string())
            .with_details(json!({ "table": "timetable" }))
    })?;

    let entry_id: String = conn.query_row(
        "SELECT id FROM timetable WHERE class_id = ? AND day_of_week = ? AND period_number = ?",
        (&class_id, day, period_number),
        |r| r.get(0),
    )?;
    tracing::debug!(class_id = %class_id, day, period_number, "timetable slot saved");
    Ok(json!({ "entryId": entry_id, "created": entry_id == new_id }))
}

fn timetable_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let entry_id = get_required_str(params, "entryId")?;
    let changed = conn
        .execute("DELETE FROM timetable WHERE id = ?", [&entry_id])
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "timetable entry not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "timetable.forClass" => timetable_for_class(state, &req.params),
        "timetable.forFaculty" => timetable_for_faculty(state, &req.params),
        "timetable.upsert" => timetable_upsert(state, &req.params),
        "timetable.delete" => timetable_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
