use crate::calc::{
    self, aggregate, daily_summary, format_date, parse_date, parse_date_range, AttendanceStatus,
    DateRange, GroupBy, RecordScope,
};
use crate::error::AppError;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::timetable::{check_period, subject_for_slot};
use crate::ipc::helpers::{
    db_conn, ensure_class, ensure_student, get_optional_i64, get_optional_str, get_required_i64,
    get_required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A stored mark as shown to portal and admin views.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordView {
    pub id: String,
    pub date: String,
    pub period_number: i64,
    pub subject: Option<String>,
    pub status: AttendanceStatus,
    pub faculty_name: Option<String>,
    pub marked_at: String,
}

/// Newest date first, then by period.
pub fn student_records(
    conn: &Connection,
    student_id: &str,
    range: &DateRange,
) -> rusqlite::Result<Vec<RecordView>> {
    let mut sql = String::from(
        "SELECT a.id, a.date, a.period_number, a.subject, a.status, f.full_name, a.marked_at
         FROM attendance_records a
         LEFT JOIN faculty f ON f.id = a.faculty_id
         WHERE a.student_id = ?",
    );
    let mut binds = vec![Value::Text(student_id.to_string())];
    range.push_sql("a.date", &mut sql, &mut binds);
    sql.push_str(" ORDER BY a.date DESC, a.period_number");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(RecordView {
                id: r.get(0)?,
                date: r.get(1)?,
                period_number: r.get(2)?,
                subject: r.get(3)?,
                status: r.get(4)?,
                faculty_name: r.get(5)?,
                marked_at: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Validates a marking batch and collapses repeats of the same student.
///
/// The whole batch is rejected if any entry lacks a key component or carries
/// an unknown status. A later entry for a student replaces an earlier one but
/// keeps the earlier position.
fn collapse_entries(
    entries: &[serde_json::Value],
) -> Result<Vec<(String, AttendanceStatus)>, HandlerErr> {
    let mut out: Vec<(String, AttendanceStatus)> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let student_id = entry
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let status = entry
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(AttendanceStatus::parse);
        let (Some(student_id), Some(status)) = (student_id, status) else {
            return Err(HandlerErr::from(AppError::UpsertConflict(
                "each entry needs a studentId and a known status".into(),
            ))
            .with_details(json!({ "index": index })));
        };
        match position.get(student_id) {
            Some(&i) => out[i].1 = status,
            None => {
                position.insert(student_id.to_string(), out.len());
                out.push((student_id.to_string(), status));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MarkOutcome {
    inserted: usize,
    updated: usize,
}

struct MarkSlot<'a> {
    class_id: &'a str,
    faculty_id: &'a str,
    date: &'a str,
    period_number: i64,
    subject: Option<&'a str>,
}

/// Upserts every entry on `(student_id, date, period_number)` in one
/// transaction. Nothing is written unless every entry succeeds.
fn write_marks(
    conn: &Connection,
    slot: &MarkSlot<'_>,
    entries: &[(String, AttendanceStatus)],
) -> Result<MarkOutcome, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let marked_at = chrono::Utc::now().to_rfc3339();
    let mut outcome = MarkOutcome::default();

    for (student_id, status) in entries {
        let existed = tx
            .query_row(
                "SELECT 1 FROM attendance_records
                 WHERE student_id = ? AND date = ? AND period_number = ?",
                (student_id, slot.date, slot.period_number),
                |r| r.get::<_, i64>(0),
            )
            .optional()?
            .is_some();

        if let Err(e) = tx.execute(
            "INSERT INTO attendance_records(
                id, student_id, class_id, faculty_id, date, period_number, subject, status, marked_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, date, period_number) DO UPDATE SET
               class_id = excluded.class_id,
               faculty_id = excluded.faculty_id,
               subject = excluded.subject,
               status = excluded.status,
               marked_at = excluded.marked_at",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                student_id,
                slot.class_id,
                slot.faculty_id,
                slot.date,
                slot.period_number,
                slot.subject,
                status,
                marked_at,
            ],
        ) {
            // Dropping the transaction rolls back the partial batch.
            return Err(HandlerErr::from(AppError::UpsertConflict(e.to_string()))
                .with_details(json!({ "studentId": student_id })));
        }

        if existed {
            outcome.updated += 1;
        } else {
            outcome.inserted += 1;
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(outcome)
}

fn attendance_mark(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty = state.session.require()?.require_faculty()?;

    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?, "date")?;
    let period_number = get_required_i64(params, "periodNumber")?;
    let Some(raw_entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("entries must be an array"));
    };
    if raw_entries.is_empty() {
        return Err(HandlerErr::bad_params("entries must not be empty"));
    }

    ensure_class(conn, &class_id)?;
    check_period(conn, period_number)?;
    let entries = collapse_entries(raw_entries)?;

    let roster: HashSet<String> = calc::load_roster(conn, &class_id)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    if let Some((outsider, _)) = entries.iter().find(|(id, _)| !roster.contains(id)) {
        return Err(HandlerErr::new("not_found", "student is not in this class")
            .with_details(json!({ "studentId": outsider })));
    }

    let subject = match get_optional_str(params, "subject")? {
        Some(s) => Some(s),
        None => subject_for_slot(
            conn,
            &class_id,
            date.weekday().num_days_from_sunday() as i64,
            period_number,
        )?,
    };

    let date_str = format_date(date);
    let slot = MarkSlot {
        class_id: &class_id,
        faculty_id: &faculty.id,
        date: &date_str,
        period_number,
        subject: subject.as_deref(),
    };
    let outcome = match write_marks(conn, &slot, &entries) {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(
                class_id = %class_id,
                date = %date_str,
                period_number,
                code = e.code,
                "attendance batch rejected"
            );
            return Err(e);
        }
    };

    tracing::info!(
        class_id = %class_id,
        date = %date_str,
        period_number,
        inserted = outcome.inserted,
        updated = outcome.updated,
        "attendance marked"
    );
    Ok(json!({
        "upserted": entries.len(),
        "inserted": outcome.inserted,
        "updated": outcome.updated,
        "subject": subject,
    }))
}

fn attendance_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty = state.session.require()?.require_faculty()?;
    let record_id = get_required_str(params, "recordId")?;
    let status = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status) else {
        return Err(HandlerErr::bad_params(
            "status must be one of: present, absent, leave, onduty",
        ));
    };

    let changed = conn
        .execute(
            "UPDATE attendance_records SET status = ?, faculty_id = ?, marked_at = ? WHERE id = ?",
            (status, &faculty.id, chrono::Utc::now().to_rfc3339(), &record_id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "attendance record not found"));
    }
    Ok(json!({ "ok": true }))
}

fn attendance_for_class_date(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let date = parse_date(&get_required_str(params, "date")?, "date")?;
    let period_number = get_optional_i64(params, "periodNumber")?;
    ensure_class(conn, &class_id)?;

    let mut sql = String::from(
        "SELECT a.id, a.student_id, s.roll_number, s.full_name, a.period_number, a.subject,
                a.status, a.faculty_id, a.marked_at
         FROM attendance_records a
         JOIN students s ON s.id = a.student_id
         WHERE a.class_id = ? AND a.date = ?",
    );
    let mut binds = vec![Value::Text(class_id), Value::Text(format_date(date))];
    if let Some(p) = period_number {
        sql.push_str(" AND a.period_number = ?");
        binds.push(Value::Integer(p));
    }
    sql.push_str(" ORDER BY a.period_number, s.roll_number");

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params_from_iter(binds), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let roll_number: String = r.get(2)?;
            let full_name: String = r.get(3)?;
            let period_number: i64 = r.get(4)?;
            let subject: Option<String> = r.get(5)?;
            let status: AttendanceStatus = r.get(6)?;
            let faculty_id: Option<String> = r.get(7)?;
            let marked_at: String = r.get(8)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "rollNumber": roll_number,
                "fullName": full_name,
                "periodNumber": period_number,
                "subject": subject,
                "status": status,
                "facultyId": faculty_id,
                "markedAt": marked_at
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "date": format_date(date), "records": records }))
}

fn attendance_for_student(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let range = parse_date_range(params)?;
    ensure_student(conn, &student_id)?;
    let records = student_records(conn, &student_id, &range)?;
    Ok(json!({ "records": records }))
}

fn attendance_stats(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_optional_str(params, "classId")?;
    let student_id = get_optional_str(params, "studentId")?;
    let range = parse_date_range(params)?;

    let scope = match (student_id.as_deref(), class_id.as_deref()) {
        (Some(_), Some(_)) => {
            return Err(HandlerErr::bad_params(
                "pass at most one of classId and studentId",
            ))
        }
        (Some(sid), None) => {
            ensure_student(conn, sid)?;
            RecordScope::Student(sid)
        }
        (None, Some(cid)) => {
            ensure_class(conn, cid)?;
            RecordScope::Class(cid)
        }
        (None, None) => RecordScope::All,
    };
    let rows = calc::load_rows(conn, scope, &range)?;
    let result = aggregate(&rows, GroupBy::None);
    Ok(json!({ "stats": result.overall }))
}

fn attendance_by_subject(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let range = parse_date_range(params)?;
    ensure_student(conn, &student_id)?;
    let rows = calc::load_rows(conn, RecordScope::Student(&student_id), &range)?;
    Ok(json!(aggregate(&rows, GroupBy::Subject)))
}

fn attendance_monthly_summary(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let year = get_required_i64(params, "year")?;
    let month = get_required_i64(params, "month")?;
    let (Ok(year), Ok(month)) = (i32::try_from(year), u32::try_from(month)) else {
        return Err(HandlerErr::bad_params("year/month out of range"));
    };
    let range = DateRange::month(year, month)?;
    ensure_student(conn, &student_id)?;
    let rows = calc::load_rows(conn, RecordScope::Student(&student_id), &range)?;
    Ok(json!({
        "year": year,
        "month": month,
        "days": daily_summary(&rows),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.mark" => attendance_mark(state, &req.params),
        "attendance.update" => attendance_update(state, &req.params),
        "attendance.forClassDate" => attendance_for_class_date(state, &req.params),
        "attendance.forStudent" => attendance_for_student(state, &req.params),
        "attendance.stats" => attendance_stats(state, &req.params),
        "attendance.bySubject" => attendance_by_subject(state, &req.params),
        "attendance.monthlySummary" => attendance_monthly_summary(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
