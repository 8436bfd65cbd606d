//! Portal calls answered from the caller's own session.
//!
//! Every method here requires a session. Student-only methods answer
//! `forbidden` for faculty and `profile_not_found` for identities without a
//! linked profile.

use crate::calc::{self, aggregate, format_date, parse_date_range, GroupBy, RecordScope};
use crate::error::AppError;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::attendance::student_records;
use crate::ipc::handlers::setup::load_settings;
use crate::ipc::handlers::substitutions::effective_advisor;
use crate::ipc::handlers::timetable::{load_entries, SlotOwner};
use crate::ipc::helpers::{date_or_today, db_conn, get_optional_str, parse_day_of_week, respond};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, Profile, StudentProfile};
use serde_json::json;

fn class_id_of(student: &StudentProfile) -> Result<&str, HandlerErr> {
    student
        .class
        .as_ref()
        .map(|c| c.id.as_str())
        .ok_or_else(|| HandlerErr::new("not_found", "student is not enrolled in a class"))
}

fn me_profile(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    Ok(state.session.require()?.view())
}

fn me_attendance(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student = state.session.require()?.require_student()?;
    let range = parse_date_range(params)?;
    let records = student_records(conn, &student.id, &range)?;
    Ok(json!({ "records": records }))
}

fn me_attendance_summary(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student = state.session.require()?.require_student()?;
    let range = parse_date_range(params)?;
    let group_by = match get_optional_str(params, "groupBy")? {
        Some(raw) => GroupBy::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("groupBy must be one of: subject, none"))?,
        None => {
            load_settings(conn)
                .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
                .default_group_by
        }
    };
    let rows = calc::load_rows(conn, RecordScope::Student(&student.id), &range)?;
    Ok(json!(aggregate(&rows, group_by)))
}

fn me_timetable(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let day = parse_day_of_week(params, "dayOfWeek")?;
    let entries = match &state.session.require()?.profile {
        Profile::Student(s) => match s.class.as_ref() {
            Some(c) => load_entries(conn, SlotOwner::Class(&c.id), day)?,
            None => Vec::new(),
        },
        Profile::Faculty(f) => load_entries(conn, SlotOwner::Faculty(&f.id), day)?,
        Profile::None => return Err(AppError::ProfileNotFound.into()),
    };
    Ok(json!({ "entries": entries }))
}

fn me_classmates(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student = state.session.require()?.require_student()?;
    let class_id = class_id_of(student)?;
    let classmates: Vec<_> = session::list_students(conn, Some(class_id))?
        .into_iter()
        .filter(|s| s.id != student.id)
        .collect();
    Ok(json!({ "students": classmates }))
}

fn me_class_advisor(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student = state.session.require()?.require_student()?;
    let class_id = class_id_of(student)?;
    let date = date_or_today(params, "date")?;
    let advisor = effective_advisor(conn, class_id, date)?;
    Ok(json!({ "date": format_date(date), "advisor": advisor }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "me.profile" => me_profile(state),
        "me.attendance" => me_attendance(state, &req.params),
        "me.attendanceSummary" => me_attendance_summary(state, &req.params),
        "me.timetable" => me_timetable(state, &req.params),
        "me.classmates" => me_classmates(state),
        "me.classAdvisor" => me_class_advisor(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
