use crate::calc::{
    self, aggregate, class_rollup, classify, format_date, parse_date_range, DateRange, GroupBy,
    RecordScope,
};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::{load_settings, Settings};
use crate::ipc::handlers::substitutions::substituted_class_for;
use crate::ipc::helpers::{db_conn, get_optional_str, get_required_str, respond};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, ClassRef};
use rusqlite::Connection;
use serde_json::json;

fn settings(conn: &Connection) -> Result<Settings, HandlerErr> {
    load_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn range_json(range: &DateRange) -> serde_json::Value {
    json!({
        "startDate": range.start.map(format_date),
        "endDate": range.end.map(format_date),
    })
}

fn generated_at(settings: &Settings) -> Option<String> {
    settings
        .show_generated_at
        .then(|| chrono::Utc::now().to_rfc3339())
}

fn load_class(conn: &Connection, class_id: &str) -> Result<ClassRef, HandlerErr> {
    session::class_by_id(conn, class_id)?
        .ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

/// Roster rollup for one class. Every number comes from the aggregator.
fn class_model(
    conn: &Connection,
    class: &ClassRef,
    range: &DateRange,
    settings: &Settings,
) -> Result<serde_json::Value, HandlerErr> {
    let roster = calc::load_roster(conn, &class.id)?;
    let rows = calc::load_rows(conn, RecordScope::Class(&class.id), range)?;
    let rollup = class_rollup(&roster, &rows, settings.threshold_percent);
    Ok(json!({
        "class": class,
        "range": range_json(range),
        "generatedAt": generated_at(settings),
        "threshold": rollup.threshold_percent,
        "studentCount": rollup.student_count,
        "classAverage": rollup.class_average,
        "aboveThresholdCount": rollup.above_threshold_count,
        "belowThresholdCount": rollup.below_threshold_count,
        "students": rollup.students,
    }))
}

fn reports_class_attendance_model(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let range = parse_date_range(params)?;
    let class = load_class(conn, &class_id)?;
    class_model(conn, &class, &range, &settings(conn)?)
}

fn reports_student_attendance_model(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let range = parse_date_range(params)?;
    let settings = settings(conn)?;
    let group_by = match get_optional_str(params, "groupBy")? {
        Some(raw) => GroupBy::parse(&raw)
            .ok_or_else(|| HandlerErr::bad_params("groupBy must be one of: subject, none"))?,
        None => settings.default_group_by,
    };

    let Some(student) = session::student_by_id(conn, &student_id)? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    let rows = calc::load_rows(conn, RecordScope::Student(&student.id), &range)?;
    let result = aggregate(&rows, group_by);
    let band = classify(result.overall.percentage, settings.threshold_percent);

    Ok(json!({
        "student": {
            "id": student.id,
            "fullName": student.full_name,
            "rollNumber": student.roll_number,
            "email": student.email,
        },
        "class": student.class,
        "range": range_json(&range),
        "generatedAt": generated_at(&settings),
        "threshold": settings.threshold_percent,
        "groupBy": result.group_by,
        "overall": result.overall,
        "band": band,
        "groups": result.groups,
    }))
}

fn reports_advisor_class_model(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let caller = state.session.require()?.require_faculty()?;
    let range = parse_date_range(params)?;

    // Re-read the row: advisor assignments may have changed since sign-in.
    let Some(faculty) = session::faculty_by_id(conn, &caller.id)? else {
        return Err(HandlerErr::new("not_found", "faculty not found"));
    };
    let today = chrono::Local::now().date_naive();
    let (class, is_substitute) = match faculty.advisor_class.filter(|_| faculty.is_class_advisor) {
        Some(class) => (class, false),
        None => match substituted_class_for(conn, &faculty.id, today)? {
            Some(class_id) => (load_class(conn, &class_id)?, true),
            None => return Err(HandlerErr::new("forbidden", "not a class advisor")),
        },
    };

    let mut model = class_model(conn, &class, &range, &settings(conn)?)?;
    model["advisor"] = json!({
        "facultyId": faculty.id,
        "fullName": faculty.full_name,
        "isSubstitute": is_substitute,
    });
    Ok(model)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.classAttendanceModel" => reports_class_attendance_model(state, &req.params),
        "reports.studentAttendanceModel" => reports_student_attendance_model(state, &req.params),
        "reports.advisorClassModel" => reports_advisor_class_model(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
