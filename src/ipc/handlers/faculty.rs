use crate::error::is_constraint_violation;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    db_conn, ensure_class, ensure_faculty, ensure_linkable_user, get_optional_bool,
    get_optional_str, get_required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{self, ClassRef};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

fn write_err(e: rusqlite::Error) -> HandlerErr {
    let code = if is_constraint_violation(&e) {
        "conflict"
    } else {
        "db_update_failed"
    };
    HandlerErr::new(code, e.to_string()).with_details(json!({ "table": "faculty" }))
}

fn faculty_list(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty = session::list_faculty(conn)?;
    Ok(json!({ "faculty": faculty }))
}

fn faculty_get(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty_id = get_required_str(params, "facultyId")?;
    match session::faculty_by_id(conn, &faculty_id)? {
        Some(f) => Ok(json!({ "faculty": f })),
        None => Err(HandlerErr::new("not_found", "faculty not found")),
    }
}

/// An advisor flag without a class to advise is meaningless.
fn check_advisor_fields(
    conn: &Connection,
    is_class_advisor: bool,
    advisor_class_id: Option<&str>,
) -> Result<(), HandlerErr> {
    match advisor_class_id {
        Some(cid) => ensure_class(conn, cid),
        None if is_class_advisor => Err(HandlerErr::bad_params(
            "isClassAdvisor requires advisorClassId",
        )),
        None => Ok(()),
    }
}

fn faculty_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let full_name = get_required_str(params, "fullName")?;
    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    let department = get_optional_str(params, "department")?;
    let user_id = get_optional_str(params, "userId")?;
    let advisor_class_id = get_optional_str(params, "advisorClassId")?;
    let is_class_advisor =
        get_optional_bool(params, "isClassAdvisor")?.unwrap_or(advisor_class_id.is_some());

    check_advisor_fields(conn, is_class_advisor, advisor_class_id.as_deref())?;
    if let Some(uid) = user_id.as_deref() {
        ensure_linkable_user(conn, uid, "students")?;
    }

    let faculty_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO faculty(id, user_id, full_name, email, department, is_class_advisor, advisor_class_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &faculty_id,
            &user_id,
            &full_name,
            &email,
            &department,
            is_class_advisor as i64,
            &advisor_class_id,
        ),
    )
    .map_err(write_err)?;

    tracing::info!(faculty_id = %faculty_id, "faculty created");
    Ok(json!({ "facultyId": faculty_id }))
}

fn faculty_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty_id = get_required_str(params, "facultyId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing/invalid patch"));
    };
    let Some(current) = session::faculty_by_id(conn, &faculty_id)? else {
        return Err(HandlerErr::new("not_found", "faculty not found"));
    };

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if patch.get("fullName").is_some() {
        set_parts.push("full_name = ?");
        bind_values.push(Value::Text(get_required_str(patch, "fullName")?));
    }
    if patch.get("email").is_some() {
        set_parts.push("email = ?");
        bind_values.push(Value::Text(
            get_required_str(patch, "email")?.to_ascii_lowercase(),
        ));
    }
    if patch.get("department").is_some() {
        set_parts.push("department = ?");
        bind_values.push(get_optional_str(patch, "department")?.map_or(Value::Null, Value::Text));
    }
    if patch.get("userId").is_some() {
        let user_id = get_optional_str(patch, "userId")?;
        if let Some(uid) = user_id.as_deref() {
            ensure_linkable_user(conn, uid, "students")?;
        }
        set_parts.push("user_id = ?");
        bind_values.push(user_id.map_or(Value::Null, Value::Text));
    }

    // Advisor fields are validated against the merged result.
    let advisor_class_id = if patch.get("advisorClassId").is_some() {
        get_optional_str(patch, "advisorClassId")?
    } else {
        current.advisor_class.map(|c| c.id)
    };
    let is_class_advisor =
        get_optional_bool(patch, "isClassAdvisor")?.unwrap_or(current.is_class_advisor);
    if patch.get("advisorClassId").is_some() || patch.get("isClassAdvisor").is_some() {
        check_advisor_fields(conn, is_class_advisor, advisor_class_id.as_deref())?;
        set_parts.push("advisor_class_id = ?");
        bind_values.push(advisor_class_id.map_or(Value::Null, Value::Text));
        set_parts.push("is_class_advisor = ?");
        bind_values.push(Value::Integer(is_class_advisor as i64));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }

    let sql = format!("UPDATE faculty SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(faculty_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(write_err)?;
    Ok(json!({ "ok": true }))
}

fn reference_count(conn: &Connection, sql: &str, faculty_id: &str) -> Result<i64, HandlerErr> {
    Ok(conn.query_row(sql, [faculty_id], |r| r.get(0))?)
}

fn faculty_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty_id = get_required_str(params, "facultyId")?;
    ensure_faculty(conn, &faculty_id)?;

    let timetable = reference_count(
        conn,
        "SELECT COUNT(*) FROM timetable WHERE faculty_id = ?",
        &faculty_id,
    )?;
    let attendance = reference_count(
        conn,
        "SELECT COUNT(*) FROM attendance_records WHERE faculty_id = ?",
        &faculty_id,
    )?;
    let substitutions = reference_count(
        conn,
        "SELECT COUNT(*) FROM advisor_substitutions
         WHERE original_advisor_id = ?1 OR substitute_advisor_id = ?1",
        &faculty_id,
    )?;
    if timetable + attendance + substitutions > 0 {
        return Err(HandlerErr::new("conflict", "faculty is still referenced").with_details(
            json!({
                "timetable": timetable,
                "attendance": attendance,
                "substitutions": substitutions
            }),
        ));
    }

    conn.execute("DELETE FROM faculty WHERE id = ?", [&faculty_id])
        .map_err(write_err)?;
    tracing::info!(faculty_id = %faculty_id, "faculty deleted");
    Ok(json!({ "ok": true }))
}

fn faculty_assigned_classes(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let faculty_id = get_required_str(params, "facultyId")?;
    ensure_faculty(conn, &faculty_id)?;

    let mut stmt = conn.prepare(
        "SELECT DISTINCT c.id, c.class_name, c.year, c.section, c.department
         FROM timetable t
         JOIN classes c ON c.id = t.class_id
         WHERE t.faculty_id = ?
         ORDER BY c.year DESC, c.section",
    )?;
    let classes = stmt
        .query_map([&faculty_id], |r| {
            Ok(ClassRef {
                id: r.get(0)?,
                class_name: r.get(1)?,
                year: r.get(2)?,
                section: r.get(3)?,
                department: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": classes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "faculty.list" => faculty_list(state),
        "faculty.get" => faculty_get(state, &req.params),
        "faculty.create" => faculty_create(state, &req.params),
        "faculty.update" => faculty_update(state, &req.params),
        "faculty.delete" => faculty_delete(state, &req.params),
        "faculty.assignedClasses" => faculty_assigned_classes(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
