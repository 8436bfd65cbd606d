use crate::error::is_constraint_violation;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    db_conn, ensure_class, ensure_linkable_user, get_optional_str, get_required_str, respond,
};
use crate::ipc::types::{AppState, Request};
use crate::session;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;
use uuid::Uuid;

fn write_err(table: &'static str, e: rusqlite::Error) -> HandlerErr {
    let code = if is_constraint_violation(&e) {
        "conflict"
    } else {
        "db_update_failed"
    };
    HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
}

fn students_list(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_optional_str(params, "classId")?;
    if let Some(cid) = class_id.as_deref() {
        ensure_class(conn, cid)?;
    }
    let students = session::list_students(conn, class_id.as_deref())?;
    Ok(json!({ "students": students }))
}

fn students_get(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    match session::student_by_id(conn, &student_id)? {
        Some(student) => Ok(json!({ "student": student })),
        None => Err(HandlerErr::new("not_found", "student not found")),
    }
}

fn students_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let full_name = get_required_str(params, "fullName")?;
    let roll_number = get_required_str(params, "rollNumber")?.to_uppercase();
    let class_id = get_required_str(params, "classId")?;
    let email = get_optional_str(params, "email")?;
    let user_id = get_optional_str(params, "userId")?;

    ensure_class(conn, &class_id)?;
    if let Some(uid) = user_id.as_deref() {
        ensure_linkable_user(conn, uid, "faculty")?;
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, user_id, roll_number, full_name, email, class_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &user_id, &roll_number, &full_name, &email, &class_id),
    )
    .map_err(|e| write_err("students", e))?;

    tracing::info!(student_id = %student_id, class_id = %class_id, "student created");
    Ok(json!({ "studentId": student_id }))
}

fn students_update(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing/invalid patch"));
    };
    let has = |key: &str| patch.get(key).is_some();

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if has("fullName") {
        set_parts.push("full_name = ?");
        bind_values.push(Value::Text(get_required_str(patch, "fullName")?));
    }
    if has("rollNumber") {
        set_parts.push("roll_number = ?");
        bind_values.push(Value::Text(
            get_required_str(patch, "rollNumber")?.to_uppercase(),
        ));
    }
    if has("classId") {
        let class_id = get_required_str(patch, "classId")?;
        ensure_class(conn, &class_id)?;
        set_parts.push("class_id = ?");
        bind_values.push(Value::Text(class_id));
    }
    if has("email") {
        let email = get_optional_str(patch, "email")?;
        set_parts.push("email = ?");
        bind_values.push(email.map_or(Value::Null, Value::Text));
    }
    if has("userId") {
        let user_id = get_optional_str(patch, "userId")?;
        if let Some(uid) = user_id.as_deref() {
            ensure_linkable_user(conn, uid, "faculty")?;
        }
        set_parts.push("user_id = ?");
        bind_values.push(user_id.map_or(Value::Null, Value::Text));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id.clone()));
    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| write_err("students", e))?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    Ok(json!({ "ok": true }))
}

fn students_delete(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let student_id = get_required_str(params, "studentId")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let removed_marks = tx
        .execute(
            "DELETE FROM attendance_records WHERE student_id = ?",
            [&student_id],
        )
        .map_err(|e| write_err("attendance_records", e))?;
    let changed = tx
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(|e| write_err("students", e))?;
    if changed == 0 {
        // Dropping the transaction rolls it back.
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    tracing::info!(student_id = %student_id, removed_marks, "student deleted");
    Ok(json!({ "ok": true, "removedMarks": removed_marks }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.get" => students_get(state, &req.params),
        "students.create" => students_create(state, &req.params),
        "students.update" => students_update(state, &req.params),
        "students.delete" => students_delete(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
