use crate::error::is_constraint_violation;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn class_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let class_name: String = row.get(1)?;
    let year: i64 = row.get(2)?;
    let section: String = row.get(3)?;
    let department: String = row.get(4)?;
    let student_count: i64 = row.get(5)?;
    Ok(json!({
        "id": id,
        "className": class_name,
        "year": year,
        "section": section,
        "department": department,
        "studentCount": student_count
    }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Correlated subquery keeps counts right without join fan-out.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.class_name,
           c.year,
           c.section,
           c.department,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
         FROM classes c
         ORDER BY c.year DESC, c.section",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], class_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing classId", None);
    };

    let row = conn
        .query_row(
            "SELECT
               c.id,
               c.class_name,
               c.year,
               c.section,
               c.department,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM classes c
             WHERE c.id = ?",
            [class_id],
            class_json,
        )
        .optional();

    match row {
        Ok(Some(class)) => ok(&req.id, json!({ "class": class })),
        Ok(None) => err(&req.id, "not_found", "class not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(year) = req.params.get("year").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing year", None);
    };
    if !(1..=9999).contains(&year) {
        return err(&req.id, "bad_params", "year out of range", None);
    }
    let section = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_uppercase(),
        None => return err(&req.id, "bad_params", "missing section", None),
    };
    let department = match req.params.get("department").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_uppercase(),
        None => return err(&req.id, "bad_params", "missing department", None),
    };
    if section.is_empty() || department.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "section and department must not be empty",
            None,
        );
    }
    let class_name = req
        .params
        .get("className")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{} {} {}", year, department, section));

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, class_name, year, section, department) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &class_name, year, &section, &department),
    ) {
        let code = if is_constraint_violation(&e) {
            "conflict"
        } else {
            "db_update_failed"
        };
        return err(
            &req.id,
            code,
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(
        &req.id,
        json!({ "classId": class_id, "className": class_name }),
    )
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Dependency order; there is no ON DELETE CASCADE. A transferred student
    // may still own marks filed under their previous class.
    let steps: [(&str, &str); 6] = [
        (
            "attendance_records",
            "DELETE FROM attendance_records WHERE class_id = ?",
        ),
        (
            "attendance_records",
            "DELETE FROM attendance_records
             WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        ),
        ("timetable", "DELETE FROM timetable WHERE class_id = ?"),
        (
            "advisor_substitutions",
            "DELETE FROM advisor_substitutions WHERE class_id = ?",
        ),
        ("students", "DELETE FROM students WHERE class_id = ?"),
        (
            "faculty",
            "UPDATE faculty SET advisor_class_id = NULL, is_class_advisor = 0
             WHERE advisor_class_id = ?",
        ),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }

    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    tracing::info!(class_id = %class_id, "class deleted");

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.get" => Some(handle_classes_get(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
