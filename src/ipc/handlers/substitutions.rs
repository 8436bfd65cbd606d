use crate::calc::{format_date, parse_date};
use crate::error::is_constraint_violation;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    date_or_today, db_conn, ensure_class, ensure_faculty, get_optional_str, get_required_str,
    respond,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    pub id: String,
    pub class_id: String,
    pub class_name: String,
    pub original_advisor_id: String,
    pub original_advisor_name: String,
    pub substitute_advisor_id: String,
    pub substitute_advisor_name: String,
    pub from_date: String,
    pub to_date: String,
    pub reason: Option<String>,
    pub created_at: String,
}

/// Who currently acts as advisor for a class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveAdvisor {
    pub faculty_id: String,
    pub full_name: String,
    pub email: String,
    pub is_substitute: bool,
    pub substitution_id: Option<String>,
    pub until: Option<String>,
}

const SUBSTITUTION_SELECT: &str = "SELECT s.id, s.class_id, c.class_name,
        s.original_advisor_id, o.full_name, s.substitute_advisor_id, n.full_name,
        s.from_date, s.to_date, s.reason, s.created_at
     FROM advisor_substitutions s
     JOIN classes c ON c.id = s.class_id
     JOIN faculty o ON o.id = s.original_advisor_id
     JOIN faculty n ON n.id = s.substitute_advisor_id";

fn substitution_from_row(r: &Row<'_>) -> rusqlite::Result<Substitution> {
    Ok(Substitution {
        id: r.get(0)?,
        class_id: r.get(1)?,
        class_name: r.get(2)?,
        original_advisor_id: r.get(3)?,
        original_advisor_name: r.get(4)?,
        substitute_advisor_id: r.get(5)?,
        substitute_advisor_name: r.get(6)?,
        from_date: r.get(7)?,
        to_date: r.get(8)?,
        reason: r.get(9)?,
        created_at: r.get(10)?,
    })
}

/// Substitutions for a class whose inclusive bounds contain `date`,
/// most recently started first.
pub fn active_substitutions(
    conn: &Connection,
    class_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<Vec<Substitution>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE s.class_id = ?1 AND s.from_date <= ?2 AND s.to_date >= ?2
         ORDER BY s.from_date DESC, s.created_at DESC",
        SUBSTITUTION_SELECT
    ))?;
    let rows = stmt
        .query_map((class_id, format_date(date)), substitution_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The class a faculty member covers as substitute on `date`, if any.
pub fn substituted_class_for(
    conn: &Connection,
    faculty_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT class_id FROM advisor_substitutions
         WHERE substitute_advisor_id = ?1 AND from_date <= ?2 AND to_date >= ?2
         ORDER BY from_date DESC, created_at DESC
         LIMIT 1",
        (faculty_id, format_date(date)),
        |r| r.get(0),
    )
    .optional()
}

/// An active substitute takes precedence over the assigned advisor.
pub fn effective_advisor(
    conn: &Connection,
    class_id: &str,
    date: NaiveDate,
) -> rusqlite::Result<Option<EffectiveAdvisor>> {
    if let Some(sub) = active_substitutions(conn, class_id, date)?.into_iter().next() {
        let email: String = conn.query_row(
            "SELECT email FROM faculty WHERE id = ?",
            [&sub.substitute_advisor_id],
            |r| r.get(0),
        )?;
        return Ok(Some(EffectiveAdvisor {
            faculty_id: sub.substitute_advisor_id,
            full_name: sub.substitute_advisor_name,
            email,
            is_substitute: true,
            substitution_id: Some(sub.id),
            until: Some(sub.to_date),
        }));
    }

    conn.query_row(
        "SELECT id, full_name, email FROM faculty
         WHERE advisor_class_id = ? AND is_class_advisor = 1
         ORDER BY full_name
         LIMIT 1",
        [class_id],
        |r| {
            Ok(EffectiveAdvisor {
                faculty_id: r.get(0)?,
                full_name: r.get(1)?,
                email: r.get(2)?,
                is_substitute: false,
                substitution_id: None,
                until: None,
            })
        },
    )
    .optional()
}

fn substitutions_create(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let original = get_required_str(params, "originalAdvisorId")?;
    let substitute = get_required_str(params, "substituteAdvisorId")?;
    let from_date = parse_date(&get_required_str(params, "fromDate")?, "fromDate")?;
    let to_date = parse_date(&get_required_str(params, "toDate")?, "toDate")?;
    let reason = get_optional_str(params, "reason")?;

    if from_date > to_date {
        return Err(HandlerErr::bad_params("fromDate must not be after toDate"));
    }
    if original == substitute {
        return Err(HandlerErr::bad_params(
            "substitute must differ from the original advisor",
        ));
    }
    ensure_class(conn, &class_id)?;
    ensure_faculty(conn, &original)?;
    ensure_faculty(conn, &substitute)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO advisor_substitutions(
            id, class_id, original_advisor_id, substitute_advisor_id, from_date, to_date, reason, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_id,
            &original,
            &substitute,
            format_date(from_date),
            format_date(to_date),
            &reason,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| {
        let code = if is_constraint_violation(&e) {
            "conflict"
        } else {
            "db_update_failed"
        };
        HandlerErr::new(code, e.to_string())
            .with_details(json!({ "table": "advisor_substitutions" }))
    })?;

    tracing::info!(
        class_id = %class_id,
        substitute = %substitute,
        from = %from_date,
        to = %to_date,
        "advisor substitution recorded"
    );
    Ok(json!({ "substitutionId": id }))
}

fn substitutions_active(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let date = date_or_today(params, "date")?;
    ensure_class(conn, &class_id)?;
    let substitutions = active_substitutions(conn, &class_id, date)?;
    Ok(json!({ "date": format_date(date), "substitutions": substitutions }))
}

fn advisor_effective(
    state: &AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let class_id = get_required_str(params, "classId")?;
    let date = date_or_today(params, "date")?;
    ensure_class(conn, &class_id)?;
    let advisor = effective_advisor(conn, &class_id, date)?;
    Ok(json!({ "date": format_date(date), "advisor": advisor }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "substitutions.create" => substitutions_create(state, &req.params),
        "substitutions.active" => substitutions_active(state, &req.params),
        "advisor.effective" => advisor_effective(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
