use crate::attendance::{self, MarkContext, StatsSubject};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Session};
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn validation(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "validation",
        message: message.into(),
        details: None,
    }
}

fn db_err(code: &'static str, e: rusqlite::Error) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Required `YYYY-MM-DD` day parameter, normalized through NaiveDate so
/// time-of-day can never sneak into record identity.
fn parse_required_day(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    attendance::parse_day(&raw)
        .map(|d| d.to_string())
        .ok_or_else(|| validation(format!("invalid {}: use YYYY-MM-DD", key)))
}

fn parse_opt_day(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match get_opt_str(params, key) {
        None => Ok(None),
        Some(raw) => attendance::parse_day(&raw)
            .map(|d| Some(d.to_string()))
            .ok_or_else(|| validation(format!("invalid {}: use YYYY-MM-DD", key))),
    }
}

fn require_session(state: &AppState) -> Result<Session, HandlerErr> {
    state.session.clone().ok_or(HandlerErr {
        code: "unauthenticated",
        message: "no active session".to_string(),
        details: None,
    })
}

/// Status map from the mark request, checked against the enum and the
/// resolved roster before anything is written. Unknown student ids and
/// unknown statuses are both hard validation failures rather than being
/// silently defaulted.
fn parse_status_map(
    params: &serde_json::Value,
    roster: &[String],
) -> Result<HashMap<String, String>, HandlerErr> {
    let Some(raw) = params.get("attendance").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing attendance map"));
    };
    let roster_set: HashSet<&str> = roster.iter().map(|s| s.as_str()).collect();
    let mut map = HashMap::new();
    for (student_id, value) in raw {
        if !roster_set.contains(student_id.as_str()) {
            return Err(validation(format!(
                "student not in class/section roster: {}",
                student_id
            )));
        }
        let Some(status) = value.as_str() else {
            return Err(validation(format!("status for {} must be a string", student_id)));
        };
        if !attendance::is_valid_status(status) {
            return Err(validation(format!(
                "invalid status '{}': allowed values are {}",
                status,
                attendance::STATUSES.join(", ")
            )));
        }
        map.insert(student_id.clone(), status.to_string());
    }
    Ok(map)
}

fn attendance_mark(
    conn: &Connection,
    session: &Session,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if session.role != "admin" {
        return Err(HandlerErr {
            code: "forbidden",
            message: "marking attendance requires the admin role".to_string(),
            details: None,
        });
    }
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let date = parse_required_day(params, "date")?;

    let roster = attendance::resolve_roster(conn, &class_id, &section_id)
        .map_err(|e| db_err("db_query_failed", e))?;
    if roster.is_empty() {
        return Err(HandlerErr {
            code: "no_roster_found",
            message: "no students found for the selected class and section".to_string(),
            details: None,
        });
    }

    let requested = parse_status_map(params, &roster)?;

    let ctx = MarkContext {
        class_id: &class_id,
        section_id: &section_id,
        date: &date,
        marked_by: &session.user_id,
    };
    let written = attendance::reconcile(conn, &ctx, &roster, &requested)
        .map_err(|e| db_err("db_update_failed", e))?;

    Ok(json!({
        "message": "attendance marked successfully",
        "written": written,
        "rosterSize": roster.len(),
    }))
}

fn attendance_by_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_opt_str(params, "sectionId");
    let day = parse_opt_day(params, "date")?;

    let rows = attendance::find_by_class(conn, &class_id, section_id.as_deref(), day.as_deref())
        .map_err(|e| db_err("db_query_failed", e))?;
    let records: Vec<serde_json::Value> = rows.iter().map(|r| r.to_json()).collect();
    Ok(json!({ "records": records }))
}

fn attendance_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let start = parse_opt_day(params, "startDate")?;
    let end = parse_opt_day(params, "endDate")?;

    let rows = attendance::find_by_student(conn, &student_id, start.as_deref(), end.as_deref())
        .map_err(|e| db_err("db_query_failed", e))?;
    let records: Vec<serde_json::Value> = rows.iter().map(|r| r.to_json()).collect();
    Ok(json!({ "records": records }))
}

fn attendance_statistics(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let start = parse_opt_day(params, "startDate")?;
    let end = parse_opt_day(params, "endDate")?;

    let student_id = get_opt_str(params, "studentId");
    let class_id = get_opt_str(params, "classId");
    let section_id = get_opt_str(params, "sectionId");

    let subject = if let Some(sid) = student_id.as_deref() {
        StatsSubject::Student(sid)
    } else if let Some(cid) = class_id.as_deref() {
        StatsSubject::Class {
            class_id: cid,
            section_id: section_id.as_deref(),
        }
    } else {
        return Err(bad_params("either studentId or classId is required"));
    };

    let stats = attendance::statistics(conn, subject, start.as_deref(), end.as_deref())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(json!({
        "total": stats.total,
        "present": stats.present,
        "absent": stats.absent,
        "late": stats.late,
        "excused": stats.excused,
        "percentage": stats.percentage,
    }))
}

fn attendance_reports(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_opt_str(params, "classId");
    let section_id = get_opt_str(params, "sectionId");

    // The reporting period defaults to "this month".
    let (month_start, month_end) = attendance::month_bounds(Local::now().date_naive());
    let start = parse_opt_day(params, "startDate")?.unwrap_or_else(|| month_start.to_string());
    let end = parse_opt_day(params, "endDate")?.unwrap_or_else(|| month_end.to_string());

    let rows = attendance::report(
        conn,
        class_id.as_deref(),
        section_id.as_deref(),
        &start,
        &end,
    )
    .map_err(|e| db_err("db_query_failed", e))?;
    let records: Vec<serde_json::Value> = rows.iter().map(|r| r.to_json()).collect();
    Ok(json!({
        "startDate": start,
        "endDate": end,
        "records": records,
    }))
}

fn attendance_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "attendanceId")?;
    let status = get_required_str(params, "status")?;
    if !attendance::is_valid_status(&status) {
        return Err(validation(format!(
            "invalid status '{}': allowed values are {}",
            status,
            attendance::STATUSES.join(", ")
        )));
    }

    let updated = attendance::update_status(conn, &id, &status)
        .map_err(|e| db_err("db_update_failed", e))?;
    match updated {
        Some(row) => Ok(json!({ "record": row.to_json() })),
        None => Err(HandlerErr {
            code: "not_found",
            message: "attendance record not found".to_string(),
            details: None,
        }),
    }
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Session, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let session = match require_session(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &session, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(with_conn(state, req, |c, s, p| attendance_mark(c, s, p))),
        "attendance.byClass" => Some(with_conn(state, req, |c, _, p| attendance_by_class(c, p))),
        "attendance.byStudent" => {
            Some(with_conn(state, req, |c, _, p| attendance_by_student(c, p)))
        }
        "attendance.statistics" => {
            Some(with_conn(state, req, |c, _, p| attendance_statistics(c, p)))
        }
        "attendance.reports" => Some(with_conn(state, req, |c, _, p| attendance_reports(c, p))),
        "attendance.update" => Some(with_conn(state, req, |c, _, p| attendance_update(c, p))),
        _ => None,
    }
}
