use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn section_in_class(
    conn: &rusqlite::Connection,
    class_id: &str,
    section_id: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sections WHERE id = ? AND class_id = ? AND deleted_at IS NULL",
        (section_id, class_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission_no = match required_str(req, "admissionNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match section_in_class(conn, &class_id, &section_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "section not found in class", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // New students go to the end of the roster.
    let next_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students
         WHERE class_id = ? AND section_id = ?",
        (&class_id, &section_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, admission_no, first_name, last_name, class_id, section_id, sort_order, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &admission_no,
            &first_name,
            &last_name,
            &class_id,
            &section_id,
            next_order,
            &now,
            &now,
        ),
    ) {
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                return err(
                    &req.id,
                    "conflict",
                    format!("admission number already in use: {}", admission_no),
                    None,
                );
            }
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "id": student_id,
            "admissionNo": admission_no,
            "firstName": first_name,
            "lastName": last_name,
            "classId": class_id,
            "sectionId": section_id,
            "sortOrder": next_order,
        }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_id = req
        .params
        .get("sectionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT id, admission_no, first_name, last_name, section_id, sort_order
         FROM students WHERE class_id = ? AND deleted_at IS NULL",
    );
    if section_id.is_some() {
        sql.push_str(" AND section_id = ?");
    }
    sql.push_str(" ORDER BY sort_order, id");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map = |row: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "admissionNo": row.get::<_, String>(1)?,
            "firstName": row.get::<_, String>(2)?,
            "lastName": row.get::<_, String>(3)?,
            "classId": class_id,
            "sectionId": row.get::<_, String>(4)?,
            "sortOrder": row.get::<_, i64>(5)?,
        }))
    };
    let rows = match &section_id {
        Some(sid) => stmt
            .query_map((&class_id, sid), map)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&class_id], map)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let existing = conn
        .query_row(
            "SELECT first_name, last_name, class_id, section_id FROM students
             WHERE id = ? AND deleted_at IS NULL",
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional();
    let (mut first_name, mut last_name, mut class_id, mut section_id) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(v) = req.params.get("firstName").and_then(|v| v.as_str()) {
        if v.trim().is_empty() {
            return err(&req.id, "bad_params", "firstName must not be empty", None);
        }
        first_name = v.trim().to_string();
    }
    if let Some(v) = req.params.get("lastName").and_then(|v| v.as_str()) {
        if v.trim().is_empty() {
            return err(&req.id, "bad_params", "lastName must not be empty", None);
        }
        last_name = v.trim().to_string();
    }
    if let Some(v) = req.params.get("classId").and_then(|v| v.as_str()) {
        class_id = v.to_string();
    }
    if let Some(v) = req.params.get("sectionId").and_then(|v| v.as_str()) {
        section_id = v.to_string();
    }
    match section_in_class(conn, &class_id, &section_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "section not found in class", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Err(e) = conn.execute(
        "UPDATE students SET first_name = ?, last_name = ?, class_id = ?, section_id = ?, updated_at = ?
         WHERE id = ?",
        (
            &first_name,
            &last_name,
            &class_id,
            &section_id,
            &db::now_ts(),
            &student_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "id": student_id,
            "firstName": first_name,
            "lastName": last_name,
            "classId": class_id,
            "sectionId": section_id,
        }),
    )
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Soft delete: the student drops out of rosters and listings but their
    // attendance history stays queryable.
    let changed = conn.execute(
        "UPDATE students SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        (&db::now_ts(), &student_id),
    );
    match changed {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
