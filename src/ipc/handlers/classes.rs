use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn class_json(
    id: &str,
    name: &str,
    level: i64,
    capacity: Option<i64>,
) -> serde_json::Value {
    json!({ "id": id, "name": name, "level": level, "capacity": capacity })
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.name, c.level, c.capacity,
           (SELECT COUNT(*) FROM students s
            WHERE s.class_id = c.id AND s.deleted_at IS NULL) AS student_count
         FROM classes c
         WHERE c.deleted_at IS NULL
         ORDER BY c.level, c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let level: i64 = row.get(2)?;
            let capacity: Option<i64> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            let mut v = class_json(&id, &name, level, capacity);
            v["studentCount"] = json!(student_count);
            Ok(v)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let Some(level) = req.params.get("level").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing level", None);
    };
    let capacity = req.params.get("capacity").and_then(|v| v.as_i64());

    let class_id = Uuid::new_v4().to_string();
    let now = db::now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, level, capacity, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&class_id, &name, level, capacity, &now, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, class_json(&class_id, &name, level, capacity))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    let existing = conn
        .query_row(
            "SELECT name, level, capacity FROM classes WHERE id = ? AND deleted_at IS NULL",
            [&class_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional();
    let (mut name, mut level, mut capacity) = match existing {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(v) = req.params.get("name").and_then(|v| v.as_str()) {
        if v.trim().is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        name = v.trim().to_string();
    }
    if let Some(v) = req.params.get("level").and_then(|v| v.as_i64()) {
        level = v;
    }
    if let Some(v) = req.params.get("capacity").and_then(|v| v.as_i64()) {
        capacity = Some(v);
    }

    if let Err(e) = conn.execute(
        "UPDATE classes SET name = ?, level = ?, capacity = ?, updated_at = ? WHERE id = ?",
        (&name, level, capacity, &db::now_ts(), &class_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, class_json(&class_id, &name, level, capacity))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing classId", None),
    };

    // Soft delete; historical attendance keeps referencing the row.
    let changed = conn.execute(
        "UPDATE classes SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        (&db::now_ts(), &class_id),
    );
    match changed {
        Ok(0) => err(&req.id, "not_found", "class not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
