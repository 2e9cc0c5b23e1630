use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Session};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

// The auth layer in front of this daemon verifies credentials; it hands the
// resulting actor identity and role over here. Until it does, attendance
// methods refuse to run.
fn handle_session_begin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing userId", None),
    };
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_ascii_lowercase(),
        _ => return err(&req.id, "bad_params", "missing role", None),
    };
    state.session = Some(Session {
        user_id: user_id.clone(),
        role: role.clone(),
    });
    ok(&req.id, json!({ "userId": user_id, "role": role }))
}

fn handle_session_end(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.begin" => Some(handle_session_begin(state, req)),
        "session.end" => Some(handle_session_end(state, req)),
        _ => None,
    }
}
