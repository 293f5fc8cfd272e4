use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};

fn path_param(req: &Request, key: &str) -> Option<PathBuf> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace_path) = state.workspace.as_deref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out_path) = path_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    match backup::export_workspace_archive(conn, workspace_path, &out_path) {
        Ok(export) => {
            info!(
                out = %out_path.display(),
                sha256 = %export.db_sha256,
                cycles = export.cycles.len(),
                "workspace exported"
            );
            ok(
                &req.id,
                json!({
                    "outPath": out_path.to_string_lossy(),
                    "bundleFormat": export.archive_format,
                    "entryCount": export.entry_count,
                    "dbSha256": export.db_sha256,
                    "cycles": export.cycles,
                }),
            )
        }
        Err(e) => {
            warn!(error = %e, "workspace export failed");
            err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path.to_string_lossy() })),
            )
        }
    }
}

/// Reopens the selected workspace after a failed swap so the session is
/// never left without a database.
fn reopen_selected(state: &mut AppState) {
    state.db = state.workspace.as_deref().and_then(|p| match db::open_db(p) {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!(workspace = %p.display(), error = %e, "workspace reopen failed");
            None
        }
    });
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(src) = path_param(req, "inPath") else {
        return err(&req.id, "bad_params", "missing inPath", None);
    };
    let Some(workspace_path) = path_param(req, "workspacePath").or_else(|| state.workspace.clone())
    else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "archive file not found",
            Some(json!({ "path": src.to_string_lossy() })),
        );
    }

    let staged = match backup::stage_workspace_archive(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %src.display(), error = %e, "workspace archive rejected");
            return err(
                &req.id,
                "invalid_archive",
                format!("{e:#}"),
                Some(json!({ "path": src.to_string_lossy() })),
            );
        }
    };
    let db_sha256 = staged.db_sha256.clone();
    let cycles = staged.cycles.clone();

    // Release the live handle before the file under it is replaced.
    state.db = None;
    if let Err(e) = staged.commit() {
        warn!(error = %e, "workspace import failed");
        reopen_selected(state);
        return err(&req.id, "io_failed", format!("{e:#}"), None);
    }

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            info!(
                workspace = %workspace_path.display(),
                cycles = cycles.len(),
                "workspace imported"
            );
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": backup::ARCHIVE_FORMAT_V1,
                    "dbSha256": db_sha256,
                    "cycles": cycles,
                }),
            )
        }
        Err(e) => {
            reopen_selected(state);
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        _ => None,
    }
}
