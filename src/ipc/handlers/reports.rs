use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rules::{self, ReportStatus, Role};
use crate::storage;
use chrono::{Datelike, Local};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

fn opt_trimmed(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Year/month can arrive as strings (form fields) or numbers. Missing values
/// default to the current month, matching the submission screen's initial
/// state.
fn parse_target_ym(params: &serde_json::Value) -> Result<i64, String> {
    let as_i64 = |key: &str| -> Result<Option<i64>, String> {
        match params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => {
                if let Some(n) = v.as_i64() {
                    return Ok(Some(n));
                }
                match v.as_str().map(str::trim) {
                    Some("") | None => Ok(None),
                    Some(s) => s
                        .parse::<i64>()
                        .map(Some)
                        .map_err(|_| format!("invalid {}", key)),
                }
            }
        }
    };

    let now = Local::now();
    let year = as_i64("targetYear")?.unwrap_or(now.year() as i64);
    let month = as_i64("targetMonth")?.unwrap_or(now.month() as i64);

    if !(1..=9999).contains(&year) {
        return Err("invalid targetYear".to_string());
    }
    if !(1..=12).contains(&month) {
        return Err("invalid targetMonth".to_string());
    }
    Ok(year * 100 + month)
}

fn user_has_role(
    conn: &Connection,
    user_id: &str,
    role: Role,
) -> Result<bool, rusqlite::Error> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM user_roles WHERE user_id = ? AND role = ?",
            params![user_id, role.as_code()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn handle_reports_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(applicant_id) = opt_trimmed(&req.params, "applicantId") else {
        return err(&req.id, "bad_params", "missing applicantId", None);
    };
    let target_ym = match parse_target_ym(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(file_path) = opt_trimmed(&req.params, "filePath") else {
        return err(&req.id, "bad_params", "missing filePath", None);
    };

    let applicant_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM users WHERE user_id = ?",
            [&applicant_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if applicant_exists.is_none() {
        return err(&req.id, "not_found", "applicant not found", None);
    }
    match user_has_role(conn, &applicant_id, Role::Applicant) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_applicant",
                format!("user {} does not hold the applicant role", applicant_id),
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let approvers = [
        opt_trimmed(&req.params, "approver1Id"),
        opt_trimmed(&req.params, "approver2Id"),
        opt_trimmed(&req.params, "approver3Id"),
    ];

    // A submitter is by definition an applicant, so the escalation slot is
    // mandatory here.
    if let Err(e) = rules::validate_approval_route(
        true,
        approvers[0].as_deref(),
        approvers[1].as_deref(),
        approvers[2].as_deref(),
    ) {
        return match e {
            rules::RouteError::DuplicateApprover => {
                err(&req.id, "duplicate_approver", e.to_string(), None)
            }
            rules::RouteError::MissingRequiredApprover => {
                err(&req.id, "missing_required_approver", e.to_string(), None)
            }
        };
    }

    // Upload must exist and be non-empty before anything is written.
    let src = PathBuf::from(&file_path);
    match std::fs::metadata(&src) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        Ok(_) => return err(&req.id, "empty_file", "upload file is empty", None),
        Err(e) => {
            return err(
                &req.id,
                "empty_file",
                format!("upload file not readable: {}", e),
                None,
            )
        }
    }

    // Stage the copy first; the prior month's file stays live until the
    // row commit succeeds.
    let staged = match storage::stage_report_file(workspace, &applicant_id, target_ym, &src) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "file_copy_failed", format!("{e:?}"), None),
    };

    let status = rules::initial_report_status(
        approvers[0].as_deref(),
        approvers[1].as_deref(),
        approvers[2].as_deref(),
    );
    let report_id = Uuid::new_v4().to_string();
    let submitted_at = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => {
            storage::discard_staged(workspace, &staged);
            return err(&req.id, "db_tx_failed", e.to_string(), None);
        }
    };

    // Resubmission replaces the prior report for the same month wholesale.
    if let Err(e) = tx.execute(
        "DELETE FROM reports WHERE applicant_id = ? AND target_ym = ?",
        params![&applicant_id, target_ym],
    ) {
        let _ = tx.rollback();
        storage::discard_staged(workspace, &staged);
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "reports" })),
        );
    }

    if let Err(e) = tx.execute(
        "INSERT INTO reports(
            id, applicant_id, target_ym, submitted_at,
            approver1_id, approver2_id, approver3_id,
            status, file_path, checksum
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            &report_id,
            &applicant_id,
            target_ym,
            &submitted_at,
            &approvers[0],
            &approvers[1],
            &approvers[2],
            status.as_code(),
            &staged.rel_path,
            &staged.checksum
        ],
    ) {
        let _ = tx.rollback();
        storage::discard_staged(workspace, &staged);
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "reports" })),
        );
    }

    if let Err(e) = tx.commit() {
        storage::discard_staged(workspace, &staged);
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    if let Err(e) = storage::promote_staged(workspace, &staged) {
        return err(&req.id, "file_copy_failed", format!("{e:?}"), None);
    }

    ok(
        &req.id,
        json!({
            "reportId": report_id,
            "status": status.as_code(),
            "storedPath": staged.rel_path
        }),
    )
}

fn handle_reports_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(
            &req.id,
            json!({ "reports": [], "totalCount": 0, "page": 1, "pageSize": 20 }),
        );
    };

    let mut where_clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if let Some(v) = opt_trimmed(&req.params, "applicantId") {
        where_clauses.push("applicant_id = ?");
        args.push(Value::Text(v));
    }
    if let Some(v) = opt_trimmed(&req.params, "approverId") {
        where_clauses.push("(approver1_id = ? OR approver2_id = ? OR approver3_id = ?)");
        args.push(Value::Text(v.clone()));
        args.push(Value::Text(v.clone()));
        args.push(Value::Text(v));
    }
    if let Some(v) = opt_trimmed(&req.params, "status") {
        if ReportStatus::from_code(&v).is_none() {
            return err(&req.id, "bad_params", format!("unknown status: {}", v), None);
        }
        where_clauses.push("status = ?");
        args.push(Value::Text(v));
    }
    if let Some(v) = req.params.get("targetYmFrom").and_then(|v| v.as_i64()) {
        where_clauses.push("target_ym >= ?");
        args.push(Value::Integer(v));
    }
    if let Some(v) = req.params.get("targetYmTo").and_then(|v| v.as_i64()) {
        where_clauses.push("target_ym <= ?");
        args.push(Value::Integer(v));
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_clauses.join(" AND "))
    };

    let total: i64 = match conn.query_row(
        &format!("SELECT COUNT(*) FROM reports{}", where_sql),
        params_from_iter(args.iter()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let page = req
        .params
        .get("page")
        .and_then(|v| v.as_i64())
        .filter(|p| *p >= 1)
        .unwrap_or(1);
    let page_size = req
        .params
        .get("pageSize")
        .and_then(|v| v.as_i64())
        .filter(|s| (1..=200).contains(s))
        .unwrap_or(20);

    let mut stmt = match conn.prepare(&format!(
        "SELECT id, applicant_id, target_ym, submitted_at,
                approver1_id, approver2_id, approver3_id, status, file_path
         FROM reports{}
         ORDER BY target_ym DESC, applicant_id
         LIMIT ? OFFSET ?",
        where_sql
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut page_args = args;
    page_args.push(Value::Integer(page_size));
    page_args.push(Value::Integer((page - 1) * page_size));

    let rows = stmt
        .query_map(params_from_iter(page_args.iter()), |row| {
            let id: String = row.get(0)?;
            let applicant_id: String = row.get(1)?;
            let target_ym: i64 = row.get(2)?;
            let submitted_at: String = row.get(3)?;
            let approver1: Option<String> = row.get(4)?;
            let approver2: Option<String> = row.get(5)?;
            let approver3: Option<String> = row.get(6)?;
            let status: String = row.get(7)?;
            let file_path: String = row.get(8)?;
            Ok(json!({
                "reportId": id,
                "applicantId": applicant_id,
                "targetYm": target_ym,
                "submittedAt": submitted_at,
                "approver1Id": approver1,
                "approver2Id": approver2,
                "approver3Id": approver3,
                "status": status,
                "filePath": file_path
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(reports) => ok(
            &req.id,
            json!({
                "reports": reports,
                "totalCount": total,
                "page": page,
                "pageSize": page_size
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_reports_approve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(report_id) = opt_trimmed(&req.params, "reportId") else {
        return err(&req.id, "bad_params", "missing reportId", None);
    };
    let Some(approver_id) = opt_trimmed(&req.params, "approverId") else {
        return err(&req.id, "bad_params", "missing approverId", None);
    };

    let row = match conn
        .query_row(
            "SELECT status, approver1_id, approver2_id, approver3_id
             FROM reports WHERE id = ?",
            [&report_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((status_code, approver1, approver2, approver3)) = row else {
        return err(&req.id, "not_found", "report not found", None);
    };

    let Some(status) = ReportStatus::from_code(&status_code) else {
        return err(
            &req.id,
            "db_query_failed",
            format!("stored status is unknown: {}", status_code),
            None,
        );
    };

    let expected = match status.pending_slot() {
        Some(1) => approver1.as_deref(),
        Some(2) => approver2.as_deref(),
        Some(3) => approver3.as_deref(),
        _ => None,
    };
    if expected != Some(approver_id.as_str()) {
        return err(
            &req.id,
            "not_pending_for_user",
            format!("report is not awaiting approval by {}", approver_id),
            None,
        );
    }

    let next = rules::next_status_after_approval(status, approver2.as_deref(), approver3.as_deref());

    if let Err(e) = conn.execute(
        "UPDATE reports SET status = ? WHERE id = ?",
        params![next.as_code(), &report_id],
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "reports" })),
        );
    }

    ok(
        &req.id,
        json!({ "reportId": report_id, "status": next.as_code() }),
    )
}

fn handle_reports_attachment_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(report_id) = opt_trimmed(&req.params, "reportId") else {
        return err(&req.id, "bad_params", "missing reportId", None);
    };
    let Some(out_path) = opt_trimmed(&req.params, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    let row = match conn
        .query_row(
            "SELECT file_path, checksum FROM reports WHERE id = ?",
            [&report_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((rel_path, checksum)) = row else {
        return err(&req.id, "not_found", "report not found", None);
    };

    match storage::export_report_file(
        workspace,
        &rel_path,
        checksum.as_deref(),
        &PathBuf::from(&out_path),
    ) {
        Ok(bytes) => ok(
            &req.id,
            json!({ "outPath": out_path, "bytes": bytes }),
        ),
        Err(e) => {
            let msg = format!("{e:?}");
            if msg.contains("checksum mismatch") {
                err(&req.id, "checksum_mismatch", msg, None)
            } else if msg.contains("not found") {
                err(&req.id, "not_found", msg, None)
            } else {
                err(&req.id, "file_copy_failed", msg, None)
            }
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.submit" => Some(handle_reports_submit(state, req)),
        "reports.search" => Some(handle_reports_search(state, req)),
        "reports.approve" => Some(handle_reports_approve(state, req)),
        "reports.attachment.export" => Some(handle_reports_attachment_export(state, req)),
        _ => None,
    }
}
