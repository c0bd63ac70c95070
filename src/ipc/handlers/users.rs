use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rules::{self, Role, RoleSet};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::json;

/// One user submission as it arrives over the pipe, trimmed and normalized.
/// Empty approver slots are kept as None throughout.
struct SubmittedUser {
    user_id: String,
    user_name: String,
    department: Option<String>,
    roles: RoleSet,
    approvers: [Option<String>; 3],
}

fn opt_trimmed(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_submitted_user(params: &serde_json::Value) -> Result<SubmittedUser, String> {
    let user_id = opt_trimmed(params, "userId").ok_or("missing userId")?;
    let user_name = opt_trimmed(params, "userName").ok_or("missing userName")?;
    let department = opt_trimmed(params, "department");

    let flag = |key: &str| params.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
    let roles = RoleSet::from_flags(
        flag("roleApplicant"),
        flag("roleApprover"),
        flag("roleAdmin"),
    );

    let approvers = [
        opt_trimmed(params, "approver1Id"),
        opt_trimmed(params, "approver2Id"),
        opt_trimmed(params, "approver3Id"),
    ];

    Ok(SubmittedUser {
        user_id,
        user_name,
        department,
        roles,
        approvers,
    })
}

fn route_error_response(id: &str, e: rules::RouteError) -> serde_json::Value {
    match e {
        rules::RouteError::DuplicateApprover => {
            err(id, "duplicate_approver", e.to_string(), None)
        }
        rules::RouteError::MissingRequiredApprover => {
            err(id, "missing_required_approver", e.to_string(), None)
        }
    }
}

fn slot(submitted: &SubmittedUser, i: usize) -> Option<&str> {
    submitted.approvers[i].as_deref()
}

/// Delete-all-then-insert-all for both child sets of a user, inside the
/// caller's transaction. The approval flow always gets exactly three rows
/// (seq 1..3); empty slots are inserted as NULL. Roles get one row per
/// member of the set. Never diffed: replay with the same input is a no-op
/// in terms of stored state.
fn replace_user_children(
    tx: &Transaction,
    submitted: &SubmittedUser,
) -> Result<(), (&'static str, String, &'static str)> {
    tx.execute(
        "DELETE FROM user_approve_flows WHERE user_id = ?",
        [&submitted.user_id],
    )
    .map_err(|e| ("db_delete_failed", e.to_string(), "user_approve_flows"))?;

    for (i, approver) in submitted.approvers.iter().enumerate() {
        tx.execute(
            "INSERT INTO user_approve_flows(user_id, approve_seq, approver_id) VALUES(?, ?, ?)",
            params![&submitted.user_id, (i + 1) as i64, approver],
        )
        .map_err(|e| ("db_insert_failed", e.to_string(), "user_approve_flows"))?;
    }

    tx.execute(
        "DELETE FROM user_roles WHERE user_id = ?",
        [&submitted.user_id],
    )
    .map_err(|e| ("db_delete_failed", e.to_string(), "user_roles"))?;

    for role in submitted.roles.iter() {
        tx.execute(
            "INSERT INTO user_roles(user_id, role) VALUES(?, ?)",
            params![&submitted.user_id, role.as_code()],
        )
        .map_err(|e| ("db_insert_failed", e.to_string(), "user_roles"))?;
    }

    Ok(())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn handle_users_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let submitted = match parse_submitted_user(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    // Best-effort pre-check; the primary key is the real backstop.
    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM users WHERE user_id = ?",
            [&submitted.user_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_some() {
        return err(
            &req.id,
            "duplicate_user_id",
            format!("user {} already exists", submitted.user_id),
            None,
        );
    }

    if let Err(e) = rules::validate_approval_route(
        submitted.roles.applicant,
        slot(&submitted, 0),
        slot(&submitted, 1),
        slot(&submitted, 2),
    ) {
        return route_error_response(&req.id, e);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "INSERT INTO users(user_id, user_name, department, version) VALUES(?, ?, ?, 1)",
        params![
            &submitted.user_id,
            &submitted.user_name,
            &submitted.department
        ],
    ) {
        let _ = tx.rollback();
        if is_constraint_violation(&e) {
            // Lost the pre-check race; same outcome for the caller.
            return err(
                &req.id,
                "duplicate_user_id",
                format!("user {} already exists", submitted.user_id),
                None,
            );
        }
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    if let Err((code, msg, table)) = replace_user_children(&tx, &submitted) {
        let _ = tx.rollback();
        return err(&req.id, code, msg, Some(json!({ "table": table })));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "userId": submitted.user_id, "version": 1 }))
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let submitted = match parse_submitted_user(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let Some(version) = req.params.get("version").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing version", None);
    };

    if let Err(e) = rules::validate_approval_route(
        submitted.roles.applicant,
        slot(&submitted, 0),
        slot(&submitted, 1),
        slot(&submitted, 2),
    ) {
        return route_error_response(&req.id, e);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Optimistic concurrency: the stamp must still match, and the update
    // bumps it so the next writer sees a fresh value.
    let changed = match tx.execute(
        "UPDATE users
         SET user_name = ?, department = ?, version = version + 1
         WHERE user_id = ? AND version = ?",
        params![
            &submitted.user_name,
            &submitted.department,
            &submitted.user_id,
            version
        ],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            );
        }
    };

    if changed == 0 {
        let stored: Option<i64> = match tx
            .query_row(
                "SELECT version FROM users WHERE user_id = ?",
                [&submitted.user_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        let _ = tx.rollback();
        return match stored {
            Some(current) => err(
                &req.id,
                "version_conflict",
                "user was modified by someone else",
                Some(json!({ "submittedVersion": version, "currentVersion": current })),
            ),
            None => err(&req.id, "not_found", "user not found", None),
        };
    }

    if let Err((code, msg, table)) = replace_user_children(&tx, &submitted) {
        let _ = tx.rollback();
        return err(&req.id, code, msg, Some(json!({ "table": table })));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "userId": submitted.user_id, "version": version + 1 }),
    )
}

fn load_role_set(conn: &Connection, user_id: &str) -> Result<RoleSet, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT role FROM user_roles WHERE user_id = ?")?;
    let codes = stmt
        .query_map([user_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut set = RoleSet::default();
    for code in codes {
        if let Some(role) = Role::from_code(&code) {
            set.insert(role);
        }
    }
    Ok(set)
}

fn load_approver_slots(
    conn: &Connection,
    user_id: &str,
) -> Result<[Option<String>; 3], rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT approve_seq, approver_id FROM user_approve_flows
         WHERE user_id = ? ORDER BY approve_seq",
    )?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut slots: [Option<String>; 3] = [None, None, None];
    for (seq, approver) in rows {
        if (1..=3).contains(&seq) {
            slots[(seq - 1) as usize] = approver;
        }
    }
    Ok(slots)
}

fn handle_users_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(user_id) = req.params.get("userId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing userId", None);
    };

    let row = match conn
        .query_row(
            "SELECT user_name, department, version FROM users WHERE user_id = ?",
            [user_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((user_name, department, version)) = row else {
        return err(&req.id, "not_found", "user not found", None);
    };

    let roles = match load_role_set(conn, user_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let slots = match load_approver_slots(conn, user_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "userId": user_id,
            "userName": user_name,
            "department": department,
            "version": version,
            "roleApplicant": roles.applicant,
            "roleApprover": roles.approver,
            "roleAdmin": roles.admin,
            "approver1Id": slots[0],
            "approver2Id": slots[1],
            "approver3Id": slots[2],
        }),
    )
}

fn page_params(params: &serde_json::Value) -> (i64, i64) {
    let page = params
        .get("page")
        .and_then(|v| v.as_i64())
        .filter(|p| *p >= 1)
        .unwrap_or(1);
    let page_size = params
        .get("pageSize")
        .and_then(|v| v.as_i64())
        .filter(|s| (1..=200).contains(s))
        .unwrap_or(20);
    (page, page_size)
}

fn handle_users_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(
            &req.id,
            json!({ "users": [], "totalCount": 0, "page": 1, "pageSize": 20 }),
        );
    };

    let mut where_clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    for (key, clause) in [
        ("userId", "user_id LIKE '%' || ? || '%'"),
        ("userName", "user_name LIKE '%' || ? || '%'"),
        ("department", "department LIKE '%' || ? || '%'"),
    ] {
        if let Some(v) = opt_trimmed(&req.params, key) {
            where_clauses.push(clause);
            args.push(Value::Text(v));
        }
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_clauses.join(" AND "))
    };

    let total: i64 = match conn.query_row(
        &format!("SELECT COUNT(*) FROM users{}", where_sql),
        params_from_iter(args.iter()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (page, page_size) = page_params(&req.params);

    let mut stmt = match conn.prepare(&format!(
        "SELECT user_id, user_name, department, version FROM users{}
         ORDER BY user_id LIMIT ? OFFSET ?",
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
            let user_id: String = row.get(0)?;
            let user_name: String = row.get(1)?;
            let department: Option<String> = row.get(2)?;
            let version: i64 = row.get(3)?;
            Ok(json!({
                "userId": user_id,
                "userName": user_name,
                "department": department,
                "version": version
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(
            &req.id,
            json!({
                "users": users,
                "totalCount": total,
                "page": page,
                "pageSize": page_size
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_approver_options(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "options": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT u.user_id, u.user_name
         FROM users u
         JOIN user_roles r ON r.user_id = u.user_id
         WHERE r.role = ?
         ORDER BY u.user_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([Role::Approver.as_code()], |row| {
            let user_id: String = row.get(0)?;
            let user_name: String = row.get(1)?;
            Ok(json!({ "userId": user_id, "userName": user_name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(options) => ok(&req.id, json!({ "options": options })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.register" => Some(handle_users_register(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.get" => Some(handle_users_get(state, req)),
        "users.search" => Some(handle_users_search(state, req)),
        "users.approverOptions" => Some(handle_users_approver_options(state, req)),
        _ => None,
    }
}
