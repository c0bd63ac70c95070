use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rmsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn failed_role_insert_rolls_back_parent_and_flow_rows() {
    let workspace = temp_dir("rmsd-regist-rollback");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // Make the role insert fail mid-sequence. The parent row and the three
    // flow rows are written before roles, so they are the ones at risk.
    let db = Connection::open(workspace.join("rms.sqlite3")).expect("open workspace db");
    db.execute_batch(
        "CREATE TRIGGER block_role_inserts BEFORE INSERT ON user_roles
         BEGIN SELECT RAISE(ABORT, 'role inserts disabled'); END",
    )
    .expect("create trigger");

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "users.register",
        json!({
            "userId": "U900",
            "userName": "Hoshino",
            "roleApprover": true,
            "approver1Id": "A1"
        }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("db_insert_failed")
    );

    // No orphaned parent row, no stranded flow rows.
    let get = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.get",
        json!({ "userId": "U900" }),
    );
    assert_eq!(
        get.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );
    let flow_rows: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM user_approve_flows WHERE user_id = ?",
            ["U900"],
            |r| r.get(0),
        )
        .expect("count flow rows");
    assert_eq!(flow_rows, 0);

    // With the fault removed the same submission goes through cleanly.
    db.execute_batch("DROP TRIGGER block_role_inserts")
        .expect("drop trigger");
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "users.register",
        json!({
            "userId": "U900",
            "userName": "Hoshino",
            "roleApprover": true,
            "approver1Id": "A1"
        }),
    );
    assert_eq!(result.get("version").and_then(|v| v.as_i64()), Some(1));
}
