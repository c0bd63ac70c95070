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

fn seed_reports(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) {
    for (i, user_id) in ["P001", "P002"].iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("u{}", i),
            "users.register",
            json!({
                "userId": user_id,
                "userName": format!("Applicant {}", user_id),
                "roleApplicant": true,
                "approver3Id": "APR3"
            }),
        );
    }

    let file = workspace.join("body.txt");
    std::fs::write(&file, b"monthly").expect("write report file");
    let file = file.to_string_lossy().to_string();

    // P001: five months; P002: two months with approver APRX in slot 1.
    for month in 1..=5 {
        let _ = request_ok(
            stdin,
            reader,
            &format!("s1-{}", month),
            "reports.submit",
            json!({
                "applicantId": "P001",
                "targetYear": 2026,
                "targetMonth": month,
                "approver3Id": "APR3",
                "filePath": file
            }),
        );
    }
    for month in 1..=2 {
        let _ = request_ok(
            stdin,
            reader,
            &format!("s2-{}", month),
            "reports.submit",
            json!({
                "applicantId": "P002",
                "targetYear": 2026,
                "targetMonth": month,
                "approver1Id": "APRX",
                "approver3Id": "APR3",
                "filePath": file
            }),
        );
    }
}

#[test]
fn search_filters_by_applicant_approver_and_status() {
    let workspace = temp_dir("rmsd-search-filters");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_reports(&mut stdin, &mut reader, &workspace);

    let by_applicant = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.search",
        json!({ "applicantId": "P001" }),
    );
    assert_eq!(by_applicant.get("totalCount").and_then(|v| v.as_i64()), Some(5));

    let by_approver = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.search",
        json!({ "approverId": "APRX" }),
    );
    assert_eq!(by_approver.get("totalCount").and_then(|v| v.as_i64()), Some(2));

    let by_status = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.search",
        json!({ "status": "pending_l1" }),
    );
    assert_eq!(by_status.get("totalCount").and_then(|v| v.as_i64()), Some(2));

    let by_range = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.search",
        json!({ "targetYmFrom": 202602, "targetYmTo": 202603 }),
    );
    assert_eq!(by_range.get("totalCount").and_then(|v| v.as_i64()), Some(3));
}

#[test]
fn search_pages_newest_month_first() {
    let workspace = temp_dir("rmsd-search-paging");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_reports(&mut stdin, &mut reader, &workspace);

    let page1 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.search",
        json!({ "page": 1, "pageSize": 3 }),
    );
    assert_eq!(page1.get("totalCount").and_then(|v| v.as_i64()), Some(7));
    assert_eq!(
        page1.get("reports").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(3)
    );
    assert_eq!(
        page1.pointer("/reports/0/targetYm").and_then(|v| v.as_i64()),
        Some(202605)
    );

    let page3 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.search",
        json!({ "page": 3, "pageSize": 3 }),
    );
    assert_eq!(
        page3.get("reports").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
    assert_eq!(
        page3.pointer("/reports/0/targetYm").and_then(|v| v.as_i64()),
        Some(202601)
    );
}

#[test]
fn user_search_pages_and_filters() {
    let workspace = temp_dir("rmsd-user-search");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    for i in 1..=25 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("u{}", i),
            "users.register",
            json!({
                "userId": format!("S{:03}", i),
                "userName": format!("Staff {:03}", i),
                "department": if i % 2 == 0 { "Sales" } else { "Engineering" },
                "roleApprover": i <= 3
            }),
        );
    }

    let page2 = request_ok(
        &mut stdin,
        &mut reader,
        "q1",
        "users.search",
        json!({ "page": 2 }),
    );
    assert_eq!(page2.get("totalCount").and_then(|v| v.as_i64()), Some(25));
    assert_eq!(
        page2.get("users").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(5)
    );
    assert_eq!(
        page2.pointer("/users/0/userId").and_then(|v| v.as_str()),
        Some("S021")
    );

    let sales = request_ok(
        &mut stdin,
        &mut reader,
        "q2",
        "users.search",
        json!({ "department": "Sales" }),
    );
    assert_eq!(sales.get("totalCount").and_then(|v| v.as_i64()), Some(12));

    let by_name = request_ok(
        &mut stdin,
        &mut reader,
        "q3",
        "users.search",
        json!({ "userName": "Staff 007" }),
    );
    assert_eq!(by_name.get("totalCount").and_then(|v| v.as_i64()), Some(1));

    let options = request_ok(
        &mut stdin,
        &mut reader,
        "q4",
        "users.approverOptions",
        json!({}),
    );
    let opts = options.get("options").and_then(|v| v.as_array()).expect("options");
    assert_eq!(opts.len(), 3);
    assert_eq!(
        opts[0].get("userId").and_then(|v| v.as_str()),
        Some("S001")
    );
}
