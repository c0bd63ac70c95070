use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rms.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            user_id TEXT PRIMARY KEY,
            user_name TEXT NOT NULL,
            department TEXT,
            version INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_roles(
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY(user_id, role),
            FOREIGN KEY(user_id) REFERENCES users(user_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_roles_role ON user_roles(role)",
        [],
    )?;

    // Always three rows per user (seq 1..3); empty slots persist as NULL.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_approve_flows(
            user_id TEXT NOT NULL,
            approve_seq INTEGER NOT NULL,
            approver_id TEXT,
            PRIMARY KEY(user_id, approve_seq),
            FOREIGN KEY(user_id) REFERENCES users(user_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_user_approve_flows_approver ON user_approve_flows(approver_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports(
            id TEXT PRIMARY KEY,
            applicant_id TEXT NOT NULL,
            target_ym INTEGER NOT NULL,
            submitted_at TEXT NOT NULL,
            approver1_id TEXT,
            approver2_id TEXT,
            approver3_id TEXT,
            status TEXT NOT NULL,
            file_path TEXT NOT NULL,
            checksum TEXT,
            UNIQUE(applicant_id, target_ym),
            FOREIGN KEY(applicant_id) REFERENCES users(user_id)
        )",
        [],
    )?;
    ensure_reports_checksum(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_applicant ON reports(applicant_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_target_ym ON reports(target_ym)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status)",
        [],
    )?;

    Ok(conn)
}

// Early workspaces stored reports without a checksum column. Add if needed.
fn ensure_reports_checksum(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "reports", "checksum")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE reports ADD COLUMN checksum TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
