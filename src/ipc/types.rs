use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line from the host process: correlation id, dotted method
/// name (`users.register`, `reports.submit`, ...) and free-form params.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon state. A workspace is a directory holding the `rms.sqlite3`
/// master/report database and the `report_files/` attachment store; both
/// fields stay unset until `workspace.select` succeeds.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
