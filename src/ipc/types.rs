use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line-delimited request: caller-chosen id, dotted method name, and a
/// free-form params object.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon state: nothing until `workspace.select` opens the tracker db.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
