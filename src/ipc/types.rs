use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of the edunityd protocol: the dashboard writes a JSON
/// object per line on stdin and reads one response line per request.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    /// Echoed verbatim so the client can match responses to requests.
    pub id: String,
    /// Dotted method name, e.g. `teacherLeads.create`.
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon-lifetime state. Both fields stay `None` until the client
/// selects a workspace; every data method guards on the connection.
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}
