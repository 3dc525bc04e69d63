use std::path::{Path, PathBuf};

use anyhow::Context;
use rusqlite::Connection;
use serde::Deserialize;

use crate::db;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The open workspace. `db` is `None` while a bundle import holds the file.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Opens (creating if needed) the workspace at `path` and makes it current.
    /// On failure the previous workspace stays selected.
    pub fn open_workspace(&mut self, path: &Path) -> anyhow::Result<()> {
        let conn = db::open_db(path)
            .with_context(|| format!("failed to open workspace {}", path.display()))?;
        self.workspace = Some(path.to_path_buf());
        self.db = Some(conn);
        Ok(())
    }

    /// Releases the connection so the database file can be replaced.
    pub fn close_db(&mut self) {
        self.db = None;
    }

    /// Reconnects to the current workspace after `close_db`.
    pub fn reopen_current(&mut self) {
        if let Some(prev) = self.workspace.clone() {
            if let Err(e) = self.open_workspace(&prev) {
                tracing::error!(workspace = %prev.display(), error = %e, "reopen failed");
            }
        }
    }
}
