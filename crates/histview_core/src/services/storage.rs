//! Local SQLite storage for project settings.
//!
//! Backs the [`ProjectStore`] contract when the viewer runs without a host
//! project file. Entries are kept per project name, scope and key; values
//! are JSON so string and string-list entries share one table.
//! Credentials are NOT stored here; they go through `CredentialService`.
//!
//! # Data Directory Locations
//!
//! - **macOS**: `~/Library/Application Support/dev.histview.HistoryViewer`
//! - **Windows**: `%APPDATA%\histview\HistoryViewer`
//! - **Linux**: `~/.local/share/histview`
//! - **Debug builds**: `./histview_data` in current directory

use crate::error::HistoryError;
use crate::services::host::ProjectStore;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Project name used when none is given.
pub const DEFAULT_PROJECT: &str = "default";

/// Get the default data directory for the application.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./histview_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| {
                #[cfg(target_os = "macos")]
                {
                    d.join("dev.histview.HistoryViewer")
                }
                #[cfg(target_os = "windows")]
                {
                    d.join("histview").join("HistoryViewer")
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    d.join("histview")
                }
            })
            .unwrap_or_else(|| PathBuf::from("./histview_data"))
    }
}

/// Initialize the data directory, creating it if needed.
pub fn init_data_dir(path: &Path) -> Result<(), HistoryError> {
    if path.exists() {
        if !path.is_dir() {
            return Err(HistoryError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        HistoryError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// SQLite-based project entry storage.
///
/// Thread-safe via internal Mutex. Uses WAL mode for concurrent reads.
pub struct LocalStorage {
    connection: Mutex<Connection>,
    data_dir: PathBuf,
    project: String,
}

impl LocalStorage {
    /// Open or create local storage in the given data directory.
    pub fn open(data_dir: PathBuf) -> Result<Self, HistoryError> {
        init_data_dir(&data_dir)?;
        let db_path = data_dir.join("histview.db");
        Self::open_with_path(db_path, data_dir)
    }

    /// Open storage with a specific database path.
    pub fn open_with_path(db_path: PathBuf, data_dir: PathBuf) -> Result<Self, HistoryError> {
        let connection = Connection::open(&db_path).map_err(|e| {
            HistoryError::storage(
                format!("Failed to open database '{}': {}", db_path.display(), e),
                Some("The database file may be corrupted. Try deleting it to start fresh."),
            )
        })?;

        Self::configure_connection(&connection)?;

        let storage = Self {
            connection: Mutex::new(connection),
            data_dir,
            project: DEFAULT_PROJECT.to_string(),
        };
        storage.run_migrations()?;

        tracing::info!(path = %db_path.display(), "Local storage opened");
        Ok(storage)
    }

    /// Use the entries of another project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn configure_connection(conn: &Connection) -> Result<(), HistoryError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .map_err(|e| HistoryError::storage(format!("Failed to configure database: {e}"), None))
    }

    fn run_migrations(&self) -> Result<(), HistoryError> {
        let conn = self.connection.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )
        .map_err(|e| {
            HistoryError::storage(format!("Failed to create migrations table: {e}"), None)
        })?;

        Self::migrate_schema(&conn)
    }

    fn migrate_schema(conn: &Connection) -> Result<(), HistoryError> {
        const DOMAIN: &str = "core";

        let current_step: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
                [DOMAIN],
                |row| row.get(0),
            )
            .unwrap_or(0);

        // Migration 1: Initial schema
        if current_step < 1 {
            conn.execute_batch(
                "
                CREATE TABLE project_entries (
                    project TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    key TEXT NOT NULL,
                    value_json TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY(project, scope, key)
                ) STRICT;
                ",
            )
            .map_err(|e| HistoryError::storage(format!("Migration 1 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'project_entries')",
                [DOMAIN],
            )
            .map_err(|e| HistoryError::storage(format!("Failed to record migration: {e}"), None))?;

            tracing::info!("Applied migration 1: project_entries");
        }

        Ok(())
    }

    fn write_value(&self, scope: &str, key: &str, value: serde_json::Value) -> Result<(), HistoryError> {
        let conn = self.connection.lock();
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(&value)
            .map_err(|e| HistoryError::storage(format!("Failed to encode entry: {e}"), None))?;

        conn.execute(
            "INSERT INTO project_entries (project, scope, key, value_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project, scope, key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at",
            params![self.project, scope, key, json, now],
        )
        .map_err(|e| HistoryError::storage(format!("Failed to save entry {scope}/{key}: {e}"), None))?;

        tracing::debug!(project = %self.project, scope, key, "Project entry saved");
        Ok(())
    }

    fn read_value(&self, scope: &str, key: &str) -> Result<Option<serde_json::Value>, HistoryError> {
        let conn = self.connection.lock();

        let result: Option<String> = conn
            .query_row(
                "SELECT value_json FROM project_entries WHERE project = ?1 AND scope = ?2 AND key = ?3",
                params![self.project, scope, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| {
                HistoryError::storage(format!("Failed to load entry {scope}/{key}: {e}"), None)
            })?;

        result
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| {
                    HistoryError::storage(format!("Invalid JSON in entry {scope}/{key}: {e}"), None)
                })
            })
            .transpose()
    }
}

impl ProjectStore for LocalStorage {
    fn read_entry(&self, scope: &str, key: &str) -> Result<Option<String>, HistoryError> {
        match self.read_value(scope, key)? {
            None => Ok(None),
            Some(serde_json::Value::String(value)) => Ok(Some(value)),
            Some(_) => Err(HistoryError::storage(
                format!("Entry {scope}/{key} is not a string"),
                None,
            )),
        }
    }

    fn write_entry(&self, scope: &str, key: &str, value: &str) -> Result<(), HistoryError> {
        self.write_value(scope, key, serde_json::Value::String(value.to_string()))
    }

    fn read_list_entry(&self, scope: &str, key: &str) -> Result<Vec<String>, HistoryError> {
        match self.read_value(scope, key)? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value).map_err(|e| {
                HistoryError::storage(format!("Entry {scope}/{key} is not a list: {e}"), None)
            }),
        }
    }

    fn write_list_entry(
        &self,
        scope: &str,
        key: &str,
        values: &[String],
    ) -> Result<(), HistoryError> {
        self.write_value(scope, key, serde_json::Value::from(values.to_vec()))
    }
}

impl std::fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorage")
            .field("data_dir", &self.data_dir)
            .field("project", &self.project)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProjectSettings, TableRef};
    use tempfile::tempdir;

    fn open(dir: &Path) -> LocalStorage {
        LocalStorage::open(dir.to_path_buf()).unwrap()
    }

    #[test]
    fn test_string_entries() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        assert_eq!(storage.read_entry("HistoryViewer", "audit_table").unwrap(), None);
        storage.write_entry("HistoryViewer", "audit_table", "audit.logged_actions").unwrap();
        storage.write_entry("HistoryViewer", "audit_table", "audit.events").unwrap();
        assert_eq!(
            storage.read_entry("HistoryViewer", "audit_table").unwrap().as_deref(),
            Some("audit.events")
        );
    }

    #[test]
    fn test_list_entries() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        assert!(storage.read_list_entry("HistoryViewer", "table_map").unwrap().is_empty());
        let values = vec!["a=public.roads".to_string(), "b=public.rivers".to_string()];
        storage.write_list_entry("HistoryViewer", "table_map", &values).unwrap();
        assert_eq!(storage.read_list_entry("HistoryViewer", "table_map").unwrap(), values);

        // A list is not a string entry.
        assert!(storage.read_entry("HistoryViewer", "table_map").is_err());
    }

    #[test]
    fn test_projects_are_isolated_and_persist() {
        let dir = tempdir().unwrap();
        {
            let storage = open(dir.path()).with_project("roads.qgz");
            storage.write_entry("HistoryViewer", "db_connection", "service=gis").unwrap();
        }

        let reopened = open(dir.path()).with_project("roads.qgz");
        assert_eq!(
            reopened.read_entry("HistoryViewer", "db_connection").unwrap().as_deref(),
            Some("service=gis")
        );
        let other = open(dir.path()).with_project("other.qgz");
        assert_eq!(other.read_entry("HistoryViewer", "db_connection").unwrap(), None);
    }

    #[test]
    fn test_migrations_run_once() {
        let dir = tempdir().unwrap();
        drop(open(dir.path()));
        let storage = open(dir.path());
        let steps: i64 = storage
            .connection
            .lock()
            .query_row("SELECT count(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(steps, 1);
    }

    #[test]
    fn test_project_settings_round_trip() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let mut settings = ProjectSettings {
            db_connection: "host=db dbname=gis".to_string(),
            audit_table: "audit.logged_actions".to_string(),
            replay_function: Some("audit.replay_event".to_string()),
            ..Default::default()
        };
        settings.table_map.insert("roads_1234".to_string(), TableRef::new("public", "roads"));
        settings.save(&storage).unwrap();

        let loaded = ProjectSettings::load(&storage).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.audit_table_ref().unwrap(), TableRef::new("audit", "logged_actions"));
    }

    #[test]
    fn test_settings_defaults_and_bad_map_entries() {
        let dir = tempdir().unwrap();
        let storage = open(dir.path());

        let empty = ProjectSettings::load(&storage).unwrap();
        assert!(empty.descriptor().is_err());
        assert!(empty.audit_table_ref().is_err());
        assert_eq!(empty.replay_function, None);

        storage
            .write_list_entry(
                "HistoryViewer",
                "table_map",
                &["ok=public.roads".to_string(), "no_equals".to_string(), "bad=roads".to_string()],
            )
            .unwrap();
        storage.write_entry("HistoryViewer", "replay_function", "").unwrap();
        let loaded = ProjectSettings::load(&storage).unwrap();
        assert_eq!(loaded.table_map.len(), 1);
        assert_eq!(loaded.replay_function, None);
    }
}
