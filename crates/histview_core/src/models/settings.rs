//! Per-project viewer settings.

use std::collections::BTreeMap;

use crate::error::HistoryError;
use crate::models::connection::ConnectionDescriptor;
use crate::models::event::TableRef;
use crate::services::host::ProjectStore;

/// Scope under which every entry is stored in the project.
pub const SETTINGS_SCOPE: &str = "HistoryViewer";

const KEY_DB_CONNECTION: &str = "db_connection";
const KEY_AUDIT_TABLE: &str = "audit_table";
const KEY_REPLAY_FUNCTION: &str = "replay_function";
const KEY_TABLE_MAP: &str = "table_map";

/// A layer of the table map that the host still has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedLayer {
    pub id: String,
    pub name: String,
    pub table: TableRef,
}

/// What the project remembers about its audit log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSettings {
    /// libpq connection string of the audited database
    pub db_connection: String,
    /// `schema.table` of the audit log
    pub audit_table: String,
    /// Stored procedure replaying one event, if replay is enabled
    pub replay_function: Option<String>,
    /// Layer id → audited table shown by that layer
    pub table_map: BTreeMap<String, TableRef>,
}

impl ProjectSettings {
    /// Read the settings from the project store. Missing entries are empty.
    pub fn load(store: &dyn ProjectStore) -> Result<Self, HistoryError> {
        let db_connection = store.read_entry(SETTINGS_SCOPE, KEY_DB_CONNECTION)?.unwrap_or_default();
        let audit_table = store.read_entry(SETTINGS_SCOPE, KEY_AUDIT_TABLE)?.unwrap_or_default();
        let replay_function = store
            .read_entry(SETTINGS_SCOPE, KEY_REPLAY_FUNCTION)?
            .filter(|f| !f.trim().is_empty());

        let mut table_map = BTreeMap::new();
        for entry in store.read_list_entry(SETTINGS_SCOPE, KEY_TABLE_MAP)? {
            match entry.split_once('=') {
                Some((layer_id, table)) => match TableRef::parse(table) {
                    Ok(table) => {
                        table_map.insert(layer_id.to_string(), table);
                    }
                    Err(e) => tracing::warn!(entry = %entry, error = %e, "Skipping table map entry"),
                },
                None => tracing::warn!(entry = %entry, "Skipping table map entry without '='"),
            }
        }

        Ok(Self { db_connection, audit_table, replay_function, table_map })
    }

    /// Write every entry back to the project store.
    pub fn save(&self, store: &dyn ProjectStore) -> Result<(), HistoryError> {
        store.write_entry(SETTINGS_SCOPE, KEY_DB_CONNECTION, &self.db_connection)?;
        store.write_entry(SETTINGS_SCOPE, KEY_AUDIT_TABLE, &self.audit_table)?;
        store.write_entry(
            SETTINGS_SCOPE,
            KEY_REPLAY_FUNCTION,
            self.replay_function.as_deref().unwrap_or(""),
        )?;
        let table_map: Vec<String> =
            self.table_map.iter().map(|(layer, table)| format!("{layer}={table}")).collect();
        store.write_list_entry(SETTINGS_SCOPE, KEY_TABLE_MAP, &table_map)?;
        Ok(())
    }

    /// Parsed connection descriptor; a config error when none is set.
    pub fn descriptor(&self) -> Result<ConnectionDescriptor, HistoryError> {
        if self.db_connection.trim().is_empty() {
            return Err(HistoryError::config(
                "No database configuration has been found, please configure the project",
            ));
        }
        ConnectionDescriptor::parse(&self.db_connection)
    }

    /// Parsed audit table; a config error when none is set.
    pub fn audit_table_ref(&self) -> Result<TableRef, HistoryError> {
        if self.audit_table.trim().is_empty() {
            return Err(HistoryError::config("No audit table has been configured"));
        }
        TableRef::parse(&self.audit_table)
    }
}
