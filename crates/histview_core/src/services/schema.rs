//! Catalog lookups.
//!
//! Queries the PostGIS and PostgreSQL catalogs for geometry columns and for
//! the tables and functions that can serve as audit log and replay
//! procedure. Every column is cast to text so results come back through
//! [`ConnectionWrapper::query_text`].

use std::collections::HashMap;

use crate::error::HistoryError;
use crate::models::TableRef;
use crate::services::wrapper::ConnectionWrapper;

/// Columns a table needs to be usable as audit log.
const AUDIT_COLUMNS: [&str; 7] = [
    "event_id",
    "schema_name",
    "table_name",
    "action_tstamp_clk",
    "action",
    "row_data",
    "changed_fields",
];

/// Catalog queries.
pub struct SchemaService;

impl SchemaService {
    /// Geometry columns of a table, in catalog order. The first one is the
    /// table's primary geometry.
    pub fn geometry_columns(
        conn: &mut ConnectionWrapper,
        table: &TableRef,
    ) -> Result<Vec<String>, HistoryError> {
        let rows = conn.query_text(
            r#"
            SELECT f_geometry_column::text
            FROM geometry_columns
            WHERE f_table_schema = $1
              AND f_table_name = $2
            "#,
            &[table.schema.as_str(), table.table.as_str()],
        )?;

        Ok(rows.into_iter().filter_map(|row| row.into_iter().next().flatten()).collect())
    }

    /// Tables shaped like an audit log.
    pub fn audit_table_candidates(
        conn: &mut ConnectionWrapper,
    ) -> Result<Vec<TableRef>, HistoryError> {
        let columns = AUDIT_COLUMNS.join(",");
        let rows = conn.query_text(
            r#"
            SELECT table_schema::text, table_name::text
            FROM information_schema.columns
            WHERE column_name = ANY (string_to_array($1, ','))
              AND table_schema NOT IN ('pg_catalog', 'information_schema')
            GROUP BY table_schema, table_name
            HAVING count(DISTINCT column_name) = array_length(string_to_array($1, ','), 1)
            ORDER BY table_schema, table_name
            "#,
            &[columns.as_str()],
        )?;

        Ok(rows.into_iter().filter_map(table_from_row).collect())
    }

    /// Candidate replay procedures as `schema.name`: non-system routines
    /// returning `void` whose name does not start with an underscore.
    pub fn replay_function_candidates(
        conn: &mut ConnectionWrapper,
    ) -> Result<Vec<String>, HistoryError> {
        let rows = conn.query_text(
            r#"
            SELECT routine_schema::text || '.' || routine_name::text
            FROM information_schema.routines
            WHERE routine_schema NOT IN ('pg_catalog', 'information_schema')
              AND data_type = 'void'
              AND substr(routine_name, 1, 1) != '_'
            ORDER BY 1
            "#,
            &[],
        )?;

        Ok(rows.into_iter().filter_map(|row| row.into_iter().next().flatten()).collect())
    }
}

fn table_from_row(row: Vec<Option<String>>) -> Option<TableRef> {
    let mut values = row.into_iter();
    let schema = values.next().flatten()?;
    let table = values.next().flatten()?;
    Some(TableRef::new(schema, table))
}

/// Geometry columns per `schema.table`, loaded once per table.
#[derive(Debug, Default)]
pub struct GeometryColumnCache {
    columns: HashMap<String, Vec<String>>,
}

impl GeometryColumnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Geometry columns of `table_name` (`schema.table`), querying the
    /// catalog on first use.
    pub fn get(
        &mut self,
        conn: &mut ConnectionWrapper,
        table_name: &str,
    ) -> Result<&[String], HistoryError> {
        if !self.columns.contains_key(table_name) {
            let table = TableRef::parse(table_name)?;
            let columns = SchemaService::geometry_columns(conn, &table)?;
            tracing::debug!(table = table_name, columns = ?columns, "Loaded geometry columns");
            self.columns.insert(table_name.to_string(), columns);
        }
        Ok(self.columns.get(table_name).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn clear(&mut self) {
        self.columns.clear();
    }
}
