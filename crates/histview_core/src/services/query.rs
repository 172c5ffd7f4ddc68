//! Event search queries.
//!
//! Builds the filtered audit-log query from an [`EventFilter`] and wraps the
//! resulting cursor in an [`EventModel`].

use crate::error::HistoryError;
use crate::models::event::{quote_literal, EventFilter, TableRef};
use crate::services::event_model::EventModel;
use crate::services::wrapper::ConnectionWrapper;

/// Timestamp literal format for date bounds.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Columns every event query returns, in this order.
pub const EVENT_COLUMNS: [&str; 7] = [
    "event_id",
    "action_tstamp_clk",
    "schema_name || '.' || table_name",
    "action::text",
    "application_name",
    "row_data::text",
    "changed_fields::text",
];

/// A built event query and the matching count query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Ordered event rows
    pub sql: String,
    /// Single `bigint` row with the number of matching events
    pub count_sql: String,
}

/// Builds event queries.
pub struct QueryBuilder;

impl QueryBuilder {
    /// Build the event query for an audit table and a filter.
    pub fn build(audit_table: &TableRef, filter: &EventFilter) -> EventQuery {
        let sql = format!(
            "SELECT {} FROM {} l WHERE {} ORDER BY action_tstamp_clk DESC, event_id DESC",
            EVENT_COLUMNS.join(", "),
            audit_table.quoted(),
            Self::predicate(filter)
        );
        let count_sql = Self::count(audit_table, filter);

        EventQuery { sql, count_sql }
    }

    /// Row count of the search, run upfront in the cursor's transaction.
    pub fn count(audit_table: &TableRef, filter: &EventFilter) -> String {
        format!(
            "SELECT count(*) FROM {} l WHERE {}",
            audit_table.quoted(),
            Self::predicate(filter)
        )
    }

    /// WHERE clause; always contains the action restriction.
    pub fn predicate(filter: &EventFilter) -> String {
        let mut wheres = Vec::new();

        if let Some(table) = &filter.table {
            wheres.push(format!("schema_name = {}", quote_literal(&table.schema)));
            wheres.push(format!("table_name = {}", quote_literal(&table.table)));

            if let Some(id) = filter.applicable_feature_id() {
                wheres.push(format!("row_data->'id' = '{id}'"));
            }
        }

        if let Some(text) = filter.search.as_deref().filter(|t| !t.is_empty()) {
            wheres.push(format!(
                "(SELECT string_agg(v, ' ') FROM svals(row_data) AS v) ILIKE '%{}%'",
                escape_like(text)
            ));
        }

        // An empty selection renders as IN ('') and matches nothing.
        let codes: Vec<&str> = filter.actions.iter().map(|a| a.code()).collect();
        wheres.push(format!("action IN ('{}')", codes.join("','")));

        if let Some(after) = filter.after {
            wheres.push(format!("action_tstamp_clk > '{}'", after.format(TIMESTAMP_FORMAT)));
        }
        if let Some(before) = filter.before {
            wheres.push(format!("action_tstamp_clk < '{}'", before.format(TIMESTAMP_FORMAT)));
        }

        wheres.join(" AND ")
    }
}

/// Escape free text for use inside a quoted `LIKE` pattern.
///
/// Backslash goes first so the escapes added for the other characters are
/// not escaped again.
pub fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "''").replace('%', "\\%").replace('_', "\\_")
}

/// Runs event searches.
pub struct QueryService;

impl QueryService {
    /// Build and run the search, returning a lazily filled model.
    pub fn search(
        conn: &mut ConnectionWrapper,
        audit_table: &TableRef,
        filter: &EventFilter,
    ) -> Result<EventModel, HistoryError> {
        let query = QueryBuilder::build(audit_table, filter);
        tracing::debug!(sql = %query.sql, "Searching audit events");

        let cursor = conn.open_event_cursor(&query).map_err(|e| {
            tracing::warn!(error = %e, audit_table = %audit_table, "Event search failed");
            e
        })?;

        let model = EventModel::new(cursor);
        tracing::debug!(row_count = model.count(), "Event search completed");
        Ok(model)
    }
}
