//! Incrementally loaded event list.
//!
//! The model announces the cursor's full row count up front but only pulls
//! rows from the cursor when a row past the loaded ones is requested. Loaded
//! rows stay cached for the model's lifetime; a new search builds a new
//! model.

use crate::error::HistoryError;
use crate::services::connection::EventCursor;
use crate::services::decoder::{decode_payload, HstoreMap};
use crate::models::AuditEvent;

/// Headers of the event list columns.
pub const COLUMN_HEADERS: [&str; 4] = ["Date", "Table", "Action", "Application"];

/// Timestamp format of the Date column.
const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lazily filled, forward-only view over an event cursor.
pub struct EventModel {
    cursor: Box<dyn EventCursor>,
    rows: Vec<AuditEvent>,
    row_count: usize,
}

impl EventModel {
    pub fn new(cursor: Box<dyn EventCursor>) -> Self {
        let row_count = cursor.row_count();
        Self { cursor, rows: Vec::new(), row_count }
    }

    /// Total number of matching events.
    pub fn count(&self) -> usize {
        self.row_count
    }

    /// Number of rows pulled from the cursor so far.
    pub fn materialized(&self) -> usize {
        self.rows.len()
    }

    /// Event at `index`, fetching exactly the missing rows up to it.
    pub fn get(&mut self, index: usize) -> Result<&AuditEvent, HistoryError> {
        if index >= self.row_count {
            return Err(HistoryError::internal(format!(
                "row {index} out of range ({} events)",
                self.row_count
            )));
        }

        if index >= self.rows.len() {
            let remaining = index - self.rows.len() + 1;
            let fetched = self.cursor.fetch_many(remaining)?;
            tracing::trace!(requested = remaining, fetched = fetched.len(), "Fetched event rows");
            self.rows.extend(fetched);
        }

        self.rows.get(index).ok_or_else(|| {
            HistoryError::internal(format!(
                "cursor ended after {} of {} announced rows",
                self.rows.len(),
                self.row_count
            ))
        })
    }

    /// Decoded row data of the event at `index`.
    pub fn row_data(&mut self, index: usize) -> Result<HstoreMap, HistoryError> {
        let event = self.get(index)?;
        decode_payload(event.row_data.as_deref())
    }

    /// Decoded changed fields of the event at `index`.
    pub fn changed_fields(&mut self, index: usize) -> Result<HstoreMap, HistoryError> {
        let event = self.get(index)?;
        decode_payload(event.changed_fields.as_deref())
    }

    /// Text of one list cell; `column` indexes [`COLUMN_HEADERS`].
    pub fn display(&mut self, index: usize, column: usize) -> Result<Option<String>, HistoryError> {
        let event = self.get(index)?;
        Ok(match column {
            0 => Some(event.timestamp.format(DISPLAY_TIME_FORMAT).to_string()),
            1 => Some(event.table_name.clone()),
            2 => Some(event.action.label().to_string()),
            3 => event.application_name.clone(),
            _ => None,
        })
    }
}

impl std::fmt::Debug for EventModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventModel")
            .field("row_count", &self.row_count)
            .field("materialized", &self.rows.len())
            .finish()
    }
}
