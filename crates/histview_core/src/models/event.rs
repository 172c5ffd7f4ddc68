//! Audit events, search filters and replay outcomes.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HistoryError;

/// Kind of row change recorded by the audit trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    /// All actions in display order.
    pub const ALL: [Action; 3] = [Action::Insert, Action::Update, Action::Delete];

    /// Single-letter code stored in the audit table's `action` column.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }

    /// Parse the audit table's action code.
    pub fn from_code(code: &str) -> Result<Self, HistoryError> {
        match code {
            "I" => Ok(Self::Insert),
            "U" => Ok(Self::Update),
            "D" => Ok(Self::Delete),
            other => Err(HistoryError::malformed(format!("unknown audit action \"{other}\""))),
        }
    }

    /// Label shown in the event list.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Insert => "Insertion",
            Self::Update => "Update",
            Self::Delete => "Delete",
        }
    }
}

/// Set of actions a search is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionSet {
    insert: bool,
    update: bool,
    delete: bool,
}

impl ActionSet {
    /// Every action enabled.
    pub fn all() -> Self {
        Self { insert: true, update: true, delete: true }
    }

    /// No action enabled. A search with this set matches nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Set with one more action enabled.
    pub fn with(mut self, action: Action) -> Self {
        self.set(action, true);
        self
    }

    /// Enable or disable one action.
    pub fn set(&mut self, action: Action, enabled: bool) {
        match action {
            Action::Insert => self.insert = enabled,
            Action::Update => self.update = enabled,
            Action::Delete => self.delete = enabled,
        }
    }

    pub fn contains(&self, action: Action) -> bool {
        match action {
            Action::Insert => self.insert,
            Action::Update => self.update,
            Action::Delete => self.delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.insert || self.update || self.delete)
    }

    /// Enabled actions in `I`, `U`, `D` order.
    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        Action::ALL.into_iter().filter(|a| self.contains(*a))
    }

    /// Parse a string of action codes such as `"IU"`.
    pub fn from_codes(codes: &str) -> Result<Self, HistoryError> {
        let mut set = Self::none();
        for c in codes.chars().filter(|c| !c.is_whitespace() && *c != ',') {
            let action = Action::from_code(&c.to_ascii_uppercase().to_string())
                .map_err(|_| HistoryError::config(format!("unknown action code '{c}'")))?;
            set.set(action, true);
        }
        Ok(set)
    }
}

/// A `schema.table` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self { schema: schema.into(), table: table.into() }
    }

    /// Parse `schema.table`. Both parts are required.
    pub fn parse(qualified: &str) -> Result<Self, HistoryError> {
        match qualified.trim().split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(HistoryError::config(format!(
                "\"{qualified}\" is not a schema-qualified table name"
            ))),
        }
    }

    /// Render as a quoted SQL identifier, `"schema"."table"`.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(&self.table))
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Search criteria for the event list.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    /// Restrict to one audited table
    pub table: Option<TableRef>,
    /// Feature id as typed by the user; only used with a table and when it
    /// parses as an integer
    pub feature_id: Option<String>,
    /// Free text searched in every value of the row data
    pub search: Option<String>,
    /// Enabled event types
    pub actions: ActionSet,
    /// Only events strictly after this time
    pub after: Option<NaiveDateTime>,
    /// Only events strictly before this time
    pub before: Option<NaiveDateTime>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            table: None,
            feature_id: None,
            search: None,
            actions: ActionSet::all(),
            after: None,
            before: None,
        }
    }
}

impl EventFilter {
    /// Feature id as an integer, when a table filter makes it applicable.
    pub fn applicable_feature_id(&self) -> Option<i64> {
        self.table.as_ref()?;
        self.feature_id.as_deref().and_then(|id| id.trim().parse::<i64>().ok())
    }
}

/// One row of the audit log. Immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    /// Unique id, increasing with arrival
    pub event_id: i64,
    /// Wall-clock time of the change
    pub timestamp: DateTime<Utc>,
    /// `schema.table` of the changed row
    pub table_name: String,
    /// Kind of change
    pub action: Action,
    /// Client application that made the change
    pub application_name: Option<String>,
    /// Row values as hstore text (old values for updates)
    pub row_data: Option<String>,
    /// New values of changed columns as hstore text (updates only)
    pub changed_fields: Option<String>,
}

/// Result of a replay call.
///
/// `error` is empty exactly when the replay succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub success: bool,
    pub error: String,
}

impl ReplayOutcome {
    pub fn succeeded() -> Self {
        Self { success: true, error: String::new() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "replay failed without an error message".to_string();
        }
        Self { success: false, error }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}
