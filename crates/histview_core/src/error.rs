//! Error types for the history viewer.
//!
//! Database errors keep the PostgreSQL details (message, detail, hint,
//! context, SQLSTATE) so replay failures can show the engine's own context.

use thiserror::Error;

/// Main error type for the history viewer core.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A connection attempt or an established connection failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Neither a shared transactional connection nor a direct one could be
    /// established.
    #[error("Connection unavailable: {message}")]
    ConnectionUnavailable {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed. Triggers the credential prompt.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// The user dismissed the credential prompt.
    #[error("Cancelled by user")]
    UserCancelled,

    /// Query execution error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// Call stack context reported by the engine (PL/pgSQL `CONTEXT`).
        context: Option<String>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// A row-data or geometry payload could not be decoded.
    #[error("Malformed payload: {message}")]
    MalformedPayload {
        /// What could not be decoded and why.
        message: String,
    },

    /// Local SQLite storage error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// OS keychain error.
    #[error("Keyring error: {message}")]
    Keyring {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Project configuration is missing or invalid.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl HistoryError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Wrap the last failure of a resolve attempt.
    pub fn unavailable(message: impl Into<String>, cause: Option<HistoryError>) -> Self {
        Self::ConnectionUnavailable {
            message: message.into(),
            source: cause.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }

    /// Create a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            hint: Some("Check username and password".to_string()),
        }
    }

    /// Create a new query error carrying only a message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), detail: None, hint: None, context: None, code: None }
    }

    /// Create a new malformed payload error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload { message: message.into() }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new keyring error.
    pub fn keyring(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Keyring { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Whether this failure should send the user to the credential prompt.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Whether the user aborted; callers stay silent in that case.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::UserCancelled)
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::ConnectionUnavailable { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::UserCancelled => "Cancelled",
            Self::Query { .. } => "Query",
            Self::MalformedPayload { .. } => "Payload",
            Self::Storage { .. } => "Storage",
            Self::Keyring { .. } => "Keyring",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::ConnectionUnavailable { .. } => {
                Some("Check the project's database connection settings")
            }
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::UserCancelled => None,
            Self::Query { hint, .. } => hint.as_deref(),
            Self::MalformedPayload { .. } => {
                Some("The audit row is kept; only the affected field is skipped")
            }
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Keyring { hint, .. } => hint.as_deref(),
            Self::Config { .. } => Some("Configure the audit table and database connection"),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// The string reported back to the user when a statement fails.
    ///
    /// Prefers the engine's call-stack context, which names the failing
    /// statement inside a stored procedure, and falls back to the message.
    pub fn engine_context(&self) -> String {
        match self {
            Self::Query { message, context: Some(context), .. } if !context.is_empty() => {
                format!("{message}\nCONTEXT: {context}")
            }
            other => other.to_string(),
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Query { detail, code, context, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if let Some(context) = context {
                    parts.push(format!("Context: {context}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to HistoryError.
impl From<tokio_postgres::Error> for HistoryError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let context = db_err.where_().map(String::from);
            let code_str = db_err.code().code();

            match code_str {
                "28P01" => {
                    return HistoryError::Authentication {
                        message,
                        hint: Some("Invalid password - check your credentials".to_string()),
                    }
                }
                _ if code_str.starts_with("28") => {
                    return HistoryError::Authentication {
                        message,
                        hint: Some(
                            "Authentication failed - check username and permissions".to_string(),
                        ),
                    }
                }
                _ if code_str.starts_with("08") => {
                    return HistoryError::Connection { message, source: Some(Box::new(err)) }
                }
                _ => {
                    return HistoryError::Query {
                        message,
                        detail,
                        hint,
                        context,
                        code: Some(code_str.to_string()),
                    }
                }
            }
        }

        // libpq-style "no password supplied" surfaces as a config error
        // before any server round trip.
        let text = err.to_string();
        if text.contains("password missing") {
            return HistoryError::authentication(text);
        }

        if err.is_closed() {
            return HistoryError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        HistoryError::Connection { message: text, source: Some(Box::new(err)) }
    }
}

/// Convert from deadpool_postgres::PoolError to HistoryError.
impl From<deadpool_postgres::PoolError> for HistoryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => HistoryError::from(e),
            other => HistoryError::connection(format!("Failed to acquire connection: {other}")),
        }
    }
}

/// Convert from rusqlite::Error to HistoryError.
impl From<rusqlite::Error> for HistoryError {
    fn from(err: rusqlite::Error) -> Self {
        HistoryError::Storage {
            message: err.to_string(),
            hint: Some("The local database may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from std::io::Error to HistoryError.
impl From<std::io::Error> for HistoryError {
    fn from(err: std::io::Error) -> Self {
        HistoryError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from keyring::Error to HistoryError.
impl From<keyring::Error> for HistoryError {
    fn from(err: keyring::Error) -> Self {
        HistoryError::Keyring {
            message: err.to_string(),
            hint: Some("Grant access to the system keychain".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_context_prefers_context() {
        let err = HistoryError::Query {
            message: "division by zero".to_string(),
            detail: None,
            hint: None,
            context: Some("PL/pgSQL function audit.replay_event(bigint) line 12".to_string()),
            code: Some("22012".to_string()),
        };
        let text = err.engine_context();
        assert!(text.starts_with("division by zero"));
        assert!(text.contains("CONTEXT: PL/pgSQL function audit.replay_event"));
    }

    #[test]
    fn test_engine_context_falls_back_to_message() {
        let err = HistoryError::query("relation \"audit.missing\" does not exist");
        assert_eq!(err.engine_context(), "relation \"audit.missing\" does not exist");
    }

    #[test]
    fn test_unavailable_keeps_cause() {
        let err = HistoryError::unavailable(
            "No database connection established",
            Some(HistoryError::connection("refused")),
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Connection error: refused"));
        assert_eq!(err.category(), "Connection");
    }

    #[test]
    fn test_error_info_for_query() {
        let err = HistoryError::Query {
            message: "boom".to_string(),
            detail: Some("row 3".to_string()),
            hint: None,
            context: None,
            code: Some("P0001".to_string()),
        };
        let info = err.to_error_info();
        assert_eq!(info.error_type, "Query Error");
        assert_eq!(info.technical_detail.as_deref(), Some("Code: P0001\nDetail: row 3"));
    }

    #[test]
    fn test_cancel_and_auth_predicates() {
        assert!(HistoryError::UserCancelled.is_cancelled());
        assert!(HistoryError::UserCancelled.hint().is_none());
        assert!(HistoryError::authentication("bad password").is_authentication());
        assert!(!HistoryError::connection("refused").is_authentication());
    }
}
