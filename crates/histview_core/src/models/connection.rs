//! Connection descriptor and credential models.
//!
//! A descriptor is the libpq `key=value` parameter list the project stores
//! as its database connection string.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::HistoryError;

/// Port libpq uses when a descriptor does not name one.
pub const DEFAULT_PORT: &str = "5432";

/// SSL mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// No SSL
    Disable,
    /// Try plain first, SSL on refusal
    Allow,
    /// Use SSL if available (default)
    #[default]
    Prefer,
    /// Require SSL, accept any certificate
    Require,
    /// Require SSL, verify CA
    VerifyCa,
    /// Require SSL, verify CA and hostname
    VerifyFull,
}

impl SslMode {
    /// Convert to the libpq keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }

    /// Parse from the libpq keyword, defaulting to `prefer`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disable" => Self::Disable,
            "allow" => Self::Allow,
            "require" => Self::Require,
            "verify-ca" | "verify_ca" => Self::VerifyCa,
            "verify-full" | "verify_full" => Self::VerifyFull,
            _ => Self::Prefer,
        }
    }
}

/// User name and password entered at the credential prompt.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login role
    pub user: String,
    /// Password for the role
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self { user: user.into(), password: password.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("user", &self.user).field("password", &"****").finish()
    }
}

/// Opaque libpq connection parameters, in the order they were written.
///
/// `PartialEq` is structural. Use [`ConnectionDescriptor::same_database`] to
/// ask whether two descriptors reach the same backend database.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    params: Vec<(String, String)>,
}

impl ConnectionDescriptor {
    /// Create an empty descriptor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a libpq conninfo string (`host=db port=5432 dbname='my db'`).
    pub fn parse(conninfo: &str) -> Result<Self, HistoryError> {
        let mut descriptor = Self::new();
        let mut chars = conninfo.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
                key.push(c);
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next() != Some('=') {
                return Err(HistoryError::config(format!(
                    "missing \"=\" after \"{key}\" in connection string"
                )));
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if_eq(&'\'').is_some() {
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => value.push(c),
                            None => break,
                        },
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(HistoryError::config(format!(
                                "unterminated quoted value for \"{key}\" in connection string"
                            )))
                        }
                    }
                }
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    if c == '\\' {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    } else {
                        value.push(c);
                    }
                }
            }

            descriptor.set(key, value);
        }

        Ok(descriptor)
    }

    /// Get a parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing any previous value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.params.push((key, value)),
        }
    }

    /// Remove a parameter.
    pub fn remove(&mut self, key: &str) {
        self.params.retain(|(k, _)| k != key);
    }

    /// Iterate over all parameters.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn host(&self) -> Option<&str> {
        self.non_empty("host")
    }

    pub fn port(&self) -> Option<&str> {
        self.non_empty("port")
    }

    pub fn dbname(&self) -> Option<&str> {
        self.non_empty("dbname")
    }

    pub fn user(&self) -> Option<&str> {
        self.non_empty("user")
    }

    pub fn password(&self) -> Option<&str> {
        self.non_empty("password")
    }

    pub fn service(&self) -> Option<&str> {
        self.non_empty("service")
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.non_empty("sslmode").map(SslMode::parse).unwrap_or_default()
    }

    /// Whether both user and password are present.
    pub fn has_credentials(&self) -> bool {
        self.user().is_some() && self.password().is_some()
    }

    /// Whether two descriptors reach the same logical database.
    ///
    /// With a service on both sides, service and sslmode decide. Otherwise
    /// host, port and database name must all be known on both sides and
    /// match. User and password never take part.
    pub fn same_database(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.service(), other.service()) {
            return a == b && self.non_empty("sslmode") == other.non_empty("sslmode");
        }
        match (self.server_key(), other.server_key()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn server_key(&self) -> Option<(&str, &str, &str)> {
        Some((self.host()?, self.port().unwrap_or(DEFAULT_PORT), self.dbname()?))
    }

    /// Descriptor with the user identity stripped, as the host keys its
    /// transaction groups.
    pub fn normalized(&self) -> Self {
        let mut normalized = self.clone();
        normalized.remove("user");
        normalized
    }

    /// Copy of this descriptor carrying the given credentials.
    pub fn with_credentials(&self, credentials: &Credentials) -> Self {
        let mut descriptor = self.clone();
        descriptor.set("user", credentials.user.clone());
        descriptor.set("password", credentials.password.clone());
        descriptor
    }

    /// Render as a libpq conninfo string, password included.
    pub fn to_conninfo(&self) -> String {
        self.render(false)
    }

    /// Key used to remember credentials: the normalized descriptor without
    /// its password.
    pub fn credential_key(&self) -> String {
        let mut key = self.normalized();
        key.remove("password");
        key.to_conninfo()
    }

    fn render(&self, mask_password: bool) -> String {
        self.params
            .iter()
            .map(|(k, v)| {
                if mask_password && k == "password" {
                    format!("{k}=****")
                } else {
                    format!("{k}={}", quote_value(v))
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.chars().any(|c| c.is_whitespace() || c == '\'' || c == '\\' || c == '=');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

/// Renders with the password masked, safe for logs and dialogs.
impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionDescriptor({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::parse(s).unwrap()
    }

    #[test]
    fn test_parse_plain_and_quoted_values() {
        let d = parse("host=db.local port = 5433 dbname='my db' user=alice password='it\\'s'");
        assert_eq!(d.host(), Some("db.local"));
        assert_eq!(d.port(), Some("5433"));
        assert_eq!(d.dbname(), Some("my db"));
        assert_eq!(d.user(), Some("alice"));
        assert_eq!(d.password(), Some("it's"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(ConnectionDescriptor::parse("host").is_err());
        assert!(ConnectionDescriptor::parse("dbname='open").is_err());
        assert!(ConnectionDescriptor::parse("   ").unwrap().params().next().is_none());
    }

    #[test]
    fn test_conninfo_round_trip() {
        let d = parse("dbname='my db' host=h password='a\\\\b'");
        let again = parse(&d.to_conninfo());
        assert_eq!(d, again);
        assert_eq!(again.password(), Some("a\\b"));
    }

    #[test]
    fn test_display_masks_password() {
        let d = parse("host=h dbname=gis user=bob password=secret");
        let shown = d.to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("password=****"));
        assert!(!format!("{d:?}").contains("secret"));
        assert!(!format!("{:?}", Credentials::new("bob", "secret")).contains("secret"));
    }

    #[test]
    fn test_same_database_by_host_port_db_ignores_identity() {
        let a = parse("host=h port=5432 dbname=gis user=alice password=x");
        let b = parse("dbname=gis host=h port=5432 user=bob");
        assert!(a.same_database(&b));
        assert!(b.same_database(&a));

        let c = parse("host=h port=5433 dbname=gis");
        assert!(!a.same_database(&c));
        assert!(!c.same_database(&a));
    }

    #[test]
    fn test_same_database_defaults_port() {
        let a = parse("host=h dbname=gis");
        let b = parse("host=h port=5432 dbname=gis");
        assert!(a.same_database(&b));
        assert!(b.same_database(&a));
    }

    #[test]
    fn test_same_database_by_service_ignores_host() {
        let a = parse("service=prod sslmode=require host=a dbname=x");
        let b = parse("service=prod sslmode=require host=b dbname=y");
        assert!(a.same_database(&b));
        assert!(b.same_database(&a));

        let c = parse("service=prod sslmode=disable host=a dbname=x");
        assert!(!a.same_database(&c));
        assert!(!c.same_database(&a));

        let d = parse("service=test host=a dbname=x");
        assert!(!a.same_database(&d));
    }

    #[test]
    fn test_same_database_requires_complete_server_key() {
        let a = parse("dbname=gis");
        let b = parse("dbname=gis");
        assert!(!a.same_database(&b));

        let empty_service = parse("service='' host=h dbname=gis");
        let other = parse("service='' host=h dbname=gis");
        assert!(empty_service.same_database(&other));
    }

    #[test]
    fn test_normalized_strips_user_only() {
        let d = parse("host=h dbname=gis user=alice password=x");
        let n = d.normalized();
        assert_eq!(n.user(), None);
        assert_eq!(n.password(), Some("x"));
        assert_eq!(d.credential_key(), "host=h dbname=gis");
    }

    #[test]
    fn test_with_credentials_replaces_existing() {
        let d = parse("host=h dbname=gis user=old");
        let d = d.with_credentials(&Credentials::new("new", "pw"));
        assert_eq!(d.user(), Some("new"));
        assert_eq!(d.password(), Some("pw"));
        assert!(d.has_credentials());
        assert_eq!(d.params().filter(|(k, _)| *k == "user").count(), 1);
    }

    #[test]
    fn test_ssl_mode() {
        assert_eq!(parse("sslmode=verify-full").ssl_mode(), SslMode::VerifyFull);
        assert_eq!(parse("host=h").ssl_mode(), SslMode::Prefer);
        assert_eq!(SslMode::parse("DISABLE").as_str(), "disable");
    }
}
