//! Direct database connections.
//!
//! The viewer core talks to the database through the synchronous
//! [`Connector`], [`DirectConnection`] and [`EventCursor`] traits. The
//! PostgreSQL implementation drives tokio-postgres on a runtime handle and
//! blocks the calling thread until each call completes, so connect, execute
//! and fetch always finish in order.

use crate::error::HistoryError;
use crate::models::{Action, AuditEvent, ConnectionDescriptor, SslMode};
use crate::services::query::EventQuery;

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use native_tls::{Certificate, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use std::path::PathBuf;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

/// Forward-only cursor over audit events with a known total.
pub trait EventCursor: Send {
    /// Number of rows the query matched, known before any row is fetched.
    fn row_count(&self) -> usize;

    /// Fetch up to `n` further rows, in order.
    fn fetch_many(&mut self, n: usize) -> Result<Vec<AuditEvent>, HistoryError>;
}

/// A connection this process owns and commits itself.
pub trait DirectConnection: Send {
    /// Execute a statement inside the connection's current transaction,
    /// opening one if needed.
    fn execute(&mut self, sql: &str) -> Result<(), HistoryError>;

    /// Commit the current transaction, if any.
    fn commit(&mut self) -> Result<(), HistoryError>;

    /// Run an event query and return a cursor positioned before its first row.
    fn open_event_cursor(&mut self, query: &EventQuery)
        -> Result<Box<dyn EventCursor>, HistoryError>;

    /// Run a catalog query with text parameters; every column must be text.
    fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, HistoryError>;
}

/// Opens direct connections.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn DirectConnection>, HistoryError>;
}

/// Connection knobs not carried by the descriptor.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Connection timeout in seconds, unless the descriptor sets one
    pub connect_timeout_secs: u64,
    /// Application name sent to PostgreSQL, unless the descriptor sets one
    pub application_name: String,
    /// Connections per descriptor: one write session plus open cursors
    pub pool_size: usize,
    /// How long to wait for a free connection
    pub wait_timeout_secs: u64,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            application_name: "histview".to_string(),
            pool_size: 4,
            wait_timeout_secs: 30,
        }
    }
}

/// Opens [`PgSession`]s on a tokio runtime.
pub struct PgConnector {
    runtime: Handle,
    options: ConnectorOptions,
}

impl PgConnector {
    pub fn new(runtime: Handle) -> Self {
        Self::with_options(runtime, ConnectorOptions::default())
    }

    pub fn with_options(runtime: Handle, options: ConnectorOptions) -> Self {
        Self { runtime, options }
    }

    /// Descriptor parameters with any `service` expanded from the service file.
    fn effective_params(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionDescriptor, HistoryError> {
        let Some(service) = descriptor.service() else {
            return Ok(descriptor.clone());
        };

        let mut params = load_service(service)?;
        for (key, value) in descriptor.params().filter(|(k, _)| *k != "service") {
            params.set(key, value);
        }
        Ok(params)
    }

    fn pg_config(
        &self,
        params: &ConnectionDescriptor,
    ) -> Result<tokio_postgres::Config, HistoryError> {
        let mut config = tokio_postgres::Config::new();
        let mut has_user = false;
        let mut has_application_name = false;
        let mut has_timeout = false;

        for (key, value) in params.params() {
            match key {
                "host" | "hostaddr" => {
                    for host in value.split(',').filter(|h| !h.is_empty()) {
                        config.host(host);
                    }
                }
                "port" => {
                    let port = value.parse::<u16>().map_err(|_| {
                        HistoryError::config(format!("invalid port \"{value}\""))
                    })?;
                    config.port(port);
                }
                "dbname" => {
                    config.dbname(value);
                }
                "user" if !value.is_empty() => {
                    config.user(value);
                    has_user = true;
                }
                "password" => {
                    config.password(value);
                }
                "sslmode" => {
                    let mode = match SslMode::parse(value) {
                        SslMode::Disable => tokio_postgres::config::SslMode::Disable,
                        SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                            tokio_postgres::config::SslMode::Require
                        }
                        SslMode::Allow | SslMode::Prefer => {
                            tokio_postgres::config::SslMode::Prefer
                        }
                    };
                    config.ssl_mode(mode);
                }
                "sslrootcert" => {}
                "application_name" => {
                    config.application_name(value);
                    has_application_name = true;
                }
                "connect_timeout" => {
                    let secs = value.parse::<u64>().map_err(|_| {
                        HistoryError::config(format!("invalid connect_timeout \"{value}\""))
                    })?;
                    config.connect_timeout(Duration::from_secs(secs));
                    has_timeout = true;
                }
                other => {
                    tracing::debug!(key = other, "Ignoring unsupported connection parameter");
                }
            }
        }

        if !has_user {
            // libpq falls back to PGUSER; without it the user has to say who
            // they are.
            match std::env::var("PGUSER") {
                Ok(user) if !user.is_empty() => {
                    config.user(&user);
                }
                _ => return Err(HistoryError::authentication("no user name supplied")),
            }
        }
        if !has_application_name {
            config.application_name(&self.options.application_name);
        }
        if !has_timeout {
            config.connect_timeout(Duration::from_secs(self.options.connect_timeout_secs));
        }
        config.keepalives(true);
        config.keepalives_idle(Duration::from_secs(60));

        Ok(config)
    }
}

/// Build the TLS connector for a libpq `sslmode`.
///
/// `require` and the weaker modes encrypt without checking the server
/// certificate. `verify-ca` checks the chain, `verify-full` the host name as
/// well; `sslrootcert` adds a trusted root for both.
pub fn tls_connector(params: &ConnectionDescriptor) -> Result<MakeTlsConnector, HistoryError> {
    let mut builder = TlsConnector::builder();
    let mode = params.ssl_mode();
    match mode {
        SslMode::VerifyFull => {}
        SslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::Disable | SslMode::Allow | SslMode::Prefer | SslMode::Require => {
            builder.danger_accept_invalid_certs(true);
        }
    }

    if matches!(mode, SslMode::VerifyCa | SslMode::VerifyFull) {
        if let Some(path) = params.get("sslrootcert").filter(|p| !p.is_empty()) {
            let pem = std::fs::read(path).map_err(|e| {
                HistoryError::config(format!("Failed to read root certificate {path}: {e}"))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                HistoryError::config(format!("Failed to parse root certificate {path}: {e}"))
            })?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| HistoryError::connection(format!("Failed to create TLS connector: {e}")))?;
    Ok(MakeTlsConnector::new(connector))
}

impl Connector for PgConnector {
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn DirectConnection>, HistoryError> {
        let params = self.effective_params(descriptor)?;
        let config = self.pg_config(&params)?;
        let tls = tls_connector(&params)?;
        let label = descriptor.normalized().to_string();
        let options = self.options.clone();

        let (pool, session) = self.runtime.block_on(async move {
            let pool = ConnectionPool::new(config, tls, &options, label).await?;
            let session = pool.get().await?;
            Ok::<_, HistoryError>((pool, session))
        })?;

        Ok(Box::new(PgSession {
            pool,
            session,
            runtime: self.runtime.clone(),
            in_transaction: false,
        }))
    }
}

/// A managed pool of database connections for one descriptor.
///
/// The write session keeps one connection checked out; each open event
/// cursor holds another until it is dropped.
pub struct ConnectionPool {
    /// Identifier used in logs
    id: Uuid,
    /// Masked descriptor, for logs
    label: String,
    /// The actual connection pool
    pool: Pool,
    /// When this pool was created
    created_at: DateTime<Utc>,
}

impl ConnectionPool {
    /// Create the pool and validate it by establishing a first connection.
    pub async fn new(
        pg_config: tokio_postgres::Config,
        tls: MakeTlsConnector,
        options: &ConnectorOptions,
        label: String,
    ) -> Result<Self, HistoryError> {
        let connect_timeout = Duration::from_secs(options.connect_timeout_secs);

        let manager = Manager::from_config(
            pg_config,
            tls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(options.pool_size.max(2))
            .wait_timeout(Some(Duration::from_secs(options.wait_timeout_secs)))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| HistoryError::connection(format!("Failed to create pool: {e}")))?;

        let client = pool.get().await.map_err(HistoryError::from)?;
        client.simple_query("SELECT 1").await.map_err(HistoryError::from)?;
        drop(client);

        let id = Uuid::new_v4();
        tracing::info!(pool_id = %id, database = %label, "Connection pool created successfully");

        Ok(Self { id, label, pool, created_at: Utc::now() })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire a connection from the pool.
    pub async fn get(&self) -> Result<Object, HistoryError> {
        self.pool.get().await.map_err(|e| {
            let status = self.pool.status();
            if status.waiting > 0 {
                HistoryError::connection(format!(
                    "Pool exhausted after timeout ({} waiting): {e}",
                    status.waiting
                ))
            } else {
                HistoryError::from(e)
            }
        })
    }

    /// Close the pool, dropping all connections.
    pub fn close(&self) {
        self.pool.close();
        tracing::info!(pool_id = %self.id, database = %self.label, "Connection pool closed");
    }
}

/// Direct PostgreSQL connection with an explicit transaction.
pub struct PgSession {
    pool: ConnectionPool,
    session: Object,
    runtime: Handle,
    in_transaction: bool,
}

impl DirectConnection for PgSession {
    fn execute(&mut self, sql: &str) -> Result<(), HistoryError> {
        let session = &self.session;
        let begin = !self.in_transaction;
        self.runtime.block_on(async move {
            if begin {
                session.batch_execute("BEGIN").await?;
            }
            Ok::<_, tokio_postgres::Error>(())
        })?;
        self.in_transaction = true;

        tracing::debug!(pool_id = %self.pool.id(), sql, "Executing statement");
        self.runtime.block_on(session.batch_execute(sql)).map_err(HistoryError::from)
    }

    fn commit(&mut self) -> Result<(), HistoryError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.runtime.block_on(self.session.batch_execute("COMMIT")).map_err(HistoryError::from)
    }

    fn open_event_cursor(
        &mut self,
        query: &EventQuery,
    ) -> Result<Box<dyn EventCursor>, HistoryError> {
        let name = format!("histview_events_{}", Uuid::new_v4().simple());
        let declare = format!("DECLARE {name} NO SCROLL CURSOR WITH HOLD FOR {}", query.sql);
        let pool = &self.pool;

        let (client, total) = self.runtime.block_on(async {
            let client = pool.get().await?;
            // Count and declare see the same snapshot, so the announced total
            // matches what the cursor yields.
            client.batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ").await?;
            let counted = async {
                let row = client.query_one(query.count_sql.as_str(), &[]).await?;
                let total: i64 = row.try_get(0)?;
                client.batch_execute(&declare).await?;
                client.batch_execute("COMMIT").await?;
                Ok::<_, tokio_postgres::Error>(total)
            }
            .await;
            match counted {
                Ok(total) => Ok::<_, HistoryError>((client, total)),
                Err(e) => {
                    let _ = client.batch_execute("ROLLBACK").await;
                    Err(HistoryError::from(e))
                }
            }
        })?;

        tracing::debug!(cursor = %name, row_count = total, "Event cursor opened");

        Ok(Box::new(PgCursor {
            name,
            client: Some(client),
            runtime: self.runtime.clone(),
            row_count: usize::try_from(total).unwrap_or(0),
        }))
    }

    fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, HistoryError> {
        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self.runtime.block_on(self.session.query(sql, &params))?;

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<_, Option<String>>(i).map_err(HistoryError::from))
                    .collect()
            })
            .collect()
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.in_transaction {
            tracing::warn!(pool_id = %self.pool.id(), "Closing session with an uncommitted transaction");
        }
        self.pool.close();
    }
}

/// Holdable server-side cursor; closed in the background when dropped.
pub struct PgCursor {
    name: String,
    client: Option<Object>,
    runtime: Handle,
    row_count: usize,
}

impl EventCursor for PgCursor {
    fn row_count(&self) -> usize {
        self.row_count
    }

    fn fetch_many(&mut self, n: usize) -> Result<Vec<AuditEvent>, HistoryError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| HistoryError::internal("cursor already closed"))?;
        let sql = format!("FETCH FORWARD {n} FROM {}", self.name);
        let rows = self.runtime.block_on(client.query(sql.as_str(), &[]))?;

        rows.iter().map(event_from_row).collect()
    }
}

impl Drop for PgCursor {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let sql = format!("CLOSE {}", self.name);
            self.runtime.spawn(async move {
                if let Err(e) = client.batch_execute(&sql).await {
                    tracing::debug!(error = %e, "Failed to close event cursor");
                }
            });
        }
    }
}

fn event_from_row(row: &tokio_postgres::Row) -> Result<AuditEvent, HistoryError> {
    let action: String = row.try_get(3)?;
    Ok(AuditEvent {
        event_id: row.try_get(0)?,
        timestamp: row.try_get(1)?,
        table_name: row.try_get(2)?,
        action: Action::from_code(action.trim())?,
        application_name: row.try_get(4)?,
        row_data: row.try_get(5)?,
        changed_fields: row.try_get(6)?,
    })
}

/// Location of the connection service file, as libpq looks it up.
fn service_file_candidates() -> Vec<PathBuf> {
    if let Ok(path) = std::env::var("PGSERVICEFILE") {
        return vec![PathBuf::from(path)];
    }
    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".pg_service.conf"));
    }
    if let Ok(dir) = std::env::var("PGSYSCONFDIR") {
        candidates.push(PathBuf::from(dir).join("pg_service.conf"));
    }
    candidates
}

/// Parameters of one `[service]` section of the service file.
fn load_service(service: &str) -> Result<ConnectionDescriptor, HistoryError> {
    for path in service_file_candidates() {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Some(params) = parse_service_section(&contents, service) {
            tracing::debug!(service, file = %path.display(), "Resolved connection service");
            return Ok(params);
        }
    }
    Err(HistoryError::config(format!("definition of service \"{service}\" not found")))
}

fn parse_service_section(contents: &str, service: &str) -> Option<ConnectionDescriptor> {
    let mut found = None;
    let mut in_section = false;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if in_section {
                break;
            }
            in_section = section.trim() == service;
            if in_section {
                found = Some(ConnectionDescriptor::new());
            }
            continue;
        }
        if let (true, Some(params), Some((key, value))) = (in_section, found.as_mut(), line.split_once('=')) {
            params.set(key.trim(), value.trim());
        }
    }

    found
}
