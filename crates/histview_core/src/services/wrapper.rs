//! Connection resolution.
//!
//! A [`ConnectionWrapper`] holds at most one [`ConnectionHandle`]: either a
//! shared connection borrowed from the host's transaction group or a direct
//! connection this process owns. Opening the same logical database again
//! reuses the held handle.

use std::sync::Arc;

use crate::error::HistoryError;
use crate::models::ConnectionDescriptor;
use crate::services::connection::{Connector, DirectConnection, EventCursor};
use crate::services::credentials::CredentialService;
use crate::services::host::{
    CredentialPrompt, SharedConnection, TransactionCoordinator, POSTGRES_PROVIDER,
};
use crate::services::query::EventQuery;

/// Reply of a host shared connection that executed a statement without error.
const SHARED_SUCCESS_STATUS: &str = "Status 2 ()";

/// The connection a wrapper currently holds.
pub enum ConnectionHandle {
    /// Owned connection; commits are ours to make
    Direct(Box<dyn DirectConnection>),
    /// Host transaction group; the host commits on save
    Shared(Arc<dyn SharedConnection>),
}

impl ConnectionHandle {
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    fn kind(&self) -> &'static str {
        if self.is_shared() {
            "shared"
        } else {
            "direct"
        }
    }
}

/// Collaborators needed to open a connection.
pub struct ConnectContext<'a> {
    pub connector: &'a dyn Connector,
    /// `None` when the host has no transaction groups
    pub coordinator: Option<&'a dyn TransactionCoordinator>,
    pub prompt: &'a dyn CredentialPrompt,
    pub credentials: &'a CredentialService,
}

/// Holds the connection used for one purpose (reading or writing).
#[derive(Default)]
pub struct ConnectionWrapper {
    descriptor: Option<ConnectionDescriptor>,
    handle: Option<ConnectionHandle>,
    shared_disabled: bool,
}

impl ConnectionWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrapper that always opens direct connections.
    pub fn direct_only() -> Self {
        Self { shared_disabled: true, ..Self::default() }
    }

    /// Stop preferring the host's shared transactions.
    pub fn disable_transaction_group(&mut self) {
        self.shared_disabled = true;
    }

    /// Make sure a connection to `descriptor`'s database is held.
    ///
    /// An open handle to the same database is kept as is. Otherwise the old
    /// handle is closed, then a shared connection is requested from the host
    /// when shared transactions are enabled and active, and a direct
    /// connection is opened through the credential retry loop as fallback.
    pub fn open(
        &mut self,
        descriptor: &ConnectionDescriptor,
        ctx: &ConnectContext<'_>,
    ) -> Result<(), HistoryError> {
        if let (Some(current), Some(handle)) = (&self.descriptor, &self.handle) {
            if current.same_database(descriptor) {
                tracing::trace!(kind = handle.kind(), database = %descriptor, "Reusing connection");
                return Ok(());
            }
        }

        self.close();

        if let Some(shared) = self.shared_connection(descriptor, ctx) {
            tracing::info!(database = %descriptor.normalized(), "Using host transaction group");
            self.store(descriptor, ConnectionHandle::Shared(shared));
            return Ok(());
        }

        match ctx.credentials.connect_with_retry(ctx.connector, descriptor, ctx.prompt) {
            Ok(conn) => {
                self.store(descriptor, ConnectionHandle::Direct(conn));
                Ok(())
            }
            Err(HistoryError::UserCancelled) => Err(HistoryError::UserCancelled),
            Err(e) => {
                tracing::warn!(database = %descriptor, error = %e, "No connection could be established");
                Err(HistoryError::unavailable(
                    format!("could not connect to {}", descriptor.normalized()),
                    Some(e),
                ))
            }
        }
    }

    fn shared_connection(
        &self,
        descriptor: &ConnectionDescriptor,
        ctx: &ConnectContext<'_>,
    ) -> Option<Arc<dyn SharedConnection>> {
        if self.shared_disabled {
            return None;
        }
        let coordinator = ctx.coordinator?;
        if !coordinator.auto_transaction() {
            tracing::trace!("Host transaction groups inactive");
            return None;
        }
        coordinator.transaction_group(POSTGRES_PROVIDER, &descriptor.normalized())
    }

    fn store(&mut self, descriptor: &ConnectionDescriptor, handle: ConnectionHandle) {
        self.descriptor = Some(descriptor.clone());
        self.handle = Some(handle);
    }

    /// Whether a handle is held.
    pub fn is_valid(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_shared(&self) -> bool {
        self.handle.as_ref().is_some_and(ConnectionHandle::is_shared)
    }

    /// Descriptor of the held connection.
    pub fn descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.handle.as_ref().and(self.descriptor.as_ref())
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    fn handle_mut(&mut self) -> Result<&mut ConnectionHandle, HistoryError> {
        self.handle.as_mut().ok_or_else(|| HistoryError::connection("no open connection"))
    }

    /// Execute SQL on whichever connection is held.
    pub fn execute_sql(&mut self, sql: &str) -> Result<(), HistoryError> {
        match self.handle_mut()? {
            ConnectionHandle::Direct(conn) => conn.execute(sql),
            ConnectionHandle::Shared(conn) => {
                let status = conn.execute_sql(sql);
                if status.is_empty() || status == SHARED_SUCCESS_STATUS {
                    Ok(())
                } else {
                    Err(HistoryError::query(status))
                }
            }
        }
    }

    /// Commit a direct connection. Shared connections are committed by the
    /// host, so this does nothing for them.
    pub fn commit(&mut self) -> Result<(), HistoryError> {
        match self.handle_mut()? {
            ConnectionHandle::Direct(conn) => conn.commit(),
            ConnectionHandle::Shared(_) => Ok(()),
        }
    }

    fn direct(
        &mut self,
        operation: &str,
    ) -> Result<&mut Box<dyn DirectConnection>, HistoryError> {
        match self.handle_mut()? {
            ConnectionHandle::Direct(conn) => Ok(conn),
            ConnectionHandle::Shared(_) => Err(HistoryError::connection(format!(
                "{operation} needs a direct connection"
            ))),
        }
    }

    pub fn open_event_cursor(
        &mut self,
        query: &EventQuery,
    ) -> Result<Box<dyn EventCursor>, HistoryError> {
        self.direct("reading events")?.open_event_cursor(query)
    }

    pub fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, HistoryError> {
        self.direct("catalog queries")?.query_text(sql, params)
    }

    /// Drop the held connection. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(kind = handle.kind(), "Closing connection");
        }
        self.descriptor = None;
    }
}

impl std::fmt::Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionWrapper")
            .field("descriptor", &self.descriptor)
            .field("handle", &self.handle.as_ref().map(ConnectionHandle::kind))
            .field("shared_disabled", &self.shared_disabled)
            .finish()
    }
}
