//! Contracts the host application provides to the viewer core.
//!
//! The core never talks to dialogs, map canvases or project files
//! directly; it goes through these traits.

use std::sync::Arc;

use crate::error::HistoryError;
use crate::models::{ConnectionDescriptor, Credentials};

/// Provider key the host uses for PostgreSQL transaction groups.
pub const POSTGRES_PROVIDER: &str = "postgres";

/// Host-side transaction coordination across editing sessions.
pub trait TransactionCoordinator: Send + Sync {
    /// Whether the current project runs its edits in shared transactions.
    fn auto_transaction(&self) -> bool;

    /// Shared connection for a provider and a normalized descriptor, if the
    /// host holds one.
    fn transaction_group(
        &self,
        provider_key: &str,
        normalized: &ConnectionDescriptor,
    ) -> Option<Arc<dyn SharedConnection>>;
}

/// A connection owned by the host's transaction group.
///
/// The host commits it through its own save action.
pub trait SharedConnection: Send + Sync {
    /// Execute SQL; returns the host's error text, empty on success.
    fn execute_sql(&self, sql: &str) -> String;
}

/// Asks the user for credentials after an authentication failure.
pub trait CredentialPrompt: Send + Sync {
    /// `None` when the user cancelled.
    fn prompt(&self, domain: &str, error_text: &str) -> Option<Credentials>;
}

/// A host layer that can be put in edit mode.
pub trait EditableLayer: Send + Sync {
    /// Host layer id.
    fn id(&self) -> String;

    /// Display name.
    fn name(&self) -> String;

    /// Database the layer reads from, when it is a PostgreSQL layer.
    fn source(&self) -> Option<ConnectionDescriptor>;

    /// Whether an edit session is open on the layer.
    fn is_editing(&self) -> bool;

    /// Open an edit session. Returns false when the host refused.
    fn start_editing(&self) -> bool;

    /// Close the edit session, committing or discarding its buffer.
    fn end_editing(&self, commit: bool) -> Result<(), String>;
}

/// Read-only catalog of the host's layers.
pub trait LayerRegistry: Send + Sync {
    fn layers(&self) -> Vec<Arc<dyn EditableLayer>>;

    fn layer(&self, id: &str) -> Option<Arc<dyn EditableLayer>> {
        self.layers().into_iter().find(|l| l.id() == id)
    }
}

/// Project-scoped key-value persistence.
pub trait ProjectStore: Send + Sync {
    fn read_entry(&self, scope: &str, key: &str) -> Result<Option<String>, HistoryError>;

    fn write_entry(&self, scope: &str, key: &str, value: &str) -> Result<(), HistoryError>;

    fn read_list_entry(&self, scope: &str, key: &str) -> Result<Vec<String>, HistoryError>;

    fn write_list_entry(&self, scope: &str, key: &str, values: &[String])
        -> Result<(), HistoryError>;
}

/// Host without layers, used by the command-line front end.
#[derive(Debug, Default)]
pub struct NoLayers;

impl LayerRegistry for NoLayers {
    fn layers(&self) -> Vec<Arc<dyn EditableLayer>> {
        Vec::new()
    }
}

/// The host collaborators a history session needs.
#[derive(Clone)]
pub struct HostServices {
    /// `None` when the host has no transaction groups at all
    pub coordinator: Option<Arc<dyn TransactionCoordinator>>,
    pub prompt: Arc<dyn CredentialPrompt>,
    pub layers: Arc<dyn LayerRegistry>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("coordinator", &self.coordinator.is_some())
            .finish_non_exhaustive()
    }
}
