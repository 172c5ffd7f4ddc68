//! History session state.
//!
//! One explicit object per viewer session. It owns both connections, the
//! credential store, the geometry column cache, the current result model
//! and the replay gate, and drives the flow filter → query → model →
//! decode → replay → rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::HistoryError;
use crate::models::{
    ConnectionDescriptor, EventDetail, EventFilter, MappedLayer, ProjectSettings, ReplayOutcome,
};
use crate::services::connection::{Connector, PgConnector};
use crate::services::decoder::describe_event;
use crate::services::event_model::EventModel;
use crate::services::host::HostServices;
use crate::services::query::QueryService;
use crate::services::replay::{owning_layer, ReplayCoordinator, ReplayGate};
use crate::services::schema::GeometryColumnCache;
use crate::services::{CredentialService, LocalStorage};
use crate::services::wrapper::{ConnectContext, ConnectionWrapper};

/// State of one history viewer session.
pub struct HistoryState {
    /// Current search result; dropped before the connections
    model: Option<EventModel>,
    /// Filter of the current result, reused after a replay
    last_filter: Option<EventFilter>,
    /// Read connection, never part of a host transaction
    read: ConnectionWrapper,
    /// Write connection for replays, shared with the host when possible
    write: ConnectionWrapper,
    geometry_columns: GeometryColumnCache,
    settings: ProjectSettings,
    gate: ReplayGate,
    host: HostServices,
    connector: Arc<dyn Connector>,
    credentials: CredentialService,
    storage: LocalStorage,
    data_dir: PathBuf,
    /// Runtime driving the PostgreSQL connector; dropped last
    runtime: Option<tokio::runtime::Runtime>,
}

fn connect_context<'a>(
    connector: &'a Arc<dyn Connector>,
    host: &'a HostServices,
    credentials: &'a CredentialService,
) -> ConnectContext<'a> {
    ConnectContext {
        connector: connector.as_ref(),
        coordinator: host.coordinator.as_deref(),
        prompt: host.prompt.as_ref(),
        credentials,
    }
}

impl HistoryState {
    /// Create a session in the default data directory.
    pub fn new(host: HostServices) -> Result<Self, HistoryError> {
        let data_dir = crate::services::storage::default_data_dir();
        Self::with_data_dir(data_dir, host)
    }

    /// Create a session with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf, host: HostServices) -> Result<Self, HistoryError> {
        crate::services::storage::init_data_dir(&data_dir)?;
        let storage = LocalStorage::open(data_dir)?;
        Self::with_storage(storage, host)
    }

    /// Create a session on existing storage, connecting to PostgreSQL on a
    /// runtime owned by the session.
    pub fn with_storage(storage: LocalStorage, host: HostServices) -> Result<Self, HistoryError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| HistoryError::internal(format!("Failed to create tokio runtime: {e}")))?;

        let connector: Arc<dyn Connector> = Arc::new(PgConnector::new(runtime.handle().clone()));

        let mut state = Self::with_connector(storage, connector, CredentialService::new(), host)?;
        state.runtime = Some(runtime);
        Ok(state)
    }

    /// Create a session around an existing connector.
    pub fn with_connector(
        storage: LocalStorage,
        connector: Arc<dyn Connector>,
        credentials: CredentialService,
        host: HostServices,
    ) -> Result<Self, HistoryError> {
        let settings = ProjectSettings::load(&storage)?;
        let gate = ReplayGate::new(settings.replay_function.clone(), settings.descriptor().ok());
        let data_dir = storage.data_dir().to_path_buf();

        tracing::info!(
            data_dir = %data_dir.display(),
            project = storage.project(),
            credentials = credentials.provider_name(),
            "HistoryState initialized"
        );

        Ok(Self {
            model: None,
            last_filter: None,
            read: ConnectionWrapper::direct_only(),
            write: ConnectionWrapper::new(),
            geometry_columns: GeometryColumnCache::new(),
            settings,
            gate,
            host,
            connector,
            credentials,
            storage,
            data_dir,
            runtime: None,
        })
    }

    // ========== Configuration ==========

    pub fn settings(&self) -> &ProjectSettings {
        &self.settings
    }

    /// Store new project settings.
    ///
    /// Connections to another database are closed and the current result
    /// is discarded.
    pub fn configure(&mut self, settings: ProjectSettings) -> Result<(), HistoryError> {
        settings.save(&self.storage)?;

        let descriptor = settings.descriptor().ok();
        let moved = match (self.read.descriptor(), &descriptor) {
            (Some(current), Some(next)) => !current.same_database(next),
            (Some(_), None) => true,
            _ => false,
        };
        if moved {
            self.close();
        }

        self.model = None;
        self.last_filter = None;
        self.geometry_columns.clear();
        self.gate.configure(settings.replay_function.clone(), descriptor);
        self.settings = settings;
        tracing::info!(audit_table = %self.settings.audit_table, "Project settings saved");
        Ok(())
    }

    /// Layers of the table map the host still has, in layer id order.
    pub fn mapped_layers(&self) -> Vec<MappedLayer> {
        self.settings
            .table_map
            .iter()
            .filter_map(|(id, table)| {
                let layer = self.host.layers.layer(id)?;
                Some(MappedLayer { id: id.clone(), name: layer.name(), table: table.clone() })
            })
            .collect()
    }

    /// A filter on the audited table of one mapped layer, and on one of its
    /// features when `feature_id` is given. Every action type is included.
    pub fn filter_for_layer(
        &self,
        layer_id: &str,
        feature_id: Option<&str>,
    ) -> Result<EventFilter, HistoryError> {
        let table = self.settings.table_map.get(layer_id).ok_or_else(|| {
            HistoryError::config(format!("Layer {layer_id} is not mapped to an audited table"))
        })?;
        if self.host.layers.layer(layer_id).is_none() {
            return Err(HistoryError::config(format!("Layer {layer_id} is no longer in the project")));
        }

        Ok(EventFilter {
            table: Some(table.clone()),
            feature_id: feature_id.map(str::to_string),
            ..Default::default()
        })
    }

    // ========== Connections ==========

    /// Open the read and write connections to the configured database.
    pub fn open_connections(&mut self) -> Result<(), HistoryError> {
        let descriptor = self.settings.descriptor()?;
        let ctx = connect_context(&self.connector, &self.host, &self.credentials);
        self.read.open(&descriptor, &ctx)?;
        self.write.open(&descriptor, &ctx)?;
        self.gate.rescan(self.host.layers.as_ref());
        Ok(())
    }

    fn ensure_read(&mut self) -> Result<(), HistoryError> {
        if self.read.is_valid() {
            return Ok(());
        }
        let descriptor = self.settings.descriptor()?;
        let ctx = connect_context(&self.connector, &self.host, &self.credentials);
        self.read.open(&descriptor, &ctx)
    }

    fn ensure_write(&mut self) -> Result<(), HistoryError> {
        if self.write.is_valid() {
            return Ok(());
        }
        let descriptor = self.settings.descriptor()?;
        let ctx = connect_context(&self.connector, &self.host, &self.credentials);
        self.write.open(&descriptor, &ctx)
    }

    /// Drop the result model and close both connections.
    pub fn close(&mut self) {
        self.model = None;
        self.read.close();
        self.write.close();
        self.geometry_columns.clear();
    }

    pub fn database(&self) -> Option<&ConnectionDescriptor> {
        self.read.descriptor()
    }

    pub fn read_connection(&mut self) -> &mut ConnectionWrapper {
        &mut self.read
    }

    pub fn write_connection(&self) -> &ConnectionWrapper {
        &self.write
    }

    // ========== Search ==========

    /// Run a search on the audit table. Returns the number of matching
    /// events; rows are fetched as they are read from the model.
    pub fn search(&mut self, filter: EventFilter) -> Result<usize, HistoryError> {
        let audit_table = self.settings.audit_table_ref()?;
        self.ensure_read()?;

        // Release the previous cursor before declaring a new one.
        self.model = None;
        let model = QueryService::search(&mut self.read, &audit_table, &filter)?;
        let count = model.count();

        self.model = Some(model);
        self.last_filter = Some(filter);
        Ok(count)
    }

    pub fn model(&self) -> Option<&EventModel> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> Option<&mut EventModel> {
        self.model.as_mut()
    }

    pub fn last_filter(&self) -> Option<&EventFilter> {
        self.last_filter.as_ref()
    }

    /// Decoded change set of one row of the current result.
    pub fn event_detail(&mut self, row: usize) -> Result<EventDetail, HistoryError> {
        let model =
            self.model.as_mut().ok_or_else(|| HistoryError::internal("No search has been run"))?;
        let event = model.get(row)?.clone();

        self.ensure_read()?;
        let columns = self.geometry_columns.get(&mut self.read, &event.table_name)?;
        Ok(describe_event(&event, columns))
    }

    // ========== Replay ==========

    pub fn is_replay_available(&self) -> bool {
        self.gate.is_available()
    }

    /// Register a callback told about every change of replay availability.
    pub fn subscribe_replay_availability(&mut self, observer: impl Fn(bool) + Send + Sync + 'static) {
        self.gate.subscribe(observer);
    }

    /// Replay the event at `row` and refresh the result.
    ///
    /// Replay failures are reported in the outcome; an error is returned
    /// only when the row or the write connection cannot be reached.
    pub fn replay(&mut self, row: usize) -> Result<ReplayOutcome, HistoryError> {
        let Some(procedure) = self.gate.replay_function().map(str::to_string) else {
            return Ok(ReplayOutcome::failed("No replay function has been configured"));
        };
        if !self.gate.is_available() {
            return Ok(ReplayOutcome::failed(
                "A layer of the audited database is being edited, replay is not available",
            ));
        }

        let model =
            self.model.as_mut().ok_or_else(|| HistoryError::internal("No search has been run"))?;
        let event_id = model.get(row)?.event_id;

        self.ensure_write()?;
        let owner = self
            .write
            .descriptor()
            .and_then(|descriptor| owning_layer(self.host.layers.as_ref(), descriptor));

        let outcome = ReplayCoordinator::replay(&procedure, event_id, &mut self.write, owner);

        if let Some(filter) = self.last_filter.clone() {
            if let Err(e) = self.search(filter) {
                tracing::warn!(error = %e, "Failed to refresh events after replay");
            }
        }
        self.on_edit_state_changed();

        Ok(outcome)
    }

    /// Re-read the host layers' edit states. Returns the replay
    /// availability.
    pub fn on_edit_state_changed(&mut self) -> bool {
        self.gate.rescan(self.host.layers.as_ref())
    }

    // ========== Service Accessors ==========

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Runtime driving the PostgreSQL connector, if the session owns one.
    pub fn runtime(&self) -> Option<&tokio::runtime::Runtime> {
        self.runtime.as_ref()
    }
}

impl std::fmt::Debug for HistoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryState")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("model", &self.model)
            .field("gate", &self.gate)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}
