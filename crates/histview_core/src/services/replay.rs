//! Replaying audit events through a stored procedure.

use std::sync::Arc;

use crate::error::HistoryError;
use crate::models::{ConnectionDescriptor, ReplayOutcome};
use crate::services::host::{EditableLayer, LayerRegistry};
use crate::services::wrapper::ConnectionWrapper;

/// Keeps a host layer in edit mode while a replay runs.
///
/// The edit session is opened only if the layer was not already editing,
/// and closed (committing the layer's edit buffer) exactly once: by
/// [`EditBracket::release`] or, failing that, on drop.
pub struct EditBracket {
    layer: Option<Arc<dyn EditableLayer>>,
}

impl EditBracket {
    /// Put `layer` in edit mode. With no layer the bracket does nothing.
    pub fn open(layer: Option<Arc<dyn EditableLayer>>) -> Result<Self, HistoryError> {
        let Some(layer) = layer else {
            return Ok(Self { layer: None });
        };
        if layer.is_editing() {
            tracing::debug!(layer = %layer.name(), "Layer already in edit mode");
            return Ok(Self { layer: None });
        }
        if !layer.start_editing() {
            return Err(HistoryError::internal(format!(
                "could not start editing layer \"{}\"",
                layer.name()
            )));
        }
        tracing::debug!(layer = %layer.name(), "Started edit session for replay");
        Ok(Self { layer: Some(layer) })
    }

    /// Whether this bracket still has an edit session to close.
    pub fn is_held(&self) -> bool {
        self.layer.is_some()
    }

    /// Close the edit session now. Later calls do nothing.
    pub fn release(&mut self) -> Result<(), String> {
        match self.layer.take() {
            Some(layer) => {
                tracing::debug!(layer = %layer.name(), "Ending edit session after replay");
                layer.end_editing(true)
            }
            None => Ok(()),
        }
    }
}

impl Drop for EditBracket {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to end edit session");
        }
    }
}

/// First host layer reading from the same database as `descriptor`.
pub fn owning_layer(
    layers: &dyn LayerRegistry,
    descriptor: &ConnectionDescriptor,
) -> Option<Arc<dyn EditableLayer>> {
    layers
        .layers()
        .into_iter()
        .find(|layer| layer.source().is_some_and(|source| source.same_database(descriptor)))
}

/// Whether `name` is a plain, optionally schema-qualified, identifier.
pub fn is_valid_procedure_name(name: &str) -> bool {
    fn identifier(part: &str) -> bool {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    }
    match name.split_once('.') {
        Some((schema, function)) => identifier(schema) && identifier(function),
        None => identifier(name),
    }
}

/// Runs replay procedures on the write connection.
pub struct ReplayCoordinator;

impl ReplayCoordinator {
    /// Call `procedure(event_id)` and commit.
    ///
    /// `owner` is put in edit mode around the call. Every failure, from name
    /// validation to commit, ends up in the returned outcome; the
    /// connection stays open either way.
    pub fn replay(
        procedure: &str,
        event_id: i64,
        write: &mut ConnectionWrapper,
        owner: Option<Arc<dyn EditableLayer>>,
    ) -> ReplayOutcome {
        let procedure = procedure.trim();
        if !is_valid_procedure_name(procedure) {
            return ReplayOutcome::failed(format!("invalid replay function name \"{procedure}\""));
        }
        if !write.is_valid() {
            return ReplayOutcome::failed("no write connection is open");
        }

        let sql = format!("SELECT {procedure}({event_id})");
        tracing::info!(event_id, procedure, "Replaying event");

        let executed = match EditBracket::open(owner) {
            Ok(mut bracket) => {
                let result = write.execute_sql(&sql);
                if let Err(e) = bracket.release() {
                    tracing::warn!(error = %e, "Failed to end edit session");
                }
                result
            }
            Err(e) => Err(e),
        };

        let committed = write.commit();

        let outcome = match (executed, committed) {
            (Ok(()), Ok(())) => ReplayOutcome::succeeded(),
            (Err(e), _) | (Ok(()), Err(e)) => ReplayOutcome::failed(e.engine_context()),
        };

        if outcome.is_success() {
            tracing::info!(event_id, "Event replayed");
        } else {
            tracing::warn!(event_id, error = %outcome.error, "Replay failed");
        }
        outcome
    }
}

type GateObserver = Box<dyn Fn(bool) + Send + Sync>;

/// Decides whether replay can be offered.
///
/// Replay is available when a replay function is configured and no host
/// layer on the audited database has an edit session open. Call
/// [`ReplayGate::rescan`] whenever an edit state changes; observers hear
/// about every change of availability.
pub struct ReplayGate {
    replay_function: Option<String>,
    database: Option<ConnectionDescriptor>,
    foreign_edit: bool,
    available: bool,
    observers: Vec<GateObserver>,
}

impl ReplayGate {
    pub fn new(replay_function: Option<String>, database: Option<ConnectionDescriptor>) -> Self {
        let mut gate = Self {
            replay_function: None,
            database,
            foreign_edit: false,
            available: false,
            observers: Vec::new(),
        };
        gate.replay_function = replay_function.filter(|f| !f.trim().is_empty());
        gate.available = gate.compute();
        gate
    }

    /// Replace the configuration; observers are told if availability moved.
    pub fn configure(
        &mut self,
        replay_function: Option<String>,
        database: Option<ConnectionDescriptor>,
    ) {
        self.replay_function = replay_function.filter(|f| !f.trim().is_empty());
        self.database = database;
        self.update();
    }

    pub fn replay_function(&self) -> Option<&str> {
        self.replay_function.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Register a callback receiving the new availability on each change.
    pub fn subscribe(&mut self, observer: impl Fn(bool) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Re-read every layer's edit state. Returns the new availability.
    pub fn rescan(&mut self, layers: &dyn LayerRegistry) -> bool {
        self.foreign_edit = match &self.database {
            Some(database) => layers.layers().iter().any(|layer| {
                layer.is_editing()
                    && layer.source().is_some_and(|source| source.same_database(database))
            }),
            None => false,
        };
        self.update();
        self.available
    }

    fn compute(&self) -> bool {
        self.replay_function.is_some() && !self.foreign_edit
    }

    fn update(&mut self) {
        let available = self.compute();
        if available != self.available {
            self.available = available;
            tracing::debug!(available, "Replay availability changed");
            for observer in &self.observers {
                observer(available);
            }
        }
    }
}

impl std::fmt::Debug for ReplayGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGate")
            .field("replay_function", &self.replay_function)
            .field("foreign_edit", &self.foreign_edit)
            .field("available", &self.available)
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::credentials::{CredentialService, SessionCredentialsProvider};
    use crate::services::wrapper::ConnectContext;
    use crate::test_support::{FakeConnector, FakeCoordinator, FakeLayer, FakeLayers, ScriptedPrompt};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn db() -> ConnectionDescriptor {
        ConnectionDescriptor::parse("host=db dbname=gis").unwrap()
    }

    fn open_write(connector: &FakeConnector, coordinator: &FakeCoordinator) -> ConnectionWrapper {
        let credentials =
            CredentialService::with_provider(Box::new(SessionCredentialsProvider::new()));
        let prompt = ScriptedPrompt::new(vec![]);
        let ctx = ConnectContext {
            connector,
            coordinator: Some(coordinator),
            prompt: &prompt,
            credentials: &credentials,
        };
        let mut wrapper = ConnectionWrapper::new();
        wrapper.open(&db(), &ctx).unwrap();
        wrapper
    }

    #[test]
    fn test_procedure_names() {
        assert!(is_valid_procedure_name("audit.replay_event"));
        assert!(is_valid_procedure_name("replay"));
        assert!(!is_valid_procedure_name("replay(1); DROP TABLE x; --"));
        assert!(!is_valid_procedure_name("a.b.c"));
        assert!(!is_valid_procedure_name(""));
        assert!(!is_valid_procedure_name("1replay"));
    }

    #[test]
    fn test_successful_replay_commits() {
        let connector = FakeConnector::accepting();
        let mut write = open_write(&connector, &FakeCoordinator::inactive());
        let outcome = ReplayCoordinator::replay("audit.replay_event", 42, &mut write, None);
        assert!(outcome.is_success());
        assert!(outcome.error.is_empty());

        let session = connector.last_session();
        assert_eq!(session.executed(), vec!["SELECT audit.replay_event(42)".to_string()]);
        assert_eq!(session.commits(), 1);
    }

    #[test]
    fn test_failure_reports_engine_context_and_still_commits() {
        let connector = FakeConnector::accepting();
        let mut write = open_write(&connector, &FakeCoordinator::inactive());
        connector.last_session().fail_execute_with("row not found", "PL/pgSQL function replay line 3");

        let layer = FakeLayer::new("roads", Some(db()));
        let outcome = ReplayCoordinator::replay("replay", 7, &mut write, Some(layer.clone()));

        assert!(!outcome.is_success());
        assert!(outcome.error.contains("row not found"));
        assert!(outcome.error.contains("CONTEXT: PL/pgSQL function replay line 3"));
        assert_eq!(connector.last_session().commits(), 1);
        assert_eq!(layer.starts(), 1);
        assert_eq!(layer.ends(), 1);
        assert!(!layer.is_editing());
        assert!(write.is_valid());
    }

    #[test]
    fn test_bracket_released_exactly_once_on_success() {
        let connector = FakeConnector::accepting();
        let mut write = open_write(&connector, &FakeCoordinator::inactive());
        let layer = FakeLayer::new("roads", Some(db()));
        let outcome = ReplayCoordinator::replay("replay", 1, &mut write, Some(layer.clone()));
        assert!(outcome.is_success());
        assert_eq!((layer.starts(), layer.ends()), (1, 1));
        assert_eq!(layer.commits(), 1);
    }

    #[test]
    fn test_bracket_leaves_existing_session_alone() {
        let layer = FakeLayer::new("roads", Some(db()));
        assert!(layer.start_editing());
        {
            let bracket = EditBracket::open(Some(layer.clone())).unwrap();
            assert!(!bracket.is_held());
        }
        assert!(layer.is_editing());
        assert_eq!(layer.ends(), 0);
    }

    #[test]
    fn test_bracket_drop_releases_once() {
        let layer = FakeLayer::new("roads", Some(db()));
        let mut bracket = EditBracket::open(Some(layer.clone())).unwrap();
        assert!(layer.is_editing());
        bracket.release().unwrap();
        drop(bracket);
        assert_eq!(layer.ends(), 1);
    }

    #[test]
    fn test_invalid_name_is_never_executed() {
        let connector = FakeConnector::accepting();
        let mut write = open_write(&connector, &FakeCoordinator::inactive());
        let outcome = ReplayCoordinator::replay("x(1); DROP TABLE t", 1, &mut write, None);
        assert!(!outcome.is_success());
        assert!(connector.last_session().executed().is_empty());
    }

    #[test]
    fn test_replay_on_shared_connection() {
        let coordinator = FakeCoordinator::active();
        let connector = FakeConnector::accepting();
        let mut write = open_write(&connector, &coordinator);
        assert!(write.is_shared());

        let outcome = ReplayCoordinator::replay("replay", 3, &mut write, None);
        assert!(outcome.is_success());
        assert_eq!(coordinator.group().executed(), vec!["SELECT replay(3)".to_string()]);
    }

    #[test]
    fn test_owning_layer_matches_database() {
        let other = FakeLayer::new("other", Some(ConnectionDescriptor::parse("host=x dbname=y").unwrap()));
        let roads = FakeLayer::new("roads", Some(db()));
        let layers = FakeLayers::new(vec![FakeLayer::new("raster", None), other, roads]);
        assert_eq!(owning_layer(&layers, &db()).map(|l| l.name()), Some("roads".to_string()));
    }

    #[test]
    fn test_gate_tracks_configuration_and_foreign_edits() {
        let roads = FakeLayer::new("roads", Some(db()));
        let elsewhere = FakeLayer::new(
            "elsewhere",
            Some(ConnectionDescriptor::parse("host=other dbname=gis").unwrap()),
        );
        let layers = FakeLayers::new(vec![roads.clone(), elsewhere.clone()]);

        let changes = Arc::new(AtomicUsize::new(0));
        let mut gate = ReplayGate::new(None, Some(db()));
        let seen = changes.clone();
        gate.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!gate.is_available());

        gate.configure(Some("replay".into()), Some(db()));
        assert!(gate.is_available());

        elsewhere.start_editing();
        assert!(gate.rescan(&layers));

        roads.start_editing();
        assert!(!gate.rescan(&layers));
        assert!(!gate.rescan(&layers));

        roads.end_editing(false).unwrap();
        assert!(gate.rescan(&layers));

        assert_eq!(changes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blank_replay_function_is_not_configured() {
        let gate = ReplayGate::new(Some("  ".into()), Some(db()));
        assert!(!gate.is_available());
        assert_eq!(gate.replay_function(), None);
    }
}
