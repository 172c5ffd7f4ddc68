//! In-memory stand-ins for the database and host collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::error::HistoryError;
use crate::models::{Action, AuditEvent, ConnectionDescriptor, Credentials};
use crate::services::connection::{Connector, DirectConnection, EventCursor};
use crate::services::host::{
    CredentialPrompt, EditableLayer, LayerRegistry, SharedConnection, TransactionCoordinator,
};
use crate::services::query::EventQuery;

pub fn event(
    event_id: i64,
    table_name: &str,
    action: Action,
    row_data: Option<&str>,
    changed_fields: Option<&str>,
) -> AuditEvent {
    AuditEvent {
        event_id,
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        table_name: table_name.to_string(),
        action,
        application_name: Some("qgis".to_string()),
        row_data: row_data.map(str::to_string),
        changed_fields: changed_fields.map(str::to_string),
    }
}

// ============================================================================
// Cursor
// ============================================================================

#[derive(Default)]
struct CursorState {
    pending: VecDeque<AuditEvent>,
    announced: usize,
    fetched: usize,
    fetch_sizes: Vec<usize>,
}

/// Cursor over a fixed list of events that counts what it hands out.
#[derive(Clone, Default)]
pub struct FakeCursor {
    state: Arc<Mutex<CursorState>>,
}

impl FakeCursor {
    pub fn new(events: Vec<AuditEvent>) -> Self {
        let announced = events.len();
        let state = CursorState { pending: events.into(), announced, ..Default::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Announce a different total than the rows actually available.
    pub fn announcing(self, total: usize) -> Self {
        self.state.lock().announced = total;
        self
    }

    /// Rows handed out so far.
    pub fn fetched(&self) -> usize {
        self.state.lock().fetched
    }

    pub fn fetch_sizes(&self) -> Vec<usize> {
        self.state.lock().fetch_sizes.clone()
    }
}

impl EventCursor for FakeCursor {
    fn row_count(&self) -> usize {
        self.state.lock().announced
    }

    fn fetch_many(&mut self, n: usize) -> Result<Vec<AuditEvent>, HistoryError> {
        let mut state = self.state.lock();
        let take = n.min(state.pending.len());
        let rows: Vec<AuditEvent> = state.pending.drain(..take).collect();
        state.fetched += rows.len();
        state.fetch_sizes.push(n);
        Ok(rows)
    }
}

// ============================================================================
// Direct connection
// ============================================================================

#[derive(Default)]
struct SessionState {
    executed: Vec<String>,
    commits: usize,
    execute_error: Option<(String, String)>,
    responses: VecDeque<Vec<Vec<Option<String>>>>,
    queries: Vec<(String, Vec<String>)>,
    events: Vec<AuditEvent>,
    event_queries: Vec<EventQuery>,
    cursors: Vec<FakeCursor>,
}

/// Direct connection recording everything sent to it.
#[derive(Clone, Default)]
pub struct FakeSession {
    state: Arc<Mutex<SessionState>>,
}

impl FakeSession {
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// Make every further execute fail with a query error carrying an
    /// engine context.
    pub fn fail_execute_with(&self, message: &str, context: &str) {
        self.state.lock().execute_error = Some((message.to_string(), context.to_string()));
    }

    /// Queue the rows returned by the next catalog query.
    pub fn respond_with(&self, rows: Vec<Vec<Option<String>>>) {
        self.state.lock().responses.push_back(rows);
    }

    /// Catalog queries with their parameters.
    pub fn queries(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().queries.clone()
    }

    /// Events served by every event cursor opened from now on.
    pub fn serve_events(&self, events: Vec<AuditEvent>) {
        self.state.lock().events = events;
    }

    pub fn event_queries(&self) -> Vec<EventQuery> {
        self.state.lock().event_queries.clone()
    }

    pub fn last_cursor(&self) -> FakeCursor {
        self.state.lock().cursors.last().cloned().expect("no cursor opened")
    }
}

impl DirectConnection for FakeSession {
    fn execute(&mut self, sql: &str) -> Result<(), HistoryError> {
        let mut state = self.state.lock();
        state.executed.push(sql.to_string());
        match &state.execute_error {
            Some((message, context)) => Err(HistoryError::Query {
                message: message.clone(),
                detail: None,
                hint: None,
                context: Some(context.clone()),
                code: Some("P0001".to_string()),
            }),
            None => Ok(()),
        }
    }

    fn commit(&mut self) -> Result<(), HistoryError> {
        self.state.lock().commits += 1;
        Ok(())
    }

    fn open_event_cursor(
        &mut self,
        query: &EventQuery,
    ) -> Result<Box<dyn EventCursor>, HistoryError> {
        let mut state = self.state.lock();
        state.event_queries.push(query.clone());
        let cursor = FakeCursor::new(state.events.clone());
        state.cursors.push(cursor.clone());
        Ok(Box::new(cursor))
    }

    fn query_text(
        &mut self,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, HistoryError> {
        let mut state = self.state.lock();
        state.queries.push((sql.to_string(), params.iter().map(|p| p.to_string()).collect()));
        Ok(state.responses.pop_front().unwrap_or_default())
    }
}

// ============================================================================
// Connector
// ============================================================================

enum Access {
    Open,
    Password { user: String, password: String },
    Refused,
}

struct ConnectorState {
    access: Access,
    attempts: Vec<ConnectionDescriptor>,
    sessions: Vec<FakeSession>,
    events: Vec<AuditEvent>,
}

/// Connector handing out [`FakeSession`]s.
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    fn with_access(access: Access) -> Self {
        let state = ConnectorState {
            access,
            attempts: Vec::new(),
            sessions: Vec::new(),
            events: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Every attempt succeeds.
    pub fn accepting() -> Self {
        Self::with_access(Access::Open)
    }

    /// Attempts succeed only with this user and password.
    pub fn requiring(user: &str, password: &str) -> Self {
        Self::with_access(Access::Password { user: user.to_string(), password: password.to_string() })
    }

    /// Every attempt fails with a connection error.
    pub fn refusing() -> Self {
        Self::with_access(Access::Refused)
    }

    /// Events served by the sessions this connector opens.
    pub fn with_events(self, events: Vec<AuditEvent>) -> Self {
        self.state.lock().events = events;
        self
    }

    pub fn attempts(&self) -> Vec<ConnectionDescriptor> {
        self.state.lock().attempts.clone()
    }

    pub fn sessions(&self) -> Vec<FakeSession> {
        self.state.lock().sessions.clone()
    }

    pub fn last_session(&self) -> FakeSession {
        self.state.lock().sessions.last().cloned().expect("no session opened")
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn DirectConnection>, HistoryError> {
        let mut state = self.state.lock();
        state.attempts.push(descriptor.clone());

        match &state.access {
            Access::Open => {}
            Access::Password { user, password } => {
                if descriptor.user() != Some(user.as_str())
                    || descriptor.password() != Some(password.as_str())
                {
                    return Err(HistoryError::authentication("password authentication failed"));
                }
            }
            Access::Refused => return Err(HistoryError::connection("connection refused")),
        }

        let session = FakeSession::default();
        session.serve_events(state.events.clone());
        state.sessions.push(session.clone());
        Ok(Box::new(session))
    }
}

// ============================================================================
// Host collaborators
// ============================================================================

/// Prompt answering from a script, then cancelling.
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<Option<Credentials>>>,
    repeat: Option<Credentials>,
    calls: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<Option<Credentials>>) -> Self {
        Self { answers: Mutex::new(answers.into()), repeat: None, calls: AtomicUsize::new(0) }
    }

    /// Prompt that always answers with the same credentials.
    pub fn repeating(credentials: Credentials) -> Self {
        Self { answers: Mutex::new(VecDeque::new()), repeat: Some(credentials), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialPrompt for ScriptedPrompt {
    fn prompt(&self, _domain: &str, _error_text: &str) -> Option<Credentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answers.lock().pop_front() {
            Some(answer) => answer,
            None => self.repeat.clone(),
        }
    }
}

/// Host transaction group connection.
#[derive(Default)]
pub struct FakeGroup {
    executed: Mutex<Vec<String>>,
    error: Mutex<Option<String>>,
}

impl FakeGroup {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn fail_with(&self, error: &str) {
        *self.error.lock() = Some(error.to_string());
    }
}

impl SharedConnection for FakeGroup {
    fn execute_sql(&self, sql: &str) -> String {
        self.executed.lock().push(sql.to_string());
        self.error.lock().clone().unwrap_or_else(|| "Status 2 ()".to_string())
    }
}

pub struct FakeCoordinator {
    auto_transaction: bool,
    has_group: bool,
    group: Arc<FakeGroup>,
    requests: Mutex<Vec<String>>,
}

impl FakeCoordinator {
    fn build(auto_transaction: bool, has_group: bool) -> Self {
        Self {
            auto_transaction,
            has_group,
            group: Arc::new(FakeGroup::default()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Transaction groups enabled, one group for every database.
    pub fn active() -> Self {
        Self::build(true, true)
    }

    /// Transaction groups disabled in the project.
    pub fn inactive() -> Self {
        Self::build(false, true)
    }

    /// Transaction groups enabled, but none for the requested database.
    pub fn without_group() -> Self {
        Self::build(true, false)
    }

    pub fn group(&self) -> Arc<FakeGroup> {
        self.group.clone()
    }

    /// Normalized descriptors the host was asked for, as conninfo.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl TransactionCoordinator for FakeCoordinator {
    fn auto_transaction(&self) -> bool {
        self.auto_transaction
    }

    fn transaction_group(
        &self,
        _provider_key: &str,
        normalized: &ConnectionDescriptor,
    ) -> Option<Arc<dyn SharedConnection>> {
        self.requests.lock().push(normalized.to_conninfo());
        if self.has_group {
            Some(self.group.clone())
        } else {
            None
        }
    }
}

/// Editable layer counting its edit sessions.
pub struct FakeLayer {
    name: String,
    source: Option<ConnectionDescriptor>,
    editing: AtomicBool,
    starts: AtomicUsize,
    ends: AtomicUsize,
    commits: AtomicUsize,
}

impl FakeLayer {
    pub fn new(name: &str, source: Option<ConnectionDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            source,
            editing: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    /// Edit sessions ended with their buffer committed.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

impl EditableLayer for FakeLayer {
    fn id(&self) -> String {
        format!("{}_id", self.name)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn source(&self) -> Option<ConnectionDescriptor> {
        self.source.clone()
    }

    fn is_editing(&self) -> bool {
        self.editing.load(Ordering::SeqCst)
    }

    fn start_editing(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.editing.store(true, Ordering::SeqCst);
        true
    }

    fn end_editing(&self, commit: bool) -> Result<(), String> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        if commit {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        self.editing.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeLayers {
    layers: Vec<Arc<FakeLayer>>,
}

impl FakeLayers {
    pub fn new(layers: Vec<Arc<FakeLayer>>) -> Self {
        Self { layers }
    }
}

impl LayerRegistry for FakeLayers {
    fn layers(&self) -> Vec<Arc<dyn EditableLayer>> {
        self.layers.iter().map(|l| l.clone() as Arc<dyn EditableLayer>).collect()
    }
}
