//! End-to-end verification of the viewer core.
//!
//! These tests run the documented properties across module boundaries:
//! - Descriptor equality is symmetric and service-based when possible
//! - The event query restricts actions in exactly one clause
//! - Free text escaping matches literally
//! - Payload decoding (hstore and EWKB)
//! - Lazy fetching of the result model
//! - Replay bracket release and outcome reporting
//! - The filter → count → fetch scenario through `HistoryState`
//! - Passwords never reach log output, errors carry hints

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use tempfile::TempDir;

    use crate::error::HistoryError;
    use crate::models::{
        Action, ActionSet, ConnectionDescriptor, Credentials, EventFilter, ProjectSettings,
        TableRef,
    };
    use crate::services::credentials::SessionCredentialsProvider;
    use crate::services::decoder::decode_hstore;
    use crate::services::ewkb::geometry_from_ewkb_hex;
    use crate::services::event_model::EventModel;
    use crate::services::host::HostServices;
    use crate::services::query::{escape_like, QueryBuilder};
    use crate::services::replay::ReplayCoordinator;
    use crate::services::wrapper::{ConnectContext, ConnectionWrapper};
    use crate::services::{CredentialService, LocalStorage};
    use crate::state::HistoryState;
    use crate::test_support::{
        event, FakeConnector, FakeCoordinator, FakeCursor, FakeLayer, FakeLayers, ScriptedPrompt,
    };

    fn descriptor(conninfo: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::parse(conninfo).unwrap()
    }

    // =========================================================================
    // Descriptor equality
    // =========================================================================

    #[test]
    fn test_descriptor_equality_is_symmetric() {
        let descriptors = [
            descriptor("host=db port=5432 dbname=gis user=alice"),
            descriptor("host=db dbname=gis user=bob password=x"),
            descriptor("host=db port=5433 dbname=gis"),
            descriptor("host=other dbname=gis"),
            descriptor("service=prod"),
            descriptor("service=prod host=elsewhere dbname=other"),
            descriptor("service=prod sslmode=require"),
            descriptor("service=test"),
            descriptor("dbname=gis"),
        ];

        for a in &descriptors {
            for b in &descriptors {
                assert_eq!(a.same_database(b), b.same_database(a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_service_descriptors_ignore_host_and_database() {
        let a = descriptor("service=prod host=a dbname=one");
        let b = descriptor("service=prod host=b port=6000 dbname=two");
        assert!(a.same_database(&b));
        assert!(!a.same_database(&descriptor("service=prod sslmode=require host=a dbname=one")));
    }

    // =========================================================================
    // Query builder
    // =========================================================================

    #[test]
    fn test_every_action_subset_renders_one_clause() {
        let actions = [Action::Insert, Action::Update, Action::Delete];
        for mask in 1u8..8 {
            let mut set = ActionSet::none();
            for (bit, action) in actions.iter().enumerate() {
                set.set(*action, mask & (1 << bit) != 0);
            }
            let filter = EventFilter { actions: set, ..Default::default() };
            let query = QueryBuilder::build(&TableRef::new("audit", "logged_actions"), &filter);

            assert_eq!(query.sql.matches("action IN (").count(), 1, "{}", query.sql);
            let start = query.sql.find("action IN (").unwrap() + "action IN (".len();
            let end = start + query.sql[start..].find(')').unwrap();
            let listed: Vec<&str> = query.sql[start..end].split(',').collect();
            let expected: Vec<String> = set.iter().map(|a| format!("'{}'", a.code())).collect();
            assert_eq!(listed, expected);
        }
    }

    #[test]
    fn test_free_text_escaping_order() {
        let escaped = escape_like(r"a\b'c%d_e");
        assert_eq!(escaped, r"a\\b''c\%d\_e");

        let filter = EventFilter { search: Some(r"a\b'c%d_e".to_string()), ..Default::default() };
        let predicate = QueryBuilder::predicate(&filter);
        assert!(predicate.contains(r"ILIKE '%a\\b''c\%d\_e%'"), "{predicate}");
    }

    // =========================================================================
    // Payload decoding
    // =========================================================================

    #[test]
    fn test_hstore_decode_is_stable() {
        let text = r#""a"=>"1", "b"=>NULL"#;
        let first = decode_hstore(text).unwrap();
        assert_eq!(first.get("a"), Some(Some("1")));
        assert_eq!(first.get("b"), Some(None));
        assert_eq!(first.len(), 2);

        for _ in 0..10 {
            assert_eq!(decode_hstore(text).unwrap(), first);
        }
    }

    #[test]
    fn test_srid_flag_does_not_change_geometry() {
        let coords = "000000000000F03F000000000000004000000000000008400000000000001040";
        let plain = format!("010200000002000000{coords}");
        let with_srid = format!("0102000020E610000002000000{coords}");

        let a = geometry_from_ewkb_hex(Some(&plain)).unwrap();
        let b = geometry_from_ewkb_hex(Some(&with_srid)).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    // =========================================================================
    // Result model
    // =========================================================================

    #[test]
    fn test_row_zero_then_five_fetches_six() {
        let events =
            (0..20).map(|i| event(100 - i, "public.roads", Action::Insert, None, None)).collect();
        let cursor = FakeCursor::new(events);
        let mut model = EventModel::new(Box::new(cursor.clone()));

        model.get(0).unwrap();
        model.get(5).unwrap();
        assert_eq!(cursor.fetched(), 6);

        for i in 0..6 {
            model.get(i).unwrap();
        }
        assert_eq!(cursor.fetched(), 6);
        assert_eq!(model.count(), 20);
    }

    // =========================================================================
    // Replay
    // =========================================================================

    #[test]
    fn test_replay_outcome_and_bracket() {
        let db = descriptor("host=db dbname=gis");
        let connector = FakeConnector::accepting();
        let credentials =
            CredentialService::with_provider(Box::new(SessionCredentialsProvider::new()));
        let prompt = ScriptedPrompt::new(vec![]);
        let coordinator = FakeCoordinator::inactive();
        let ctx = ConnectContext {
            connector: &connector,
            coordinator: Some(&coordinator),
            prompt: &prompt,
            credentials: &credentials,
        };
        let mut write = ConnectionWrapper::new();
        write.open(&db, &ctx).unwrap();

        let layer = FakeLayer::new("roads", Some(db.clone()));
        let ok = ReplayCoordinator::replay("replay", 1, &mut write, Some(layer.clone()));
        assert!(ok.success && ok.error.is_empty());
        assert_eq!(layer.ends(), 1);

        connector.last_session().fail_execute_with("boom", "PL/pgSQL function replay line 1");
        let failed = ReplayCoordinator::replay("replay", 2, &mut write, Some(layer.clone()));
        assert!(!failed.success && !failed.error.is_empty());
        assert_eq!(layer.ends(), 2);
        assert_eq!(layer.starts(), 2);
    }

    // =========================================================================
    // History state scenario
    // =========================================================================

    fn session(dir: &TempDir, connector: &FakeConnector) -> HistoryState {
        let host = HostServices {
            coordinator: Some(Arc::new(FakeCoordinator::active())),
            prompt: Arc::new(ScriptedPrompt::new(vec![])),
            layers: Arc::new(FakeLayers::new(vec![])),
        };
        HistoryState::with_connector(
            LocalStorage::open(dir.path().to_path_buf()).unwrap(),
            Arc::new(connector.clone()),
            CredentialService::with_provider(Box::new(SessionCredentialsProvider::new())),
            host,
        )
        .unwrap()
    }

    #[test]
    fn test_filtered_search_fetches_lazily() {
        let dir = TempDir::new().unwrap();
        let row = Some(r#""id"=>"7", "name"=>"Main""#);
        let connector = FakeConnector::accepting().with_events(vec![
            event(3, "public.roads", Action::Update, row, Some(r#""name"=>"High""#)),
            event(2, "public.roads", Action::Update, row, Some(r#""name"=>"Low""#)),
            event(1, "public.roads", Action::Update, row, Some(r#""name"=>"Side""#)),
        ]);
        let mut state = session(&dir, &connector);
        state
            .configure(ProjectSettings {
                db_connection: "host=db dbname=gis".to_string(),
                audit_table: "audit.logged_actions".to_string(),
                ..Default::default()
            })
            .unwrap();
        state.open_connections().unwrap();

        let filter = EventFilter {
            table: Some(TableRef::new("public", "roads")),
            actions: ActionSet::none().with(Action::Update),
            after: NaiveDate::from_ymd_opt(2024, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)),
            ..Default::default()
        };
        assert_eq!(state.search(filter).unwrap(), 3);

        // Reads go through a direct connection even with a host group active.
        assert!(!state.read_connection().is_shared());
        assert!(state.write_connection().is_shared());

        let model = state.model_mut().unwrap();
        assert_eq!(model.count(), 3);
        assert_eq!(model.get(2).unwrap().event_id, 1);

        let read = connector.last_session();
        assert_eq!(read.last_cursor().fetched(), 3);
        assert_eq!(read.last_cursor().fetch_sizes(), vec![3]);

        let sql = &read.event_queries()[0].sql;
        assert!(sql.contains("schema_name = 'public'"));
        assert!(sql.contains("table_name = 'roads'"));
        assert!(sql.contains("action IN ('U')"));
        assert!(sql.contains("action_tstamp_clk > '2024-01-01T00:00:00'"));
    }

    // =========================================================================
    // Logging hygiene and error hints
    // =========================================================================

    #[test]
    fn test_passwords_never_rendered_for_logs() {
        let d = descriptor("host=db dbname=gis user=alice password=s3cret");
        assert!(!d.to_string().contains("s3cret"));
        assert!(!format!("{d:?}").contains("s3cret"));
        assert!(!d.normalized().to_string().contains("alice"));

        let creds = Credentials::new("alice", "s3cret");
        assert!(!format!("{creds:?}").contains("s3cret"));

        // Only the connection string handed to the driver carries it.
        assert!(d.to_conninfo().contains("s3cret"));
    }

    #[test]
    fn test_errors_carry_actionable_hints() {
        let errors = [
            HistoryError::connection("could not translate host name"),
            HistoryError::unavailable("could not connect", None),
            HistoryError::authentication("password authentication failed"),
            HistoryError::malformed("unterminated string"),
            HistoryError::config("no audit table"),
            HistoryError::internal("cursor ran dry"),
        ];
        for error in errors {
            let info = error.to_error_info();
            assert!(info.hint.is_some(), "{} has no hint", info.error_type);
        }

        assert!(HistoryError::UserCancelled.hint().is_none());
        assert!(HistoryError::UserCancelled.is_cancelled());
    }
}
