//! Backend services for the history viewer.
//!
//! - `host` - contracts the host application implements
//! - `connection` - direct PostgreSQL connections and event cursors
//! - `credentials` - credential storage and the authentication retry loop
//! - `wrapper` - connection resolution (shared transaction or direct)
//! - `query` - event query building
//! - `event_model` - lazily fetched event list
//! - `decoder` / `ewkb` - hstore and geometry payload decoding
//! - `replay` - replay procedure calls and replay availability
//! - `schema` - catalog lookups
//! - `storage` - local SQLite project settings

pub mod connection;
pub mod credentials;
pub mod decoder;
pub mod event_model;
pub mod ewkb;
pub mod host;
pub mod query;
pub mod replay;
pub mod schema;
pub mod storage;
pub mod wrapper;

pub use connection::{Connector, DirectConnection, EventCursor, PgConnector};
pub use credentials::CredentialService;
pub use decoder::{decode_hstore, describe_event, HstoreMap};
pub use event_model::EventModel;
pub use host::{
    CredentialPrompt, EditableLayer, HostServices, LayerRegistry, ProjectStore, SharedConnection,
    TransactionCoordinator,
};
pub use query::{QueryBuilder, QueryService};
pub use replay::{ReplayCoordinator, ReplayGate};
pub use schema::{GeometryColumnCache, SchemaService};
pub use storage::LocalStorage;
pub use wrapper::{ConnectContext, ConnectionWrapper};
