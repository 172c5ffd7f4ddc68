//! Data models for the history viewer.
//!
//! - `connection` - ConnectionDescriptor, Credentials, SslMode
//! - `event` - AuditEvent, Action, EventFilter, TableRef, ReplayOutcome
//! - `geometry` - decoded geometries and extents
//! - `detail` - decoded change set of one event
//! - `settings` - per-project viewer settings

pub mod connection;
pub mod detail;
pub mod event;
pub mod geometry;
pub mod settings;

pub use connection::{ConnectionDescriptor, Credentials, SslMode};
pub use detail::{
    DetailRows, EventDetail, FieldChange, FieldEntry, GeometryDisplay, MalformedField,
};
pub use event::{Action, ActionSet, AuditEvent, EventFilter, ReplayOutcome, TableRef};
pub use geometry::{Coord, Geometry, Rect};
pub use settings::{MappedLayer, ProjectSettings};
