//! Core of the audit-log history viewer.
//!
//! This crate provides everything below the dialogs:
//!
//! - **error**: Error handling with PostgreSQL-specific details
//! - **models**: Connection descriptors, audit events, decoded change sets
//! - **services**: Connection resolution, queries, decoding, replay, storage
//! - **state**: The per-session history state
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod verification_tests;

pub use error::{ErrorInfo, HistoryError};
pub use models::{
    Action, ActionSet, AuditEvent, ConnectionDescriptor, Credentials, EventDetail, EventFilter,
    Geometry, MappedLayer, ProjectSettings, ReplayOutcome, TableRef,
};
pub use services::{
    ConnectionWrapper, CredentialService, EventModel, HostServices, LocalStorage, PgConnector,
    QueryBuilder, ReplayCoordinator, ReplayGate,
};
pub use state::HistoryState;
