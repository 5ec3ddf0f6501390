//! Database bootstrap and connection lifecycle.
//! Used by the bootstrap CLI and by anything that needs a ready connection.

pub mod config;
pub mod error;
pub mod infra;

pub use config::db;
pub use error::{BootstrapStage, DbInfraError};
pub use infra::db::core::{
    BootstrapFailure, BootstrapOptions, BootstrapReport, BootstrapResult, Bootstrapper,
};
pub use infra::db::diagnostics::{BootstrapCounters, CountersSnapshot};
pub use infra::db::driver::{sanitize_db_url, ConnSpec, DbDriver, DbSession, MySqlDriver};
pub use infra::db::provider::ConnectionProvider;
pub use infra::db::schema::{split_statements, ResolvedSchema, SchemaOrigin, SchemaSource};
