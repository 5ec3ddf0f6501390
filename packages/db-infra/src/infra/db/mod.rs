pub mod core;
pub mod diagnostics;
pub mod driver;
pub mod identifiers;
pub mod provider;
pub mod schema;
pub mod session;

pub use self::core::{BootstrapFailure, BootstrapOptions, BootstrapReport, BootstrapResult, Bootstrapper};
pub use diagnostics::{BootstrapCounters, CountersSnapshot};
pub use driver::{sanitize_db_url, ConnSpec, DbDriver, DbSession, MySqlDriver};
pub use provider::ConnectionProvider;
pub use session::AdminSession;
