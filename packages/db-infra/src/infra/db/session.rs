use std::sync::Arc;

use sea_orm::DbErr;
use tracing::{debug, warn};

use crate::infra::db::diagnostics::BootstrapCounters;
use crate::infra::db::driver::DbSession;

/// Guard for the elevated session of one bootstrap call.
///
/// Holds (session, admin user for logging, released flag). The session is
/// only reachable through this guard and is closed by [`AdminSession::release`];
/// if the guard is dropped without release the session is dropped with it.
pub struct AdminSession<S: DbSession> {
    session: Option<S>,
    admin_user: String,
    counters: Arc<BootstrapCounters>,
}

impl<S: DbSession> AdminSession<S> {
    pub fn new(session: S, admin_user: &str, counters: Arc<BootstrapCounters>) -> Self {
        counters.admin_session_opened();
        debug!(admin_user, "admin session opened");
        Self {
            session: Some(session),
            admin_user: admin_user.to_string(),
            counters,
        }
    }

    pub async fn execute(&mut self, sql: &str) -> Result<(), DbErr> {
        match self.session.as_mut() {
            Some(session) => session.execute(sql).await,
            None => Err(DbErr::Custom("admin session already released".to_string())),
        }
    }

    /// Close the session. Close errors are logged, never returned: once this
    /// runs the slot is empty whatever the server said.
    pub async fn release(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        match session.close().await {
            Ok(()) => debug!(admin_user = %self.admin_user, "admin session released"),
            Err(e) => warn!(
                admin_user = %self.admin_user,
                error = %e,
                "admin session close returned error"
            ),
        }
        self.counters.admin_session_released();
    }
}

impl<S: DbSession> Drop for AdminSession<S> {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            warn!(
                admin_user = %self.admin_user,
                "admin session dropped without release; closing by drop"
            );
            self.counters.admin_session_released();
        }
    }
}
