use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::config::db::{BootstrapSettings, ConnectionConfig};
use crate::error::DbInfraError;
use crate::infra::db::core::{
    bounded, BootstrapOptions, BootstrapResult, Bootstrapper, Interrupted,
};
use crate::infra::db::diagnostics::BootstrapCounters;
use crate::infra::db::driver::{ConnSpec, DbDriver, DbSession, MySqlDriver};

const FATAL_AFTER_INIT: &str = "unable to establish connection after initialization";

/// Hands out application connections, bootstrapping the schema on first use.
///
/// There is no lock around bootstrap: concurrent callers that both see an
/// uninitialized schema will both run it. Every bootstrap statement is
/// idempotent, so the cost is duplicated work only.
pub struct ConnectionProvider<D: DbDriver> {
    driver: Arc<D>,
    config: ConnectionConfig,
    settings: BootstrapSettings,
    bootstrapper: Bootstrapper<D>,
    counters: Arc<BootstrapCounters>,
    initialized: AtomicBool,
}

impl ConnectionProvider<MySqlDriver> {
    /// Provider for MySQL configured entirely from the environment.
    pub fn from_env() -> Result<Self, DbInfraError> {
        let config = ConnectionConfig::from_env()?;
        let settings = BootstrapSettings::from_env()?;
        let driver = MySqlDriver::new(settings.connect_timeout);
        Ok(Self::new(driver, config, settings))
    }
}

impl<D: DbDriver> ConnectionProvider<D> {
    pub fn new(driver: D, config: ConnectionConfig, settings: BootstrapSettings) -> Self {
        let driver = Arc::new(driver);
        let counters = Arc::new(BootstrapCounters::new());
        let bootstrapper =
            Bootstrapper::for_config(driver.clone(), &config).with_counters(counters.clone());
        Self {
            driver,
            config,
            settings,
            bootstrapper,
            counters,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn counters(&self) -> &BootstrapCounters {
        &self.counters
    }

    /// Whether a previous call already saw (or produced) an initialized schema.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Forget the cached "initialized" fact; the next call probes again.
    pub fn invalidate(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    pub async fn get_connection(&self) -> Result<D::Session, DbInfraError> {
        self.get_connection_with_cancel(&CancellationToken::new())
            .await
    }

    /// Return a ready connection, bootstrapping first if the schema is missing.
    ///
    /// Every round trip (open, probe, bootstrap stage, reopen) is bounded by
    /// the stage timeout and stops when `cancel` fires. A timed-out open or
    /// probe counts as uninitialized. A failed bootstrap, or a failed reopen
    /// after a successful one, is fatal: there is no retry.
    pub async fn get_connection_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<D::Session, DbInfraError> {
        let spec = self.config.app_spec();

        if let Some(conn) = self.open_ready(&spec, cancel).await? {
            return Ok(conn);
        }

        let opts = BootstrapOptions::for_provider(&self.config, &self.settings);
        if let BootstrapResult::Failed(failure) =
            self.bootstrapper.initialize_with_cancel(&opts, cancel).await
        {
            self.counters.fatal_error();
            error!(
                provider = "fatal",
                stage = %failure.stage,
                "{}", FATAL_AFTER_INIT
            );
            self.counters.log_snapshot("get_connection");
            return Err(DbInfraError::fatal(FATAL_AFTER_INIT));
        }

        let limit = self.settings.stage_timeout;
        let reopened = bounded(limit, cancel, self.driver.connect(&spec)).await;
        let reason = match reopened {
            Ok(Ok(conn)) => {
                self.initialized.store(true, Ordering::Release);
                info!(
                    provider = "ready",
                    bootstrapped = true,
                    url = %spec.redacted_url()
                );
                self.counters.log_snapshot("get_connection");
                return Ok(conn);
            }
            Ok(Err(e)) => e.to_string(),
            Err(interrupted) => interrupted.to_string(),
        };
        self.counters.fatal_error();
        error!(provider = "fatal", error = %reason, "{}", FATAL_AFTER_INIT);
        Err(DbInfraError::fatal(format!("{FATAL_AFTER_INIT}: {reason}")))
    }

    /// Run `f` with a fresh connection and close it afterwards, whether `f`
    /// succeeds or fails.
    pub async fn with_connection<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: for<'c> FnOnce(&'c mut D::Session) -> BoxFuture<'c, Result<R, E>>,
        E: From<DbInfraError>,
    {
        let mut conn = self.get_connection().await?;
        let out = f(&mut conn).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "failed to close scoped connection");
        }
        out
    }

    /// Open with application credentials and probe; `None` means
    /// uninitialized. Only cancellation is an error.
    async fn open_ready(
        &self,
        spec: &ConnSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<D::Session>, DbInfraError> {
        let limit = self.settings.stage_timeout;

        let opened = match bounded(limit, cancel, self.driver.connect(spec)).await {
            Ok(opened) => opened.map_err(|e| e.to_string()),
            Err(interrupted @ Interrupted::Cancelled(_)) => return Err(cancelled(interrupted)),
            Err(interrupted) => Err(interrupted.to_string()),
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(reason) => {
                self.invalidate();
                self.counters.transient_connect_failure();
                warn!(
                    probe = "miss",
                    reason = "connect_failed",
                    url = %spec.redacted_url(),
                    error = %reason
                );
                return Ok(None);
            }
        };

        if self.is_initialized() {
            trace!(probe = "skipped", reason = "cached");
            return Ok(Some(conn));
        }

        let probe_table = self.config.probe_table.as_str();
        let probed = bounded(limit, cancel, conn.table_exists(probe_table)).await;
        match probed {
            Ok(Ok(true)) => {
                self.counters.probe_hit();
                self.initialized.store(true, Ordering::Release);
                trace!(probe = "hit", table = probe_table);
                return Ok(Some(conn));
            }
            Ok(Ok(false)) => {
                self.counters.probe_miss();
                info!(probe = "miss", reason = "probe_table_missing", table = probe_table);
            }
            Ok(Err(e)) => {
                self.counters.probe_miss();
                warn!(probe = "miss", reason = "probe_failed", table = probe_table, error = %e);
            }
            Err(interrupted @ Interrupted::Cancelled(_)) => return Err(cancelled(interrupted)),
            Err(interrupted) => {
                self.counters.probe_miss();
                warn!(
                    probe = "miss",
                    reason = "probe_timed_out",
                    table = probe_table,
                    error = %interrupted
                );
            }
        }

        match bounded(limit, cancel, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to close probe connection"),
            Err(interrupted) => warn!(error = %interrupted, "probe connection dropped unclosed"),
        }
        Ok(None)
    }
}

fn cancelled(interrupted: Interrupted) -> DbInfraError {
    warn!(provider = "cancelled", error = %interrupted);
    DbInfraError::fatal(format!("connection request {interrupted}"))
}
