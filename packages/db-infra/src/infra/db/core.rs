use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::db::{
    env_lookup, AdminCredentials, BootstrapSettings, ConnectionConfig,
    DEFAULT_BOOTSTRAP_DATABASE,
};
use crate::error::{BootstrapStage, DbInfraError};
use crate::infra::db::diagnostics::BootstrapCounters;
use crate::infra::db::driver::{DbDriver, DbSession};
use crate::infra::db::identifiers::{
    quote_ident, quote_literal, validate_database_name, validate_host, validate_password,
    validate_user_name,
};
use crate::infra::db::schema::{SchemaOrigin, SchemaSource};
use crate::infra::db::session::AdminSession;

pub const DEFAULT_NEW_USER_HOST: &str = "%";

/// Inputs of one bootstrap pass.
#[derive(Clone)]
pub struct BootstrapOptions {
    pub admin: AdminCredentials,
    pub database: String,
    pub new_user: Option<String>,
    pub new_password: Option<String>,
    pub new_user_host: String,
    pub schema: SchemaSource,
    pub stage_timeout: Duration,
}

impl BootstrapOptions {
    pub fn new(admin: AdminCredentials, database: impl Into<String>) -> Self {
        let defaults = BootstrapSettings::default();
        Self {
            admin,
            database: database.into(),
            new_user: None,
            new_password: None,
            new_user_host: DEFAULT_NEW_USER_HOST.to_string(),
            schema: SchemaSource::BuiltIn,
            stage_timeout: defaults.stage_timeout,
        }
    }

    /// Standalone defaults: `DB_NAME` falls back to `users_db` here.
    pub fn from_env() -> Result<Self, DbInfraError> {
        let settings = BootstrapSettings::from_env()?;
        let database = env_lookup("DB_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BOOTSTRAP_DATABASE.to_string());
        Ok(Self::from_settings(&settings, database))
    }

    /// Options used by a provider: bootstrap exactly the schema it connects to.
    pub fn for_provider(config: &ConnectionConfig, settings: &BootstrapSettings) -> Self {
        Self::from_settings(settings, config.database.clone())
    }

    fn from_settings(settings: &BootstrapSettings, database: String) -> Self {
        Self {
            schema: SchemaSource::from_path(settings.schema_file.clone()),
            stage_timeout: settings.stage_timeout,
            ..Self::new(settings.admin.clone(), database)
        }
    }

    pub fn with_new_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.new_user = Some(user.into());
        self.new_password = Some(password.into());
        self
    }

    pub fn with_new_user_host(mut self, host: impl Into<String>) -> Self {
        self.new_user_host = host.into();
        self
    }

    pub fn with_schema(mut self, schema: SchemaSource) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// The user to provision, only when both name and password are present.
    pub fn provisioned_user(&self) -> Option<(&str, &str)> {
        match (self.new_user.as_deref(), self.new_password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for BootstrapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapOptions")
            .field("admin", &self.admin)
            .field("database", &self.database)
            .field("new_user", &self.new_user)
            .field("new_password", &self.new_password.as_ref().map(|_| "***"))
            .field("new_user_host", &self.new_user_host)
            .field("schema", &self.schema)
            .field("stage_timeout", &self.stage_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub database: String,
    /// `user@host` of the provisioned account, if one was requested.
    pub user_created: Option<String>,
    pub schema_origin: SchemaOrigin,
    pub statements_applied: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapFailure {
    pub stage: BootstrapStage,
    pub message: String,
}

impl BootstrapFailure {
    fn new(stage: BootstrapStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for BootstrapFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.message)
    }
}

impl From<BootstrapFailure> for DbInfraError {
    fn from(f: BootstrapFailure) -> Self {
        DbInfraError::Stage {
            stage: f.stage,
            message: f.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapResult {
    Completed(BootstrapReport),
    Failed(BootstrapFailure),
}

impl BootstrapResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, BootstrapResult::Completed(_))
    }

    pub fn report(&self) -> Option<&BootstrapReport> {
        match self {
            BootstrapResult::Completed(r) => Some(r),
            BootstrapResult::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&BootstrapFailure> {
        match self {
            BootstrapResult::Completed(_) => None,
            BootstrapResult::Failed(f) => Some(f),
        }
    }

    pub fn into_result(self) -> Result<BootstrapReport, DbInfraError> {
        match self {
            BootstrapResult::Completed(r) => Ok(r),
            BootstrapResult::Failed(f) => Err(f.into()),
        }
    }
}

/// What stages 2 and 3 produced.
struct StagesDone {
    user_created: Option<String>,
    schema_origin: SchemaOrigin,
    statements_applied: usize,
}

/// Statements provisioning a privileged account. Inputs must be validated.
pub(crate) fn user_statements(user: &str, host: &str, password: &str) -> Vec<String> {
    let account = format!("{}@{}", quote_literal(user), quote_literal(host));
    vec![
        format!(
            "CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {}",
            quote_literal(password)
        ),
        format!("GRANT ALL PRIVILEGES ON *.* TO {account} WITH GRANT OPTION"),
        "FLUSH PRIVILEGES".to_string(),
    ]
}

/// Statements creating and selecting the database. Input must be validated.
pub(crate) fn database_statements(database: &str) -> [String; 2] {
    let ident = quote_ident(database);
    [
        format!("CREATE DATABASE IF NOT EXISTS {ident}"),
        format!("USE {ident}"),
    ]
}

/// Short statement label for diagnostics.
fn preview(sql: &str) -> String {
    let first_line = sql.lines().next().unwrap_or_default().trim();
    let mut out: String = first_line.chars().take(60).collect();
    if out.len() < first_line.len() || sql.lines().nth(1).is_some() {
        out.push_str("...");
    }
    out
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Why a bounded round trip did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Cancelled(Duration),
    TimedOut(Duration),
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupted::Cancelled(after) => write!(f, "cancelled after {}ms", after.as_millis()),
            Interrupted::TimedOut(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
        }
    }
}

/// Await `fut` under `limit`, giving up as soon as `cancel` fires.
pub(crate) async fn bounded<F: Future>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interrupted> {
    let start = Instant::now();
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(Interrupted::Cancelled(start.elapsed())),
        res = tokio::time::timeout(limit, fut) => res.map_err(|_| Interrupted::TimedOut(limit)),
    }
}

/// Run one stage with a bound and the caller's cancellation.
async fn run_stage<T, Fut>(
    stage: BootstrapStage,
    limit: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T, BootstrapFailure>
where
    Fut: Future<Output = Result<T, BootstrapFailure>>,
{
    let start = Instant::now();
    let result = match bounded(limit, cancel, fut).await {
        Ok(inner) => inner,
        Err(interrupted) => Err(BootstrapFailure::new(stage, interrupted.to_string())),
    };
    debug!(
        stage = %stage,
        ok = result.is_ok(),
        elapsed_ms = start.elapsed().as_millis()
    );
    result
}

/// Creates the database, its schema and optionally a privileged user, using a
/// short-lived elevated session.
pub struct Bootstrapper<D: DbDriver> {
    driver: Arc<D>,
    host: String,
    port: u16,
    counters: Arc<BootstrapCounters>,
}

impl<D: DbDriver> Bootstrapper<D> {
    pub fn new(driver: Arc<D>, host: impl Into<String>, port: u16) -> Self {
        Self {
            driver,
            host: host.into(),
            port,
            counters: Arc::new(BootstrapCounters::new()),
        }
    }

    /// Target the same server as `config`.
    pub fn for_config(driver: Arc<D>, config: &ConnectionConfig) -> Self {
        Self::new(driver, config.host.clone(), config.port)
    }

    pub fn with_counters(mut self, counters: Arc<BootstrapCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> &BootstrapCounters {
        &self.counters
    }

    pub async fn initialize(&self, opts: &BootstrapOptions) -> BootstrapResult {
        self.initialize_with_cancel(opts, &CancellationToken::new())
            .await
    }

    /// Run the bootstrap stages. Never returns an error: every failure is
    /// logged and reported in the result with the stage it happened in.
    pub async fn initialize_with_cancel(
        &self,
        opts: &BootstrapOptions,
        cancel: &CancellationToken,
    ) -> BootstrapResult {
        let start = Instant::now();
        self.counters.bootstrap_started();
        info!(
            bootstrap = "start",
            host = %self.host,
            port = self.port,
            database = %opts.database,
            admin_user = %opts.admin.user,
            provision_user = opts.provisioned_user().is_some(),
            stage_timeout_ms = opts.stage_timeout.as_millis()
        );

        if let Err(failure) = Self::validate(opts) {
            return self.fail(failure);
        }

        let spec = opts.admin.conn_spec(&self.host, self.port);
        let connect = async {
            self.driver.connect(&spec).await.map_err(|e| {
                BootstrapFailure::new(
                    BootstrapStage::AdminConnect,
                    format!("failed to connect as admin ({}): {e}", spec.redacted_url()),
                )
            })
        };
        let session =
            match run_stage(BootstrapStage::AdminConnect, opts.stage_timeout, cancel, connect)
                .await
            {
                Ok(session) => session,
                Err(failure) => return self.fail(failure),
            };
        let mut session = AdminSession::new(session, &opts.admin.user, self.counters.clone());

        let mut current = BootstrapStage::UserCreate;
        let outcome = AssertUnwindSafe(self.run_stages(&mut session, opts, cancel, &mut current))
            .catch_unwind()
            .await;

        // Single teardown path for every outcome.
        session.release().await;

        match outcome {
            Ok(Ok(done)) => {
                self.counters.bootstrap_succeeded();
                let report = BootstrapReport {
                    database: opts.database.clone(),
                    user_created: done.user_created,
                    schema_origin: done.schema_origin,
                    statements_applied: done.statements_applied,
                    elapsed: start.elapsed(),
                };
                info!(
                    bootstrap = "done",
                    database = %report.database,
                    user_created = report.user_created.as_deref().unwrap_or("none"),
                    schema = %report.schema_origin,
                    statements = report.statements_applied,
                    elapsed_ms = report.elapsed.as_millis()
                );
                BootstrapResult::Completed(report)
            }
            Ok(Err(failure)) => self.fail(failure),
            Err(payload) => self.fail(BootstrapFailure::new(
                current,
                format!("panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }

    fn validate(opts: &BootstrapOptions) -> Result<(), BootstrapFailure> {
        validate_database_name(&opts.database)
            .map_err(|e| BootstrapFailure::new(BootstrapStage::SchemaCreate, e.to_string()))?;

        if let Some((user, password)) = opts.provisioned_user() {
            let as_failure = |e: DbInfraError| {
                BootstrapFailure::new(BootstrapStage::UserCreate, e.to_string())
            };
            validate_user_name(user).map_err(as_failure)?;
            validate_host(&opts.new_user_host).map_err(as_failure)?;
            validate_password(password).map_err(as_failure)?;
        }
        Ok(())
    }

    fn fail(&self, failure: BootstrapFailure) -> BootstrapResult {
        self.counters.stage_failed(failure.stage);
        error!(
            bootstrap = "failed",
            stage = %failure.stage,
            error = %failure.message
        );
        BootstrapResult::Failed(failure)
    }

    async fn run_stages(
        &self,
        session: &mut AdminSession<D::Session>,
        opts: &BootstrapOptions,
        cancel: &CancellationToken,
        current: &mut BootstrapStage,
    ) -> Result<StagesDone, BootstrapFailure> {
        *current = BootstrapStage::UserCreate;
        let user_created = match opts.provisioned_user() {
            Some((user, password)) => {
                let host = opts.new_user_host.as_str();
                run_stage(
                    BootstrapStage::UserCreate,
                    opts.stage_timeout,
                    cancel,
                    create_user(session, user, host, password),
                )
                .await?;
                Some(format!("{user}@{host}"))
            }
            None => {
                debug!(stage = "user_create", skipped = true);
                None
            }
        };

        *current = BootstrapStage::SchemaCreate;
        let (schema_origin, statements_applied) = run_stage(
            BootstrapStage::SchemaCreate,
            opts.stage_timeout,
            cancel,
            create_database_schema(session, &opts.database, &opts.schema),
        )
        .await?;

        Ok(StagesDone {
            user_created,
            schema_origin,
            statements_applied,
        })
    }
}

async fn create_user<S: DbSession>(
    session: &mut AdminSession<S>,
    user: &str,
    host: &str,
    password: &str,
) -> Result<(), BootstrapFailure> {
    const STEPS: [&str; 3] = ["create user", "grant privileges", "flush privileges"];

    for (step, stmt) in STEPS.iter().zip(user_statements(user, host, password)) {
        // The statement text carries the password; report the step only.
        session.execute(&stmt).await.map_err(|e| {
            BootstrapFailure::new(
                BootstrapStage::UserCreate,
                format!("failed to {step} for '{user}'@'{host}': {e}"),
            )
        })?;
    }
    session.execute("COMMIT").await.map_err(|e| {
        BootstrapFailure::new(BootstrapStage::UserCreate, format!("commit failed: {e}"))
    })?;

    info!(stage = "user_create", user, host, "privileged user provisioned");
    Ok(())
}

async fn create_database_schema<S: DbSession>(
    session: &mut AdminSession<S>,
    database: &str,
    source: &SchemaSource,
) -> Result<(SchemaOrigin, usize), BootstrapFailure> {
    let stage_err =
        |msg: String| BootstrapFailure::new(BootstrapStage::SchemaCreate, msg);

    for stmt in database_statements(database) {
        session
            .execute(&stmt)
            .await
            .map_err(|e| stage_err(format!("`{stmt}` failed: {e}")))?;
    }

    let schema = source.resolve().await.map_err(|e| {
        let path = source_path(source);
        stage_err(format!("failed to read schema script {path}: {e}"))
    })?;

    // No rollback across statements: earlier DDL stays applied on failure.
    for (idx, stmt) in schema.statements.iter().enumerate() {
        session.execute(stmt).await.map_err(|e| {
            stage_err(format!(
                "schema statement {} of {} (`{}`) failed: {e}",
                idx + 1,
                schema.statements.len(),
                preview(stmt)
            ))
        })?;
    }
    session
        .execute("COMMIT")
        .await
        .map_err(|e| stage_err(format!("commit failed: {e}")))?;

    Ok((schema.origin, schema.statements.len()))
}

fn source_path(source: &SchemaSource) -> String {
    match source {
        SchemaSource::BuiltIn => "<built-in>".to_string(),
        SchemaSource::Script(p) => p.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> AdminCredentials {
        AdminCredentials::new("root", "")
    }

    #[test]
    fn test_provisioned_user_requires_both_parts() {
        let base = BootstrapOptions::new(admin(), "users_db");
        assert!(base.provisioned_user().is_none());

        let mut only_user = base.clone();
        only_user.new_user = Some("svc".into());
        assert!(only_user.provisioned_user().is_none());

        let mut only_password = base.clone();
        only_password.new_password = Some("x".into());
        assert!(only_password.provisioned_user().is_none());

        let empty_password = base.clone().with_new_user("svc", "");
        assert!(empty_password.provisioned_user().is_none());

        let both = base.with_new_user("svc", "x");
        assert_eq!(both.provisioned_user(), Some(("svc", "x")));
    }

    #[test]
    fn test_user_statements() {
        let stmts = user_statements("svc", "%", "x");
        assert_eq!(
            stmts,
            vec![
                "CREATE USER IF NOT EXISTS 'svc'@'%' IDENTIFIED BY 'x'",
                "GRANT ALL PRIVILEGES ON *.* TO 'svc'@'%' WITH GRANT OPTION",
                "FLUSH PRIVILEGES",
            ]
        );
    }

    #[test]
    fn test_user_statements_escape_password_quotes() {
        let stmts = user_statements("svc", "%", "o'brien");
        assert!(stmts[0].ends_with("IDENTIFIED BY 'o''brien'"));
    }

    #[test]
    fn test_database_statements() {
        assert_eq!(
            database_statements("users_db"),
            [
                "CREATE DATABASE IF NOT EXISTS `users_db`".to_string(),
                "USE `users_db`".to_string()
            ]
        );
    }

    #[test]
    fn test_options_debug_hides_new_password() {
        let opts = BootstrapOptions::new(AdminCredentials::new("root", "toor"), "users_db")
            .with_new_user("svc", "hunter2");
        let rendered = format!("{opts:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("toor"));
        assert!(rendered.contains("svc"));
    }

    #[test]
    fn test_for_provider_uses_provider_database() {
        let config = ConnectionConfig::from_lookup(|name: &str| match name {
            "DB_NAME" => Some("accounts".to_string()),
            _ => None,
        })
        .unwrap();
        let settings = BootstrapSettings {
            schema_file: Some("schema.sql".into()),
            ..BootstrapSettings::default()
        };

        let opts = BootstrapOptions::for_provider(&config, &settings);
        assert_eq!(opts.database, "accounts");
        assert_eq!(opts.admin.user, "root");
        assert_eq!(opts.schema, SchemaSource::Script("schema.sql".into()));
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("CREATE TABLE a (id INT)"), "CREATE TABLE a (id INT)");
        assert_eq!(preview("CREATE TABLE a (\n id INT\n)"), "CREATE TABLE a (...");
        assert_eq!(preview(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_failure_converts_to_stage_error() {
        let err: DbInfraError =
            BootstrapFailure::new(BootstrapStage::UserCreate, "denied").into();
        assert!(matches!(
            err,
            DbInfraError::Stage {
                stage: BootstrapStage::UserCreate,
                ..
            }
        ));
        assert_eq!(err.to_string(), "Bootstrap stage user_create failed: denied");
    }

    #[tokio::test]
    async fn test_bounded_reports_timeout_and_cancellation() {
        let cancel = CancellationToken::new();
        let limit = Duration::from_millis(20);

        assert_eq!(bounded(limit, &cancel, async { 7 }).await, Ok(7));
        assert_eq!(
            bounded(limit, &cancel, futures::future::pending::<()>()).await,
            Err(Interrupted::TimedOut(limit))
        );

        cancel.cancel();
        let err = bounded(limit, &cancel, async { 7 }).await.unwrap_err();
        assert!(matches!(err, Interrupted::Cancelled(_)));
        assert!(err.to_string().starts_with("cancelled after"));
    }
}
