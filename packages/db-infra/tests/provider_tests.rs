//! ConnectionProvider tests
//!
//!   cargo test -p db-infra --test provider_tests

mod support;

use std::io::Write;
use std::time::Duration;

use db_infra::config::db::{AdminCredentials, BootstrapSettings};
use db_infra::{ConnectionProvider, DbInfraError, DbSession};
use serial_test::serial;
use test_support::ScriptedDriver;
use tokio_util::sync::CancellationToken;

use crate::support::{app_config, fresh_server, fresh_server_with_app_login, settings};

fn provider(driver: &ScriptedDriver) -> ConnectionProvider<ScriptedDriver> {
    ConnectionProvider::new(driver.clone(), app_config(), settings())
}

fn provider_with_stage_timeout(
    driver: &ScriptedDriver,
    stage_timeout: Duration,
) -> ConnectionProvider<ScriptedDriver> {
    let settings = BootstrapSettings {
        stage_timeout,
        ..settings()
    };
    ConnectionProvider::new(driver.clone(), app_config(), settings)
}

const OUTER_LIMIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_ready_schema_never_bootstraps() {
    let driver = fresh_server_with_app_login().with_table("mydb", "users");
    let provider = provider(&driver);

    let conn = provider.get_connection().await.expect("connection");
    assert_eq!(conn.current_database(), Some("mydb"));
    assert_eq!(conn.user(), "username");

    assert_eq!(driver.connect_attempts("root"), 0);
    let snap = provider.counters().snapshot();
    assert_eq!(snap.probe_hits, 1);
    assert_eq!(snap.bootstraps_started, 0);
    assert!(provider.is_initialized());
}

#[tokio::test]
async fn test_fresh_server_is_bootstrapped() {
    let driver = fresh_server_with_app_login();
    let provider = provider(&driver);

    let conn = provider.get_connection().await.expect("connection");
    assert_eq!(conn.current_database(), Some("mydb"));
    assert!(driver.has_table("mydb", "users"));

    let snap = provider.counters().snapshot();
    assert_eq!(snap.transient_connect_failures, 1);
    assert_eq!(snap.bootstraps_succeeded, 1);
    assert_eq!(snap.admin_sessions_live(), 0);
    assert_eq!(driver.sessions_closed("root"), 1);
}

#[tokio::test]
async fn test_missing_probe_table_triggers_bootstrap() {
    let driver = fresh_server_with_app_login().with_database("mydb");
    let provider = provider(&driver);

    let _conn = provider.get_connection().await.expect("connection");
    assert!(driver.has_table("mydb", "users"));

    let snap = provider.counters().snapshot();
    assert_eq!(snap.probe_misses, 1);
    assert_eq!(snap.bootstraps_started, 1);
    // The probe connection was closed before bootstrapping.
    assert_eq!(driver.sessions_closed("username"), 1);
    assert_eq!(driver.sessions_dropped("username"), 0);
}

#[tokio::test]
async fn test_probe_error_counts_as_uninitialized() {
    let driver = fresh_server_with_app_login()
        .with_table("mydb", "users")
        .fail_probe();
    let provider = provider(&driver);

    provider.get_connection().await.expect("connection");
    assert_eq!(provider.counters().snapshot().bootstraps_started, 1);
    assert_eq!(driver.sessions_opened("root"), 1);
}

#[tokio::test]
async fn test_failed_bootstrap_is_fatal() {
    let driver = ScriptedDriver::new()
        .with_login("root", "something-else")
        .with_login("username", "password");
    let provider = provider(&driver);

    let err = provider.get_connection().await.err().expect("fatal error");
    assert!(matches!(err, DbInfraError::FatalProvision { .. }));
    assert!(err
        .to_string()
        .contains("unable to establish connection after initialization"));

    assert!(!driver.has_database("mydb"));
    // No retry: one app attempt, one admin attempt.
    assert_eq!(driver.connect_attempts("username"), 1);
    assert_eq!(driver.connect_attempts("root"), 1);

    let snap = provider.counters().snapshot();
    assert_eq!(snap.admin_connect_failures, 1);
    assert_eq!(snap.fatal_errors, 1);
    assert!(!provider.is_initialized());
}

#[tokio::test]
async fn test_reconnect_failure_after_bootstrap_is_fatal() {
    // The application account does not exist, so even a bootstrapped
    // schema cannot be reached with it.
    let driver = fresh_server();
    let provider = provider(&driver);

    let err = provider.get_connection().await.err().expect("fatal error");
    assert!(matches!(err, DbInfraError::FatalProvision { .. }));
    assert!(driver.has_table("mydb", "users"));
    assert_eq!(driver.connect_attempts("username"), 2);

    let snap = provider.counters().snapshot();
    assert_eq!(snap.bootstraps_succeeded, 1);
    assert_eq!(snap.fatal_errors, 1);
}

#[tokio::test]
async fn test_initialized_fact_is_cached() {
    let driver = fresh_server_with_app_login().with_table("mydb", "users");
    let provider = provider(&driver);

    provider.get_connection().await.expect("first");
    provider.get_connection().await.expect("second");
    provider.get_connection().await.expect("third");
    assert_eq!(provider.counters().snapshot().probe_hits, 1);

    provider.invalidate();
    provider.get_connection().await.expect("after invalidate");
    assert_eq!(provider.counters().snapshot().probe_hits, 2);
}

#[tokio::test]
async fn test_with_connection_always_closes() {
    let driver = fresh_server_with_app_login().with_table("mydb", "users");
    let provider = provider(&driver);

    let ok: Result<usize, DbInfraError> = provider
        .with_connection(|conn| {
            Box::pin(async move {
                conn.execute("SELECT 1")
                    .await
                    .map_err(|e| DbInfraError::config(e.to_string()))?;
                Ok(1)
            })
        })
        .await;
    assert_eq!(ok.expect("scoped work"), 1);
    assert_eq!(driver.sessions_closed("username"), 1);

    let failed: Result<(), DbInfraError> = provider
        .with_connection(|_conn| Box::pin(async move { Err(DbInfraError::config("boom")) }))
        .await;
    assert!(failed.is_err());
    assert_eq!(driver.sessions_closed("username"), 2);
    assert_eq!(driver.sessions_dropped("username"), 0);
}

#[tokio::test]
async fn test_concurrent_callers_tolerate_redundant_bootstrap() {
    let driver = fresh_server_with_app_login();
    let provider = provider(&driver);

    let (a, b) = tokio::join!(provider.get_connection(), provider.get_connection());
    assert!(a.is_ok());
    assert!(b.is_ok());

    let snap = provider.counters().snapshot();
    assert!(snap.bootstraps_succeeded >= 1);
    assert_eq!(snap.bootstrap_failures(), 0);
    assert!(driver.has_table("mydb", "users"));
}

#[tokio::test]
async fn test_configured_schema_file_is_used() {
    let mut file = tempfile::NamedTempFile::new().expect("temp script");
    write!(
        file,
        "CREATE TABLE IF NOT EXISTS users (id INT AUTO_INCREMENT PRIMARY KEY);\n\
         CREATE TABLE IF NOT EXISTS audit_log (id INT);\n"
    )
    .expect("write script");

    let driver = fresh_server_with_app_login();
    let settings = BootstrapSettings {
        schema_file: Some(file.path().to_path_buf()),
        ..settings()
    };
    let provider = ConnectionProvider::new(driver.clone(), app_config(), settings);

    provider.get_connection().await.expect("connection");
    assert!(driver.has_table("mydb", "users"));
    assert!(driver.has_table("mydb", "audit_log"));
}

#[tokio::test]
async fn test_stalled_app_connect_is_bounded() {
    let driver = fresh_server_with_app_login()
        .with_table("mydb", "users")
        .stall_connect_for("username");
    let provider = provider_with_stage_timeout(&driver, Duration::from_millis(50));

    let outcome = tokio::time::timeout(OUTER_LIMIT, provider.get_connection())
        .await
        .expect("get_connection must honour the stage timeout");
    let err = outcome.err().expect("fatal error");
    assert!(matches!(err, DbInfraError::FatalProvision { .. }));
    assert!(err.to_string().contains("timed out"));

    // First open timed out, bootstrap ran, the reopen timed out as well.
    assert_eq!(driver.connect_attempts("username"), 2);
    let snap = provider.counters().snapshot();
    assert_eq!(snap.transient_connect_failures, 1);
    assert_eq!(snap.bootstraps_succeeded, 1);
    assert_eq!(snap.fatal_errors, 1);
}

#[tokio::test]
async fn test_cancelled_request_returns_without_bootstrapping() {
    let driver = fresh_server_with_app_login().stall_connect_for("username");
    let provider = provider(&driver);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = tokio::time::timeout(OUTER_LIMIT, provider.get_connection_with_cancel(&cancel))
        .await
        .expect("get_connection must honour cancellation");
    let err = outcome.err().expect("cancelled");
    assert!(matches!(err, DbInfraError::FatalProvision { .. }));
    assert!(err.to_string().contains("cancelled"));

    assert_eq!(driver.connect_attempts("root"), 0);
    assert_eq!(provider.counters().snapshot().bootstraps_started, 0);
}

#[tokio::test]
async fn test_stalled_probe_counts_as_uninitialized() {
    let driver = fresh_server_with_app_login()
        .with_table("mydb", "users")
        .stall_probe();
    let provider = provider_with_stage_timeout(&driver, Duration::from_millis(50));

    let conn = tokio::time::timeout(OUTER_LIMIT, provider.get_connection())
        .await
        .expect("get_connection must honour the stage timeout")
        .expect("connection");
    assert_eq!(conn.current_database(), Some("mydb"));

    let snap = provider.counters().snapshot();
    assert_eq!(snap.probe_misses, 1);
    assert_eq!(snap.bootstraps_succeeded, 1);
    // The probe connection was closed, not leaked.
    assert_eq!(driver.sessions_closed("username"), 1);
    assert!(provider.is_initialized());
}

#[tokio::test]
#[serial]
async fn test_bootstrap_options_from_env() {
    std::env::remove_var("DB_NAME");
    std::env::remove_var("DB_SCHEMA_FILE");
    std::env::set_var("DB_ROOT_USER", "admin");
    std::env::set_var("DB_ROOT_PASSWORD", "pw");

    let opts = db_infra::BootstrapOptions::from_env().expect("options");
    assert_eq!(opts.database, "users_db");
    assert_eq!(opts.admin, AdminCredentials::new("admin", "pw"));
    assert!(opts.provisioned_user().is_none());

    std::env::set_var("DB_NAME", "accounts");
    let opts = db_infra::BootstrapOptions::from_env().expect("options");
    assert_eq!(opts.database, "accounts");

    std::env::remove_var("DB_NAME");
    std::env::remove_var("DB_ROOT_USER");
    std::env::remove_var("DB_ROOT_PASSWORD");
}
