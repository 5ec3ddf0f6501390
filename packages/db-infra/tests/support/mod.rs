//! Shared helpers for db-infra integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use db_infra::config::db::{AdminCredentials, BootstrapSettings, ConnectionConfig};
use db_infra::{BootstrapOptions, Bootstrapper};
use test_support::ScriptedDriver;

/// Automatically initialize logging for every integration test binary.
#[ctor::ctor]
fn _auto_init_for_integration_tests() {
    test_support::logging::init();
}

pub const ROOT_PASSWORD: &str = "rootpw";

/// A server where only the admin account can log in.
pub fn fresh_server() -> ScriptedDriver {
    ScriptedDriver::new().with_login("root", ROOT_PASSWORD)
}

/// A fresh server that also knows the default application account.
pub fn fresh_server_with_app_login() -> ScriptedDriver {
    fresh_server().with_login("username", "password")
}

pub fn bootstrapper(driver: &ScriptedDriver) -> Bootstrapper<ScriptedDriver> {
    Bootstrapper::new(Arc::new(driver.clone()), "localhost", 3306)
}

pub fn admin() -> AdminCredentials {
    AdminCredentials::new("root", ROOT_PASSWORD)
}

pub fn options(database: &str) -> BootstrapOptions {
    BootstrapOptions::new(admin(), database).with_stage_timeout(Duration::from_secs(5))
}

/// Defaults: `username`/`password` on `mydb`, probe table `users`.
pub fn app_config() -> ConnectionConfig {
    ConnectionConfig::from_lookup(|_: &str| None).expect("default config")
}

pub fn settings() -> BootstrapSettings {
    BootstrapSettings {
        admin: admin(),
        stage_timeout: Duration::from_secs(5),
        ..BootstrapSettings::default()
    }
}
