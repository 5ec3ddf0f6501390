use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DbInfraError;
use crate::infra::db::driver::ConnSpec;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3306;
pub const DEFAULT_APP_USER: &str = "username";
pub const DEFAULT_APP_PASSWORD: &str = "password";
pub const DEFAULT_APP_DATABASE: &str = "mydb";
/// Database name used when bootstrap runs on its own, without a provider.
pub const DEFAULT_BOOTSTRAP_DATABASE: &str = "users_db";
pub const DEFAULT_ADMIN_USER: &str = "root";
pub const DEFAULT_PROBE_TABLE: &str = "users";
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Reads a variable through `lookup`, treating empty values as unset.
fn var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, DbInfraError> {
    match var(lookup, name) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            DbInfraError::config(format!("environment variable '{name}' has invalid value '{raw}'"))
        }),
        None => Ok(default),
    }
}

pub fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Application-level connection settings (limited privileges).
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Table whose presence marks the schema as initialized.
    pub probe_table: String,
}

impl ConnectionConfig {
    pub fn from_env() -> Result<Self, DbInfraError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbInfraError> {
        Ok(Self {
            host: var(&lookup, "DB_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_var(&lookup, "DB_PORT", DEFAULT_PORT)?,
            user: var(&lookup, "DB_USER").unwrap_or_else(|| DEFAULT_APP_USER.to_string()),
            password: var(&lookup, "DB_PASSWORD")
                .unwrap_or_else(|| DEFAULT_APP_PASSWORD.to_string()),
            database: var(&lookup, "DB_NAME").unwrap_or_else(|| DEFAULT_APP_DATABASE.to_string()),
            probe_table: var(&lookup, "DB_PROBE_TABLE")
                .unwrap_or_else(|| DEFAULT_PROBE_TABLE.to_string()),
        })
    }

    /// Connection target for the ordinary application credentials.
    pub fn app_spec(&self) -> ConnSpec {
        ConnSpec {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: Some(self.database.clone()),
        }
    }

}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("probe_table", &self.probe_table)
            .finish()
    }
}

/// Elevated credentials used only while bootstrapping.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
}

impl AdminCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            user: var(&lookup, "DB_ROOT_USER").unwrap_or_else(|| DEFAULT_ADMIN_USER.to_string()),
            password: var(&lookup, "DB_ROOT_PASSWORD").unwrap_or_default(),
        }
    }

    /// Connection target for the elevated session: no default schema.
    pub fn conn_spec(&self, host: &str, port: u16) -> ConnSpec {
        ConnSpec {
            host: host.to_string(),
            port,
            user: self.user.clone(),
            password: self.password.clone(),
            database: None,
        }
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Bootstrap settings that are not part of the application connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapSettings {
    pub admin: AdminCredentials,
    pub schema_file: Option<PathBuf>,
    pub stage_timeout: Duration,
    pub connect_timeout: Duration,
}

impl BootstrapSettings {
    pub fn from_env() -> Result<Self, DbInfraError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DbInfraError> {
        let stage_ms = parse_var(
            &lookup,
            "DB_BOOTSTRAP_STAGE_TIMEOUT_MS",
            DEFAULT_STAGE_TIMEOUT_MS,
        )?;
        let connect_ms = parse_var(&lookup, "DB_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS)?;
        if stage_ms == 0 || connect_ms == 0 {
            return Err(DbInfraError::config("timeouts must be greater than zero"));
        }

        Ok(Self {
            admin: AdminCredentials::from_lookup(&lookup),
            schema_file: var(&lookup, "DB_SCHEMA_FILE").map(PathBuf::from),
            stage_timeout: Duration::from_millis(stage_ms),
            connect_timeout: Duration::from_millis(connect_ms),
        })
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            admin: AdminCredentials::new(DEFAULT_ADMIN_USER, ""),
            schema_file: None,
            stage_timeout: Duration::from_millis(DEFAULT_STAGE_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}
