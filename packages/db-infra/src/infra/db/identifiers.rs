//! Allow-list validation for names that end up inside DDL text.
//!
//! Database names, account names and hosts cannot be bound as statement
//! parameters in `CREATE DATABASE` / `CREATE USER` / `GRANT`, so every such
//! value is checked here before it is formatted into SQL.

use crate::error::DbInfraError;

const MAX_DATABASE_LEN: usize = 64;
const MAX_USER_LEN: usize = 32;
const MAX_HOST_LEN: usize = 255;

fn invalid(kind: &'static str, value: &str) -> DbInfraError {
    DbInfraError::InvalidIdentifier {
        kind,
        value: value.to_string(),
    }
}

/// Schema or table name: `[A-Za-z0-9_$]`, not purely numeric.
pub fn validate_database_name(name: &str) -> Result<&str, DbInfraError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_DATABASE_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !name.chars().all(|c| c.is_ascii_digit());
    if ok {
        Ok(name)
    } else {
        Err(invalid("database", name))
    }
}

/// Account name: `[A-Za-z0-9_.-]`.
pub fn validate_user_name(name: &str) -> Result<&str, DbInfraError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_USER_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(name)
    } else {
        Err(invalid("user", name))
    }
}

/// Account host part: hostnames, IP literals and the `%` / `_` wildcards.
pub fn validate_host(host: &str) -> Result<&str, DbInfraError> {
    let ok = !host.is_empty()
        && host.len() <= MAX_HOST_LEN
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '%' | ':'));
    if ok {
        Ok(host)
    } else {
        Err(invalid("host", host))
    }
}

/// Passwords are free text but may not carry backslashes or control
/// characters, whose meaning depends on the server's SQL mode.
pub fn validate_password(password: &str) -> Result<&str, DbInfraError> {
    if password.chars().any(|c| c == '\\' || c.is_control()) {
        // Never echo the password back.
        return Err(invalid("password", "<redacted>"));
    }
    Ok(password)
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
