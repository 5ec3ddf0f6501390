//! In-memory stand-in for a MySQL server.
//!
//! Understands just enough DDL to model the bootstrap statements
//! (`CREATE DATABASE`, `USE`, `CREATE TABLE`, `CREATE USER`, `GRANT`), so
//! tests can assert on resulting server state as well as on the exact
//! statements issued. Failures, panics and stalls can be scripted per
//! statement substring.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use db_infra::{ConnSpec, DbDriver, DbSession};
use sea_orm::{DbErr, RuntimeErr};

const STALL: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct ServerState {
    logins: HashMap<String, String>,
    databases: HashMap<String, HashSet<String>>,
    accounts: HashSet<String>,
    grants: HashSet<String>,
    /// (user, statement) in execution order.
    executed: Vec<(String, String)>,
    connect_attempts: HashMap<String, usize>,
    opened: HashMap<String, usize>,
    closed: HashMap<String, usize>,
    dropped: HashMap<String, usize>,
    fail_on: Vec<String>,
    panic_on: Vec<String>,
    stall_on: Vec<String>,
    stall_connect: HashSet<String>,
    fail_probe: bool,
    stall_probe: bool,
}

fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    // A scripted panic must not wedge later assertions.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn token(rest: &str) -> &str {
    rest.trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
}

fn unquote(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '`' | '\'' | '"'))
        .collect()
}

/// Name following `prefix`, honouring an optional `IF NOT EXISTS`.
fn object_after(sql: &str, upper: &str, prefix: &str) -> (bool, String) {
    let with_guard = format!("{prefix} IF NOT EXISTS");
    if upper.starts_with(&with_guard) {
        (true, unquote(token(&sql[with_guard.len()..])))
    } else {
        (false, unquote(token(&sql[prefix.len()..])))
    }
}

fn apply(state: &mut ServerState, current_db: &mut Option<String>, sql: &str) -> Result<(), String> {
    let sql = sql.trim();
    let upper = sql.to_ascii_uppercase();

    if upper.starts_with("CREATE DATABASE") {
        let (guarded, name) = object_after(sql, &upper, "CREATE DATABASE");
        if state.databases.contains_key(&name) {
            if !guarded {
                return Err(format!("Can't create database '{name}'; database exists"));
            }
        } else {
            state.databases.insert(name, HashSet::new());
        }
    } else if upper.starts_with("USE ") {
        let name = unquote(token(&sql[4..]));
        if !state.databases.contains_key(&name) {
            return Err(format!("Unknown database '{name}'"));
        }
        *current_db = Some(name);
    } else if upper.starts_with("CREATE TABLE") {
        let (guarded, name) = object_after(sql, &upper, "CREATE TABLE");
        let db = current_db
            .as_ref()
            .ok_or_else(|| "No database selected".to_string())?;
        let tables = state
            .databases
            .get_mut(db)
            .ok_or_else(|| format!("Unknown database '{db}'"))?;
        if !tables.insert(name.clone()) && !guarded {
            return Err(format!("Table '{name}' already exists"));
        }
    } else if upper.starts_with("CREATE USER") {
        let (guarded, account) = object_after(sql, &upper, "CREATE USER");
        if state.accounts.contains(&account) {
            if !guarded {
                return Err(format!("Operation CREATE USER failed for {account}"));
            }
            return Ok(());
        }
        let password = upper
            .find("IDENTIFIED BY ")
            .map(|idx| {
                let raw = sql[idx + "IDENTIFIED BY ".len()..].trim();
                raw.trim_matches('\'').replace("''", "'")
            })
            .unwrap_or_default();
        let user = account.split('@').next().unwrap_or_default().to_string();
        state.logins.insert(user, password);
        state.accounts.insert(account);
    } else if upper.starts_with("GRANT") {
        let idx = upper
            .find(" TO ")
            .ok_or_else(|| "malformed GRANT".to_string())?;
        let account = unquote(token(&sql[idx + 4..]));
        if !state.accounts.contains(&account) {
            return Err(format!("You are not allowed to create a user with GRANT ({account})"));
        }
        state.grants.insert(account);
    }
    Ok(())
}

enum Action {
    Panic,
    Stall,
    Fail,
    Done(Result<(), String>),
}

/// Scripted driver. Clones share one server.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept logins for `user` with `password`.
    pub fn with_login(self, user: &str, password: &str) -> Self {
        lock(&self.state)
            .logins
            .insert(user.to_string(), password.to_string());
        self
    }

    pub fn with_database(self, db: &str) -> Self {
        lock(&self.state)
            .databases
            .entry(db.to_string())
            .or_default();
        self
    }

    pub fn with_table(self, db: &str, table: &str) -> Self {
        lock(&self.state)
            .databases
            .entry(db.to_string())
            .or_default()
            .insert(table.to_string());
        self
    }

    /// Statements containing `needle` fail with an execution error.
    pub fn fail_statements_containing(self, needle: &str) -> Self {
        lock(&self.state).fail_on.push(needle.to_string());
        self
    }

    /// Statements containing `needle` panic inside the driver.
    pub fn panic_on_statement_containing(self, needle: &str) -> Self {
        lock(&self.state).panic_on.push(needle.to_string());
        self
    }

    /// Statements containing `needle` never complete.
    pub fn stall_on_statement_containing(self, needle: &str) -> Self {
        lock(&self.state).stall_on.push(needle.to_string());
        self
    }

    /// Connections as `user` never complete.
    pub fn stall_connect_for(self, user: &str) -> Self {
        lock(&self.state).stall_connect.insert(user.to_string());
        self
    }

    /// The probe query errors instead of answering.
    pub fn fail_probe(self) -> Self {
        lock(&self.state).fail_probe = true;
        self
    }

    /// The probe query never completes.
    pub fn stall_probe(self) -> Self {
        lock(&self.state).stall_probe = true;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.state)
            .executed
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn executed_by(&self, user: &str) -> Vec<String> {
        lock(&self.state)
            .executed
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn connect_attempts(&self, user: &str) -> usize {
        lock(&self.state)
            .connect_attempts
            .get(user)
            .copied()
            .unwrap_or(0)
    }

    pub fn sessions_opened(&self, user: &str) -> usize {
        lock(&self.state).opened.get(user).copied().unwrap_or(0)
    }

    pub fn sessions_closed(&self, user: &str) -> usize {
        lock(&self.state).closed.get(user).copied().unwrap_or(0)
    }

    /// Sessions dropped without an explicit close.
    pub fn sessions_dropped(&self, user: &str) -> usize {
        lock(&self.state).dropped.get(user).copied().unwrap_or(0)
    }

    pub fn has_database(&self, db: &str) -> bool {
        lock(&self.state).databases.contains_key(db)
    }

    pub fn has_table(&self, db: &str, table: &str) -> bool {
        lock(&self.state)
            .databases
            .get(db)
            .is_some_and(|tables| tables.contains(table))
    }

    /// `account` is `user@host`, unquoted.
    pub fn has_account(&self, account: &str) -> bool {
        lock(&self.state).accounts.contains(account)
    }

    pub fn has_grant(&self, account: &str) -> bool {
        lock(&self.state).grants.contains(account)
    }
}

#[async_trait]
impl DbDriver for ScriptedDriver {
    type Session = ScriptedSession;

    async fn connect(&self, spec: &ConnSpec) -> Result<ScriptedSession, DbErr> {
        let stall = {
            let mut st = lock(&self.state);
            *st.connect_attempts.entry(spec.user.clone()).or_default() += 1;
            st.stall_connect.contains(&spec.user)
        };
        if stall {
            tokio::time::sleep(STALL).await;
        }

        let mut st = lock(&self.state);
        match st.logins.get(&spec.user) {
            Some(password) if *password == spec.password => {}
            _ => {
                return Err(DbErr::Conn(RuntimeErr::Internal(format!(
                    "Access denied for user '{}'@'{}'",
                    spec.user, spec.host
                ))))
            }
        }
        if let Some(db) = &spec.database {
            if !st.databases.contains_key(db) {
                return Err(DbErr::Conn(RuntimeErr::Internal(format!(
                    "Unknown database '{db}'"
                ))));
            }
        }
        *st.opened.entry(spec.user.clone()).or_default() += 1;

        Ok(ScriptedSession {
            user: spec.user.clone(),
            current_db: spec.database.clone(),
            closed: false,
            state: self.state.clone(),
        })
    }
}

pub struct ScriptedSession {
    user: String,
    current_db: Option<String>,
    closed: bool,
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedSession {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn current_database(&self) -> Option<&str> {
        self.current_db.as_deref()
    }
}

#[async_trait]
impl DbSession for ScriptedSession {
    async fn execute(&mut self, sql: &str) -> Result<(), DbErr> {
        let action = {
            let mut st = lock(&self.state);
            st.executed.push((self.user.clone(), sql.to_string()));
            if st.panic_on.iter().any(|n| sql.contains(n.as_str())) {
                Action::Panic
            } else if st.stall_on.iter().any(|n| sql.contains(n.as_str())) {
                Action::Stall
            } else if st.fail_on.iter().any(|n| sql.contains(n.as_str())) {
                Action::Fail
            } else {
                Action::Done(apply(&mut st, &mut self.current_db, sql))
            }
        };

        match action {
            Action::Panic => panic!("scripted panic while executing statement"),
            Action::Stall => {
                tokio::time::sleep(STALL).await;
                Ok(())
            }
            Action::Fail => Err(DbErr::Exec(RuntimeErr::Internal(
                "scripted statement failure".to_string(),
            ))),
            Action::Done(result) => result.map_err(|e| DbErr::Exec(RuntimeErr::Internal(e))),
        }
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool, DbErr> {
        let stall = lock(&self.state).stall_probe;
        if stall {
            tokio::time::sleep(STALL).await;
        }

        let st = lock(&self.state);
        if st.fail_probe {
            return Err(DbErr::Query(RuntimeErr::Internal(
                "scripted probe failure".to_string(),
            )));
        }
        Ok(self
            .current_db
            .as_ref()
            .and_then(|db| st.databases.get(db))
            .is_some_and(|tables| tables.contains(table)))
    }

    async fn close(mut self) -> Result<(), DbErr> {
        self.closed = true;
        *lock(&self.state)
            .closed
            .entry(self.user.clone())
            .or_default() += 1;
        Ok(())
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        if !self.closed {
            *lock(&self.state)
                .dropped
                .entry(self.user.clone())
                .or_default() += 1;
        }
    }
}
