//! Test support for the db-infra workspace
//!
//! Provides the unified test logging initializer and an in-memory scripted
//! driver that stands in for a MySQL server.

pub mod logging;
pub mod scripted_driver;

pub use scripted_driver::{ScriptedDriver, ScriptedSession};
