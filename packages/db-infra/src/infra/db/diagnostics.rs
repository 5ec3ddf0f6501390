use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::error::BootstrapStage;

/// Counters for probe and bootstrap activity.
///
/// One set is shared between a provider and its bootstrapper; they are not
/// process-global so independent providers (and tests) do not interfere.
#[derive(Debug, Default)]
pub struct BootstrapCounters {
    probe_hits: AtomicU64,
    probe_misses: AtomicU64,
    transient_connect_failures: AtomicU64,
    bootstraps_started: AtomicU64,
    bootstraps_succeeded: AtomicU64,
    admin_connect_failures: AtomicU64,
    user_create_failures: AtomicU64,
    schema_create_failures: AtomicU64,
    admin_sessions_opened: AtomicU64,
    admin_sessions_released: AtomicU64,
    fatal_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub probe_hits: u64,
    pub probe_misses: u64,
    pub transient_connect_failures: u64,
    pub bootstraps_started: u64,
    pub bootstraps_succeeded: u64,
    pub admin_connect_failures: u64,
    pub user_create_failures: u64,
    pub schema_create_failures: u64,
    pub admin_sessions_opened: u64,
    pub admin_sessions_released: u64,
    pub fatal_errors: u64,
}

impl CountersSnapshot {
    pub fn bootstrap_failures(&self) -> u64 {
        self.admin_connect_failures + self.user_create_failures + self.schema_create_failures
    }

    /// Elevated sessions opened but not yet released.
    pub fn admin_sessions_live(&self) -> u64 {
        self.admin_sessions_opened
            .saturating_sub(self.admin_sessions_released)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BootstrapCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe_hit(&self) {
        bump(&self.probe_hits);
    }

    pub fn probe_miss(&self) {
        bump(&self.probe_misses);
    }

    pub fn transient_connect_failure(&self) {
        bump(&self.transient_connect_failures);
    }

    pub fn bootstrap_started(&self) {
        bump(&self.bootstraps_started);
    }

    pub fn bootstrap_succeeded(&self) {
        bump(&self.bootstraps_succeeded);
    }

    pub fn stage_failed(&self, stage: BootstrapStage) {
        match stage {
            BootstrapStage::AdminConnect => bump(&self.admin_connect_failures),
            BootstrapStage::UserCreate => bump(&self.user_create_failures),
            BootstrapStage::SchemaCreate => bump(&self.schema_create_failures),
        }
    }

    pub fn admin_session_opened(&self) {
        bump(&self.admin_sessions_opened);
    }

    pub fn admin_session_released(&self) {
        bump(&self.admin_sessions_released);
    }

    pub fn fatal_error(&self) {
        bump(&self.fatal_errors);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            probe_hits: load(&self.probe_hits),
            probe_misses: load(&self.probe_misses),
            transient_connect_failures: load(&self.transient_connect_failures),
            bootstraps_started: load(&self.bootstraps_started),
            bootstraps_succeeded: load(&self.bootstraps_succeeded),
            admin_connect_failures: load(&self.admin_connect_failures),
            user_create_failures: load(&self.user_create_failures),
            schema_create_failures: load(&self.schema_create_failures),
            admin_sessions_opened: load(&self.admin_sessions_opened),
            admin_sessions_released: load(&self.admin_sessions_released),
            fatal_errors: load(&self.fatal_errors),
        }
    }

    pub fn log_snapshot(&self, label: &str) {
        let s = self.snapshot();
        info!(
            counters = label,
            probe_hits = s.probe_hits,
            probe_misses = s.probe_misses,
            transient_connect_failures = s.transient_connect_failures,
            bootstraps_started = s.bootstraps_started,
            bootstraps_succeeded = s.bootstraps_succeeded,
            bootstrap_failures = s.bootstrap_failures(),
            admin_sessions_live = s.admin_sessions_live(),
            fatal_errors = s.fatal_errors
        );
    }
}
