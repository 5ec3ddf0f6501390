//! Test logging for db-infra integration tests.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Filter used for `TEST_LOG=1`: bootstrap stages and probes at debug.
const VERBOSE_FILTER: &str = "warn,db_infra=debug,test_support=debug";

fn directives() -> String {
    let from_env = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
    match from_env("TEST_LOG").or_else(|| from_env("RUST_LOG")) {
        Some(v) if v == "1" || v.eq_ignore_ascii_case("true") => VERBOSE_FILTER.to_string(),
        Some(v) => v,
        None => "warn".to_string(),
    }
}

/// Install the test subscriber once per test binary.
///
/// Level precedence: `TEST_LOG`, then `RUST_LOG`, then `warn`. Empty values
/// count as unset, and an unparsable filter falls back to `warn`.
pub fn init() {
    INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_new(directives()).unwrap_or_else(|_| EnvFilter::new("warn"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .with_target(true)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        assert!(INITIALIZED.get().is_some());
    }
}
