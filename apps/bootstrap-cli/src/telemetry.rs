use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "db_bootstrap=info,db_infra=info,sqlx=warn,sea_orm=warn";

/// Filter from a raw `RUST_LOG` value, plus a warning when it was unusable.
fn env_filter(raw: Option<String>) -> (EnvFilter, Option<String>) {
    match raw.filter(|v| !v.trim().is_empty()) {
        None => (EnvFilter::new(DEFAULT_FILTER), None),
        Some(raw) => match EnvFilter::try_new(&raw) {
            Ok(filter) => (filter, None),
            Err(e) => (
                EnvFilter::new(DEFAULT_FILTER),
                Some(format!(
                    "ignoring invalid {}={raw:?} ({e}); using {DEFAULT_FILTER}",
                    EnvFilter::DEFAULT_ENV
                )),
            ),
        },
    }
}

pub fn init_tracing(json: bool) {
    let (env_filter, warning) = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok());

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt_layer.with_ansi(false).json()).init();
    } else {
        registry.with(fmt_layer.without_time()).init();
    }

    // Bypasses the filter it is about.
    if let Some(warning) = warning {
        eprintln!("db-bootstrap: {warning}");
    }
}
