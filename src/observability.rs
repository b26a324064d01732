//! Logging setup and span constructors.
//!
//! Every component logs through `tracing`; nothing is printed unless the
//! embedding binary installs a subscriber. [`init_tracing`] installs the
//! default one: human-readable `fmt` output filtered by `RUST_LOG`
//! (default `info`).

use tracing::Span;
use tracing_subscriber::EnvFilter;

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the default subscriber.
///
/// Safe to call multiple times; calls after the first (or after another
/// subscriber was installed) are no-ops.
///
/// # Example
///
/// ```rust
/// gemelo::observability::init_tracing();
/// gemelo::observability::init_tracing();
/// ```
pub fn init_tracing() {
    let _ = try_init_tracing();
}

/// Install the default subscriber, reporting whether this call installed it.
#[must_use = "returns false when a global subscriber was already set"]
pub fn try_init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Subscriber for tests: output captured by the test harness, `debug` for
/// this crate unless `RUST_LOG` says otherwise.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter("gemelo=debug"))
        .with_test_writer()
        .try_init();
}

/// Span covering the whole life of one run.
#[must_use]
pub fn run_span(run_id: &str, scenario_id: &str) -> Span {
    tracing::info_span!("run", run_id = run_id, scenario = scenario_id)
}

/// Span covering one batch.
#[must_use]
pub fn batch_span(runs: usize, worker_limit: usize) -> Span {
    tracing::info_span!("batch", runs = runs, worker_limit = worker_limit)
}
