//! Shared bring-up helpers for tests across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing::{self, info};
use parking_lot::Once;

#[cfg(feature = "future_timeout")]
pub mod timeout;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the `RUST_LOG` environment variable is set.
///
/// Safe to call from every test; the subscriber is installed at most once per
/// process.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Install a terminal logging subscriber honoring `RUST_LOG`.
pub fn start_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    LOG_SETUP.call_once(|| {
        // Convert log records emitted through the `log` facade into tracing
        // events so they land in the same subscriber.
        tracing_log::LogTracer::init().expect("log tracer init");

        let subscriber = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("subscriber install");

        info!("logging enabled for test run");
    });
}

/// Asserts that `actual` contains `expected`, with a useful failure message.
#[macro_export]
macro_rules! assert_contains {
    ($actual:expr, $expected:expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected value in actual.\n\nExpected:\n{}\n\nActual:\n{}",
            expected_value,
            actual_value,
        );
    };
}
