//! Tracing initialisation for tests.
//!
//! [`init_test_tracing`] installs a subscriber that writes through the test
//! harness, so gateway logs show up next to a failing assertion. It is
//! idempotent and may be called from every test.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: gateway crates at debug, the HTTP
/// stack at warn.
pub const DEFAULT_TEST_FILTER: &str = "berth_core=debug,berth_test_utils=debug,hyper=warn,info";

/// Install the test subscriber, honouring `RUST_LOG` when set.
///
/// ```ignore
/// #[tokio::test]
/// async fn relays_events() {
///     berth_test_utils::tracing_setup::init_test_tracing();
///     tracing::debug!("visible with --nocapture");
/// }
/// ```
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_TEST_FILTER);
}

/// Like [`init_test_tracing`] with an explicit fallback filter.
pub fn init_test_tracing_with(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
