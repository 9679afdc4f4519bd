//! Shared test setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a fmt subscriber once so scheduler events show up in test
/// output when a log level is configured.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}
