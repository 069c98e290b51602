//! Shared fixtures for cloudpipe's integration tests: builders for
//! operations and configs, a delegate that records dispatches, and tracing
//! and timeout helpers.

pub mod builders;
pub mod recording_delegate;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

pub use builders::{ConfigFileBuilder, OperationBuilder, PipelineConfigBuilder};
pub use recording_delegate::{RecordingDelegate, StartRecord};

/// Upper bound for any single await in an async test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
///
/// Filtered by `RUST_LOG` (e.g. `RUST_LOG=cloudpipe=debug`), `info`
/// otherwise. Output shows up for failing tests only.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// Await `f`, panicking after [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, f)
        .await
        .unwrap_or_else(|_| panic!("test timed out after {TEST_TIMEOUT:?}"))
}
