//! # cmap-testing
//!
//! Test infrastructure for `cmap-pool`.
//!
//! Pool-dependent integration tests live in this crate's `tests/` directory.
//!
//! ## Features
//!
//! - Mock transports with scripted connect failures and call counters
//! - An event recorder that can wait for a number of events of one type
//! - A runner for JSON-described operation sequences (threads, expected
//!   events, expected errors)
//!
//! ## Example
//!
//! ```rust,ignore
//! use cmap_testing::{ConformanceTest, run_test};
//!
//! let test: ConformanceTest = serde_json::from_str(json)?;
//! run_test(&test).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;
pub mod recorder;
pub mod runner;

pub use mock::{MockTransport, MockTransportFactory};
pub use recorder::EventRecorder;
pub use runner::{ConformanceTest, ExpectedError, Operation, RunnerError, run_test};

/// Install a `tracing` subscriber for test output, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
