//! JSON conformance runner.
//!
//! A test file describes pool options, a sequence of operations, and what
//! should come out: an optional error and a list of expected events. Each
//! expected event is matched as a subset of the serialized actual event at
//! the same position, after dropping event types listed in `ignore`. The
//! value `42` (number or string) matches anything that is present.
//!
//! Operations without a `thread` run on the main sequence. `start` spawns a
//! named thread (a tokio task fed over a channel); operations naming it run
//! there in order. `waitForThread` joins it and surfaces its first error.
//!
//! ```json
//! {
//!   "version": 1,
//!   "style": "unit",
//!   "description": "must destroy checked-in connection if it is stale",
//!   "operations": [
//!     { "name": "checkOut", "label": "conn" },
//!     { "name": "clear" },
//!     { "name": "checkIn", "connection": "conn" }
//!   ],
//!   "events": [
//!     { "type": "connectionPoolCleared" },
//!     { "type": "connectionReleased", "connection": { "id": 1 } },
//!     { "type": "connectionClosed", "connection": { "id": 1 }, "reason": "stale" }
//!   ],
//!   "ignore": ["connectionPoolCreated", "connectionAcquisitionStarted",
//!              "connectionCreated", "connectionReady", "connectionAcquired"]
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cmap_pool::{Pool, PoolError, PoolOptions, PooledConnection};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mock::MockTransportFactory;
use crate::recorder::EventRecorder;

/// How long `waitForEvent` waits before giving up.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Value that matches anything present.
const ANY: i64 = 42;

/// One test file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConformanceTest {
    /// Format version; only 1 is understood.
    pub version: u32,
    /// Test style; only `unit` is run.
    pub style: String,
    /// What the test checks.
    pub description: String,
    /// Pool options under their connection-string names.
    #[serde(default)]
    pub pool_options: PoolOptions,
    /// Operations to run.
    pub operations: Vec<Operation>,
    /// Error the run must end with, if any.
    #[serde(default)]
    pub error: Option<ExpectedError>,
    /// Expected events, matched by position.
    #[serde(default)]
    pub events: Vec<Value>,
    /// Event types to drop before matching.
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl ConformanceTest {
    /// Whether this runner understands the test.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.version == 1 && self.style == "unit"
    }
}

/// Expected error description.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpectedError {
    /// Error type, compared case-insensitively with [`PoolError::error_type`].
    #[serde(rename = "type")]
    pub error_type: String,
    /// Text the error message must contain, compared case-insensitively.
    #[serde(default)]
    pub message: Option<String>,
}

impl ExpectedError {
    fn matches(&self, actual: &PoolError) -> bool {
        if !self.error_type.eq_ignore_ascii_case(actual.error_type()) {
            return false;
        }
        self.message.as_ref().is_none_or(|message| {
            actual
                .to_string()
                .to_lowercase()
                .contains(&message.to_lowercase())
        })
    }
}

/// A test operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum Operation {
    /// Spawn a named thread.
    Start {
        /// Thread name.
        target: String,
    },
    /// Sleep.
    Wait {
        /// Milliseconds to sleep.
        ms: u64,
    },
    /// Join a thread, surfacing its first error.
    WaitForThread {
        /// Thread name.
        target: String,
        /// Ignore the thread's error.
        #[serde(default, rename = "suppressError")]
        suppress_error: bool,
    },
    /// Wait until a number of events of one type were emitted.
    WaitForEvent {
        /// Event type.
        event: String,
        /// Minimum count.
        count: usize,
    },
    /// Acquire a connection.
    #[serde(alias = "acquire")]
    CheckOut {
        /// Thread to run on.
        #[serde(default)]
        thread: Option<String>,
        /// Name to store the connection under.
        #[serde(default)]
        label: Option<String>,
    },
    /// Release a labelled connection.
    #[serde(alias = "release")]
    CheckIn {
        /// Thread to run on.
        #[serde(default)]
        thread: Option<String>,
        /// Label of the connection.
        connection: String,
        /// Destroy instead of recycling.
        #[serde(default)]
        force: bool,
    },
    /// Clear the pool.
    Clear {
        /// Thread to run on.
        #[serde(default)]
        thread: Option<String>,
    },
    /// Close the pool.
    Close {
        /// Thread to run on.
        #[serde(default)]
        thread: Option<String>,
    },
}

impl Operation {
    fn thread(&self) -> Option<&str> {
        match self {
            Self::CheckOut { thread, .. }
            | Self::CheckIn { thread, .. }
            | Self::Clear { thread }
            | Self::Close { thread } => thread.as_deref(),
            _ => None,
        }
    }
}

/// Runner failures.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A pool operation failed.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// `checkIn` named a label no `checkOut` stored.
    #[error("attempted to release non-existent connection {0}")]
    UnknownConnection(String),

    /// An operation targeted a thread that was never started.
    #[error("invalid thread {0}")]
    UnknownThread(String),

    /// A thread panicked or was cancelled.
    #[error("thread {0} did not finish")]
    ThreadFailed(String),

    /// `waitForEvent` gave up.
    #[error("timed out waiting for {count} {event} events")]
    EventTimeout {
        /// Event type waited for.
        event: String,
        /// Count waited for.
        count: usize,
    },

    /// The run ended with a different error than expected.
    #[error("expected {expected} error, got: {actual}")]
    ErrorMismatch {
        /// Expected error type.
        expected: String,
        /// Actual error.
        actual: String,
    },

    /// The run succeeded although an error was expected.
    #[error("expected {0} error, but the operations succeeded")]
    MissingError(String),

    /// An event did not match.
    #[error("event {index} mismatch: expected {expected}, got {actual}")]
    EventMismatch {
        /// Position among the non-ignored events.
        index: usize,
        /// Expected event.
        expected: Value,
        /// Actual event, `null` if missing.
        actual: Value,
    },

    /// The test file itself is wrong.
    #[error("invalid test: {0}")]
    Invalid(String),

    /// Event serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// State shared by the main sequence and its threads.
struct Context {
    pool: Pool,
    recorder: Arc<EventRecorder>,
    connections: Mutex<HashMap<String, PooledConnection>>,
    /// Connections checked out without a label stay checked out.
    unlabelled: Mutex<Vec<PooledConnection>>,
}

impl Context {
    async fn execute(&self, op: &Operation) -> Result<(), RunnerError> {
        tracing::trace!(?op, "running operation");
        match op {
            Operation::CheckOut { label, .. } => {
                let conn = self.pool.acquire().await?;
                match label {
                    Some(label) => {
                        self.connections.lock().insert(label.clone(), conn);
                    }
                    None => self.unlabelled.lock().push(conn),
                }
            }
            Operation::CheckIn {
                connection, force, ..
            } => {
                let conn = self
                    .connections
                    .lock()
                    .remove(connection)
                    .ok_or_else(|| RunnerError::UnknownConnection(connection.clone()))?;
                self.pool.release(conn, *force)?;
            }
            Operation::Clear { .. } => self.pool.clear(),
            Operation::Close { .. } => self.pool.close(),
            Operation::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            Operation::WaitForEvent { event, count } => {
                if !self.recorder.wait_for(event, *count, EVENT_TIMEOUT).await {
                    return Err(RunnerError::EventTimeout {
                        event: event.clone(),
                        count: *count,
                    });
                }
            }
            Operation::Start { .. } | Operation::WaitForThread { .. } => {
                return Err(RunnerError::Invalid(format!(
                    "{op:?} can only run on the main sequence"
                )));
            }
        }
        Ok(())
    }
}

struct Thread {
    name: String,
    ops: mpsc::UnboundedSender<Operation>,
    handle: JoinHandle<Result<(), RunnerError>>,
}

impl Thread {
    fn spawn(name: String, ctx: Arc<Context>) -> Self {
        let (ops, mut rx) = mpsc::unbounded_channel::<Operation>();
        let handle = tokio::spawn(async move {
            let mut result = Ok(());
            while let Some(op) = rx.recv().await {
                // After the first error the thread only drains its queue.
                if result.is_ok() {
                    result = ctx.execute(&op).await;
                    tokio::task::yield_now().await;
                }
            }
            result
        });
        Self { name, ops, handle }
    }

    fn run(&self, op: Operation) {
        // A closed channel means the thread is being joined; nothing to run.
        let _ = self.ops.send(op);
    }

    async fn finish(self) -> Result<(), RunnerError> {
        let Self { name, ops, handle } = self;
        drop(ops);
        handle.await.map_err(|_| RunnerError::ThreadFailed(name))?
    }
}

async fn run_operations(ctx: &Arc<Context>, operations: &[Operation]) -> Result<(), RunnerError> {
    let mut threads: HashMap<String, Thread> = HashMap::new();

    let result = async {
        for op in operations {
            match op {
                Operation::Start { target } => {
                    let thread = Thread::spawn(target.clone(), Arc::clone(ctx));
                    threads.insert(target.clone(), thread);
                }
                Operation::WaitForThread {
                    target,
                    suppress_error,
                } => {
                    let thread = threads
                        .remove(target)
                        .ok_or_else(|| RunnerError::UnknownThread(target.clone()))?;
                    match thread.finish().await {
                        Err(e) if !suppress_error => return Err(e),
                        Err(e) => tracing::debug!(thread = %target, error = %e, "suppressed thread error"),
                        Ok(()) => {}
                    }
                }
                op => match op.thread() {
                    Some(name) => threads
                        .get(name)
                        .ok_or_else(|| RunnerError::UnknownThread(name.to_string()))?
                        .run(op.clone()),
                    None => ctx.execute(op).await?,
                },
            }
            tokio::task::yield_now().await;
        }
        Ok::<(), RunnerError>(())
    }
    .await;

    for (_, thread) in threads {
        tracing::debug!(thread = %thread.name, "aborting unjoined thread");
        thread.handle.abort();
    }
    result
}

/// Whether `actual` contains everything in `expected`.
#[must_use]
pub fn matches_subset(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Number(n) if n.as_i64() == Some(ANY) => !actual.is_null(),
        Value::String(s) if s == "42" => !actual.is_null(),
        Value::Object(fields) => fields.iter().all(|(key, value)| {
            matches_subset(value, actual.get(key).unwrap_or(&Value::Null))
        }),
        Value::Array(items) => actual.as_array().is_some_and(|actual| {
            actual.len() == items.len()
                && items.iter().zip(actual).all(|(e, a)| matches_subset(e, a))
        }),
        _ => expected == actual,
    }
}

/// Run one test against a fresh pool backed by mock transports.
pub async fn run_test(test: &ConformanceTest) -> Result<(), RunnerError> {
    tracing::debug!(description = %test.description, "running conformance test");

    let factory = MockTransportFactory::new();
    let recorder = EventRecorder::new();
    let pool = Pool::builder()
        .options(&test.pool_options)
        .transport_factory(factory.shared())
        .event_handler(recorder.clone())
        .build()
        .await?;

    let ctx = Arc::new(Context {
        pool,
        recorder: Arc::clone(&recorder),
        connections: Mutex::new(HashMap::new()),
        unlabelled: Mutex::new(Vec::new()),
    });

    let outcome = run_operations(&ctx, &test.operations).await;
    let checked = check_outcome(test, outcome, &recorder);

    ctx.pool.destroy();
    ctx.connections.lock().clear();
    ctx.unlabelled.lock().clear();

    checked
}

fn check_outcome(
    test: &ConformanceTest,
    outcome: Result<(), RunnerError>,
    recorder: &EventRecorder,
) -> Result<(), RunnerError> {
    match (&test.error, outcome) {
        (Some(expected), Err(RunnerError::Pool(actual))) => {
            if !expected.matches(&actual) {
                return Err(RunnerError::ErrorMismatch {
                    expected: expected.error_type.clone(),
                    actual: actual.to_string(),
                });
            }
        }
        (Some(_), Err(other)) | (None, Err(other)) => return Err(other),
        (Some(expected), Ok(())) => {
            return Err(RunnerError::MissingError(expected.error_type.clone()));
        }
        (None, Ok(())) => {}
    }

    let actual = recorder
        .events()
        .iter()
        .filter(|e| !test.ignore.iter().any(|ignored| ignored == e.event_type()))
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;

    for (index, expected) in test.events.iter().enumerate() {
        let actual = actual.get(index).cloned().unwrap_or(Value::Null);
        if !matches_subset(expected, &actual) {
            return Err(RunnerError::EventMismatch {
                index,
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}
