use std::fmt;
use std::time::Duration;

use metrics::counter;
use tokio::task;
use tokio::time;
use tracing::warn;

use crate::error::{ErrorKind, SinkResult};
use crate::metrics::{FUNCTION_LABEL, SINK_USER_FUNCTION_FAILURES_TOTAL};
use crate::sink_error;

/// The user function being invoked, used for error reporting and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Dispatch,
    Map,
    Merge,
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Dispatch => "dispatch",
            FunctionKind::Map => "map",
            FunctionKind::Merge => "merge",
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs user functions on the blocking pool under a deadline.
///
/// User code may be slow, may loop forever, or may panic. None of these take down the engine:
/// a timeout surfaces as [`ErrorKind::UserFunctionTimeout`], a panic as
/// [`ErrorKind::UserFunctionPanic`], and a returned error as [`ErrorKind::UserFunctionFailed`].
///
/// A blocking task cannot be interrupted, so a function that overruns its deadline keeps its
/// thread until it returns. Its result is discarded.
#[derive(Debug, Clone, Copy)]
pub struct FunctionInvoker {
    timeout: Duration,
}

impl FunctionInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn invoke<T, F>(&self, kind: FunctionKind, function: F) -> SinkResult<T>
    where
        F: FnOnce() -> SinkResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = task::spawn_blocking(function);

        let result: SinkResult<T> = match time::timeout(self.timeout, handle).await {
            Ok(Ok(Ok(value))) => return Ok(value),
            Ok(Ok(Err(err))) => Err(sink_error!(
                ErrorKind::UserFunctionFailed,
                "User function failed",
                format!("{kind} function returned an error: {err}"),
                source: err
            )),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(sink_error!(
                ErrorKind::UserFunctionTimeout,
                "User function timed out",
                format!(
                    "{kind} function did not return within {}",
                    humantime::format_duration(self.timeout)
                )
            )),
        };

        if let Err(err) = &result {
            warn!(function = %kind, error = %err, "user function failed");
            counter!(SINK_USER_FUNCTION_FAILURES_TOTAL, FUNCTION_LABEL => kind.as_str())
                .increment(1);
        }

        result
    }
}
