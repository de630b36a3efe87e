//! The consumed tracking boundary: run lifecycle and metric/param transport.
//!
//! Everything behind [`TrackingClient`] is an opaque, synchronous remote
//! call. The library never implements storage or transport itself; hosts
//! supply a client, and tests use [`RecordingClient`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::warn;

use crate::config::is_testing;
use crate::error::TransportError;

/// Hard limit on metric points per `log_batch` call, enforced by the batch
/// logger's chunking.
pub const MAX_METRICS_PER_BATCH: usize = 1000;

/// Identifier of a tracked run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a managed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "SUCCEEDED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One recorded metric sample. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub key: String,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub step: i64,
}

impl MetricPoint {
    pub fn new(key: impl Into<String>, value: f64, timestamp_ms: i64, step: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp_ms,
            step,
        }
    }

    /// A point stamped with the current wall clock and step 0.
    pub fn now(key: impl Into<String>, value: f64) -> Self {
        Self::new(key, value, Utc::now().timestamp_millis(), 0)
    }
}

/// Synchronous run-lifecycle and transport boundary.
///
/// Implementations are expected to be cheap to call for `active_run` and may
/// block for the remaining operations.
pub trait TrackingClient: Send + Sync {
    /// The currently active run, if any.
    fn active_run(&self) -> Option<RunId>;

    /// Start a new run and make it the active one.
    fn start_run(&self) -> Result<RunId, TransportError>;

    /// Finalize the active run with the given status.
    fn end_run(&self, status: RunStatus) -> Result<(), TransportError>;

    /// Submit a batch of at most [`MAX_METRICS_PER_BATCH`] metric points.
    fn log_batch(&self, run_id: &RunId, metrics: &[MetricPoint]) -> Result<(), TransportError>;

    /// Submit a set of run parameters.
    fn log_params(
        &self,
        run_id: &RunId,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TransportError>;
}

/// Run a boundary call with the shared best-effort policy: in test mode the
/// failure is re-raised so instrumentation bugs surface before release; in
/// normal operation it is downgraded to a warning and `None` is returned.
pub fn best_effort<T>(
    description: &str,
    f: impl FnOnce() -> Result<T, TransportError>,
) -> Result<Option<T>, TransportError> {
    match f() {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_testing() => Err(e),
        Err(e) => {
            warn!(call = description, error = %e, "Tracking call failed");
            Ok(None)
        }
    }
}

/// Every boundary call a [`RecordingClient`] has observed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    StartRun(RunId),
    EndRun(RunStatus),
    LogBatch(RunId, Vec<MetricPoint>),
    LogParams(RunId, BTreeMap<String, String>),
}

/// In-memory [`TrackingClient`] for tests and examples.
///
/// Records every call and can be armed to fail specific operations.
#[derive(Default)]
pub struct RecordingClient {
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<ClientCall>,
    active: Option<RunId>,
    next_run: u64,
    fail_log_batch: bool,
    fail_start_run: bool,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose active run is already `run_id` at construction.
    pub fn with_active_run(run_id: RunId) -> Self {
        let client = Self::new();
        client.state.lock().unwrap().active = Some(run_id);
        client
    }

    /// Make subsequent `log_batch` calls fail.
    pub fn fail_log_batch(&self) {
        self.state.lock().unwrap().fail_log_batch = true;
    }

    /// Make subsequent `start_run` calls fail.
    pub fn fail_start_run(&self) {
        self.state.lock().unwrap().fail_start_run = true;
    }

    /// All calls observed so far, in order.
    pub fn calls(&self) -> Vec<ClientCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// All metric points submitted across every `log_batch` call, in order.
    pub fn logged_metrics(&self) -> Vec<MetricPoint> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                ClientCall::LogBatch(_, points) => Some(points.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Sizes of each submitted batch, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                ClientCall::LogBatch(_, points) => Some(points.len()),
                _ => None,
            })
            .collect()
    }
}

impl TrackingClient for RecordingClient {
    fn active_run(&self) -> Option<RunId> {
        self.state.lock().unwrap().active.clone()
    }

    fn start_run(&self) -> Result<RunId, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start_run {
            return Err(TransportError::StartRunFailed {
                message: "injected start_run failure".into(),
            });
        }
        state.next_run += 1;
        let run = RunId::new(format!("run-{}", state.next_run));
        state.active = Some(run.clone());
        state.calls.push(ClientCall::StartRun(run.clone()));
        Ok(run)
    }

    fn end_run(&self, status: RunStatus) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.active = None;
        state.calls.push(ClientCall::EndRun(status));
        Ok(())
    }

    fn log_batch(&self, run_id: &RunId, metrics: &[MetricPoint]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_log_batch {
            return Err(TransportError::LogBatchFailed {
                run_id: run_id.to_string(),
                message: "injected log_batch failure".into(),
            });
        }
        state
            .calls
            .push(ClientCall::LogBatch(run_id.clone(), metrics.to_vec()));
        Ok(())
    }

    fn log_params(
        &self,
        run_id: &RunId,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(ClientCall::LogParams(run_id.clone(), params.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Succeeded.to_string(), "SUCCEEDED");
        assert_eq!(RunStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_recording_client_lifecycle() {
        let client = RecordingClient::new();
        assert!(client.active_run().is_none());

        let run = client.start_run().unwrap();
        assert_eq!(client.active_run(), Some(run.clone()));

        client.end_run(RunStatus::Succeeded).unwrap();
        assert!(client.active_run().is_none());
        assert_eq!(
            client.calls(),
            vec![
                ClientCall::StartRun(run),
                ClientCall::EndRun(RunStatus::Succeeded)
            ]
        );
    }

    #[test]
    fn test_best_effort_swallows_outside_test_mode() {
        let _lock = test_support::test_mode_lock();
        let result: Result<Option<()>, TransportError> = best_effort("end_run", || {
            Err(TransportError::EndRunFailed {
                message: "boom".into(),
            })
        });
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn test_best_effort_raises_in_test_mode() {
        let _guard = test_support::enable_test_mode();
        let result: Result<Option<()>, TransportError> = best_effort("end_run", || {
            Err(TransportError::EndRunFailed {
                message: "boom".into(),
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_injected_log_batch_failure() {
        let client = RecordingClient::new();
        client.fail_log_batch();
        let run = RunId::new("r");
        let err = client
            .log_batch(&run, &[MetricPoint::new("loss", 0.5, 0, 0)])
            .unwrap_err();
        assert!(matches!(err, TransportError::LogBatchFailed { .. }));
        assert!(client.logged_metrics().is_empty());
    }
}
