//! Adaptive batch metrics logging.
//!
//! Buffers recorded metric points and flushes them as infrequently as
//! possible while keeping instrumentation overhead bounded: a flush happens
//! once cumulative producer time (time between consecutive `record` calls,
//! i.e. observed training time) reaches ten times the cumulative time spent
//! flushing, so logging stays under roughly 10% of wall-clock training time.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::client::{MAX_METRICS_PER_BATCH, MetricPoint, RunId, TrackingClient, best_effort};
use crate::error::TransportError;

/// Fixed producer-to-flush time ratio that triggers a flush. Not
/// externally configurable.
const TARGET_PRODUCER_TO_FLUSH_RATIO: i64 = 10;

/// Millisecond wall-clock source, seam for simulated time in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A manually advanced clock for simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: i64) {
        *self.now_ms.lock().unwrap() += ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.now_ms.lock().unwrap()
    }
}

/// Buffers metric points for one logging scope and flushes them in FIFO
/// order, in contiguous chunks of [`MAX_METRICS_PER_BATCH`].
///
/// If no run is bound at creation, the destination is resolved from the
/// client's currently active run at each flush; callers must guarantee one
/// is active then. An instance is the exclusive resource of one logging
/// scope and must not be shared across concurrent scopes.
pub struct BatchMetricsLogger {
    client: Arc<dyn TrackingClient>,
    clock: Arc<dyn Clock>,
    run_id: Option<RunId>,
    buffer: Vec<MetricPoint>,
    total_producer_ms: i64,
    total_flush_ms: i64,
    previous_record_ms: Option<i64>,
}

impl BatchMetricsLogger {
    pub fn new(client: Arc<dyn TrackingClient>, run_id: Option<RunId>) -> Self {
        Self::with_clock(client, run_id, Arc::new(SystemClock))
    }

    pub fn with_clock(
        client: Arc<dyn TrackingClient>,
        run_id: Option<RunId>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            clock,
            run_id,
            buffer: Vec::new(),
            total_producer_ms: 0,
            total_flush_ms: 0,
            previous_record_ms: None,
        }
    }

    /// Submit a set of metrics to be logged, stamped with the current time
    /// and the given step (0 when unspecified).
    ///
    /// The metrics may not be logged immediately: the elapsed time since the
    /// previous `record` call (zero on the first call, which never flushes)
    /// is added to cumulative producer time, and a flush is triggered only
    /// once the overhead ratio allows it.
    pub fn record<I>(&mut self, metrics: I, step: Option<i64>) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let now = self.clock.now_ms();
        let first_call = self.previous_record_ms.is_none();
        self.total_producer_ms += self.previous_record_ms.map_or(0, |prev| now - prev);

        let step = step.unwrap_or(0);
        for (key, value) in metrics {
            self.buffer.push(MetricPoint::new(key, value, now, step));
        }

        if !first_call && self.should_flush() {
            self.flush()?;
        }
        self.previous_record_ms = Some(now);
        Ok(())
    }

    fn should_flush(&self) -> bool {
        self.total_producer_ms >= self.total_flush_ms * TARGET_PRODUCER_TO_FLUSH_RATIO
    }

    /// Submit every buffered point to the destination run.
    ///
    /// Chunks are submitted in order under the best-effort policy; the
    /// buffer is cleared afterwards regardless of swallowed chunk failures.
    /// Wall time spent here is added to cumulative flush time.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let run_id = match &self.run_id {
            Some(run_id) => run_id.clone(),
            None => self.client.active_run().ok_or(TransportError::NoActiveRun)?,
        };

        let start = self.clock.now_ms();
        let result = self
            .buffer
            .chunks(MAX_METRICS_PER_BATCH)
            .try_for_each(|chunk| {
                best_effort("log_batch", || self.client.log_batch(&run_id, chunk)).map(|_| ())
            });
        self.total_flush_ms += self.clock.now_ms() - start;
        self.buffer.clear();
        result
    }

    /// Number of points currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Drop for BatchMetricsLogger {
    /// Backstop for scopes that end without an explicit final flush.
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            if let Err(e) = self.flush() {
                warn!(error = %e, "Final metrics flush failed");
            }
        }
    }
}

/// Run `scope` with a fresh [`BatchMetricsLogger`] and guarantee a final
/// flush on every exit path, so no buffered point outlives the scope.
///
/// A scope error takes precedence over a final-flush error.
pub fn batch_metrics_logger<T>(
    client: Arc<dyn TrackingClient>,
    run_id: Option<RunId>,
    scope: impl FnOnce(&mut BatchMetricsLogger) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut logger = BatchMetricsLogger::new(client, run_id);
    let result = scope(&mut logger);
    let flush_result = logger.flush();
    let value = result?;
    flush_result?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientCall, RecordingClient, RunStatus};
    use crate::config::test_support;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    /// Decorates a client so each log_batch call advances the simulated
    /// clock by a fixed cost.
    struct SlowTransport {
        inner: RecordingClient,
        clock: Arc<ManualClock>,
        cost_ms: i64,
    }

    impl TrackingClient for SlowTransport {
        fn active_run(&self) -> Option<RunId> {
            self.inner.active_run()
        }
        fn start_run(&self) -> Result<RunId, TransportError> {
            self.inner.start_run()
        }
        fn end_run(&self, status: RunStatus) -> Result<(), TransportError> {
            self.inner.end_run(status)
        }
        fn log_batch(&self, run_id: &RunId, metrics: &[MetricPoint]) -> Result<(), TransportError> {
            self.clock.advance(self.cost_ms);
            self.inner.log_batch(run_id, metrics)
        }
        fn log_params(
            &self,
            run_id: &RunId,
            params: &BTreeMap<String, String>,
        ) -> Result<(), TransportError> {
            self.inner.log_params(run_id, params)
        }
    }

    fn metrics(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_first_record_never_flushes() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        let clock = Arc::new(ManualClock::new());
        let mut logger = BatchMetricsLogger::with_clock(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
            clock,
        );

        logger.record(metrics(&[("loss", 1.0)]), None).unwrap();
        assert_eq!(logger.buffered(), 1);
        assert!(client.logged_metrics().is_empty());
        std::mem::forget(logger); // Keep the drop backstop out of this test.
    }

    #[test]
    fn test_flush_ratio_simulation() {
        let _lock = test_support::test_mode_lock();
        let clock = Arc::new(ManualClock::new());
        let client = Arc::new(SlowTransport {
            inner: RecordingClient::new(),
            clock: Arc::clone(&clock),
            cost_ms: 100,
        });
        let mut logger = BatchMetricsLogger::with_clock(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        // First record: zero elapsed time, no flush.
        logger.record(metrics(&[("loss", 1.0)]), Some(0)).unwrap();
        assert_eq!(client.inner.batch_sizes(), Vec::<usize>::new());

        // 50ms of training. Producer 50 >= 10 * 0 flush time: flush, which
        // costs 100ms of transport time.
        clock.advance(50);
        logger.record(metrics(&[("loss", 0.9)]), Some(1)).unwrap();
        assert_eq!(client.inner.batch_sizes(), vec![2]);

        // The 100ms flush counts towards the next observed gap: producer
        // 50 + (100 + 400) = 550 < 10 * 100, so this stays buffered.
        clock.advance(400);
        logger.record(metrics(&[("loss", 0.8)]), Some(2)).unwrap();
        assert_eq!(client.inner.batch_sizes(), vec![2]);

        // Producer 550 + 600 = 1150 >= 10 * 100: flush again.
        clock.advance(600);
        logger.record(metrics(&[("loss", 0.7)]), Some(3)).unwrap();
        assert_eq!(client.inner.batch_sizes(), vec![2, 2]);
    }

    #[test]
    fn test_points_flushed_in_fifo_chunks() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        let mut logger = BatchMetricsLogger::new(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
        );

        let many: Vec<(String, f64)> = (0..2500).map(|i| (format!("m{i}"), i as f64)).collect();
        logger.record(many, Some(7)).unwrap();
        logger.flush().unwrap();

        assert_eq!(client.batch_sizes(), vec![1000, 1000, 500]);
        let logged = client.logged_metrics();
        assert_eq!(logged.len(), 2500);
        assert_eq!(logged[0].key, "m0");
        assert_eq!(logged[2499].key, "m2499");
        assert!(logged.iter().all(|p| p.step == 7));
        assert_eq!(logger.buffered(), 0);
    }

    #[test]
    fn test_unbound_logger_resolves_active_run_at_flush() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::with_active_run(RunId::new("active-1")));
        let mut logger =
            BatchMetricsLogger::new(Arc::clone(&client) as Arc<dyn TrackingClient>, None);

        logger.record(metrics(&[("acc", 0.5)]), None).unwrap();
        logger.flush().unwrap();
        assert_eq!(
            client.calls(),
            vec![ClientCall::LogBatch(
                RunId::new("active-1"),
                client.logged_metrics()
            )]
        );
    }

    #[test]
    fn test_flush_without_any_run_is_an_error() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        let mut logger =
            BatchMetricsLogger::new(Arc::clone(&client) as Arc<dyn TrackingClient>, None);
        logger.record(metrics(&[("acc", 0.5)]), None).unwrap();

        let err = logger.flush().unwrap_err();
        assert!(matches!(err, TransportError::NoActiveRun));
        std::mem::forget(logger);
    }

    #[test]
    fn test_swallowed_transport_failure_still_clears_buffer() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        client.fail_log_batch();
        let mut logger = BatchMetricsLogger::new(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
        );

        logger.record(metrics(&[("loss", 1.0)]), None).unwrap();
        logger.flush().unwrap();
        assert_eq!(logger.buffered(), 0);
        assert!(client.logged_metrics().is_empty());
    }

    #[test]
    fn test_transport_failure_raises_in_test_mode() {
        let _guard = test_support::enable_test_mode();
        let client = Arc::new(RecordingClient::new());
        client.fail_log_batch();
        let mut logger = BatchMetricsLogger::new(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
        );

        logger.record(metrics(&[("loss", 1.0)]), None).unwrap();
        let err = logger.flush().unwrap_err();
        assert!(matches!(err, TransportError::LogBatchFailed { .. }));
    }

    #[test]
    fn test_scope_flushes_on_success() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        let out = batch_metrics_logger(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
            |logger| {
                logger.record(metrics(&[("loss", 0.4)]), Some(1))?;
                Ok(42)
            },
        )
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(client.logged_metrics().len(), 1);
    }

    #[test]
    fn test_scope_flushes_on_error_path() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        let result: anyhow::Result<()> = batch_metrics_logger(
            Arc::clone(&client) as Arc<dyn TrackingClient>,
            Some(RunId::new("r")),
            |logger| {
                logger.record(metrics(&[("loss", 0.4)]), Some(1))?;
                anyhow::bail!("training interrupted")
            },
        );
        assert_eq!(result.unwrap_err().to_string(), "training interrupted");
        assert_eq!(client.logged_metrics().len(), 1);
    }

    #[test]
    fn test_drop_backstop_flushes_remaining_points() {
        let _lock = test_support::test_mode_lock();
        let client = Arc::new(RecordingClient::new());
        {
            let mut logger = BatchMetricsLogger::new(
                Arc::clone(&client) as Arc<dyn TrackingClient>,
                Some(RunId::new("r")),
            );
            logger.record(metrics(&[("loss", 0.4)]), None).unwrap();
        }
        assert_eq!(client.logged_metrics().len(), 1);
    }
}
