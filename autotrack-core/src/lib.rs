//! # Autotrack Core
//!
//! Core library for safe instrumentation of third-party training routines.
//! Provides the patch controller and registry, the structural argument
//! validator, the exception-safety declaration API, managed run bracketing,
//! and the adaptive batch metrics logger.
//!
//! Calls into instrumented routines automatically emit tracked parameters
//! and metrics without the caller changing code, under one contract:
//! instrumentation failures never change what the caller observes from the
//! unmodified function (outside test mode, where they are made fatal so
//! they are caught before release).

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod params;
pub mod patch;
pub mod run;
pub mod safety;
pub mod validate;
pub mod value;

// Re-export commonly used types at the crate root.
pub use batch::{BatchMetricsLogger, Clock, ManualClock, SystemClock, batch_metrics_logger};
pub use client::{
    ClientCall, MAX_METRICS_PER_BATCH, MetricPoint, RecordingClient, RunId, RunStatus,
    TrackingClient, best_effort,
};
pub use config::{TEST_MODE_ENV_VAR, config_flag, get_config, is_disabled, is_testing, register_config};
pub use error::{AutotrackError, Result};
pub use params::{
    INPUT_EXAMPLE_SAMPLE_ROWS, log_call_args_as_params, resolve_input_example_and_signature,
};
pub use patch::{
    CallOriginal, CallOutcome, ParamSpec, PatchFn, PatchImpl, PatchRegistry, PatchUnit, TargetFn,
    TargetMetadata, UnitFactory,
};
pub use run::with_managed_run;
pub use safety::{ExceptionSafeFn, SafeUnit};
pub use validate::validate_call_args;
pub use value::{ArgValue, CallArgs};
