//! Error types for the Autotrack core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering validation, transport, configuration, and patching domains.
//!
//! Failures of an unmodified original function are deliberately not part of
//! this taxonomy: originals fail through their own `anyhow::Error` channel,
//! which the patch controller propagates to the caller verbatim.

use crate::value::ArgValue;

/// Top-level error type for the Autotrack core library.
#[derive(Debug, thiserror::Error)]
pub enum AutotrackError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),
}

/// Errors raised by the structural argument validator when instrumentation
/// alters or unsafely extends the argument list forwarded to an original
/// function. Only evaluated in test mode, where they are always fatal.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{count} expected positional input(s) are missing from the call to the original function")]
    MissingPositional { count: usize },

    #[error("type of input to original function '{actual}' does not match expected type '{expected}'")]
    TypeMismatch { expected: String, actual: String },

    #[error("input to original function does not match expected input. Original: '{actual}'. Expected: '{expected}'")]
    ValueMismatch { expected: String, actual: String },

    #[error("keyword or mapping arguments to original function omit one or more expected keys: {keys:?}")]
    MissingKeys { keys: Vec<String> },

    #[error("new input '{value}' passed to original function is not exception-safe")]
    UnsafeNewInput { value: ArgValue },
}

/// Errors from the consumed metrics / run-lifecycle boundary. Swallowed with
/// a warning in normal operation, re-raised in test mode.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to log metric batch to run '{run_id}': {message}")]
    LogBatchFailed { run_id: String, message: String },

    #[error("failed to log params to run '{run_id}': {message}")]
    LogParamsFailed { run_id: String, message: String },

    #[error("failed to start run: {message}")]
    StartRunFailed { message: String },

    #[error("failed to end run: {message}")]
    EndRunFailed { message: String },

    #[error("no run bound and no active run present")]
    NoActiveRun,
}

/// Errors from integration configuration registration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("integration '{integration}' must declare a boolean 'disable' option, got {value}")]
    InvalidDisableOption {
        integration: String,
        value: serde_json::Value,
    },
}

/// Errors from patch installation and invocation.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("no registered target for '{target}.{method}'")]
    UnknownTarget { target: String, method: String },
}

/// A type alias for results using the top-level [`AutotrackError`].
pub type Result<T> = std::result::Result<T, AutotrackError>;
