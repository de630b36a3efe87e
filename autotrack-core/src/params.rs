//! Best-effort parameter logging and input-example sampling glue.
//!
//! Instrumentation usually wants the arguments of an intercepted training
//! call recorded as run parameters, and a small sample of the training data
//! for signature inference. Both are strictly best-effort: a failure here
//! must never affect the training call it decorates.

use std::collections::BTreeMap;
use tracing::warn;

use crate::client::{RunId, TrackingClient, best_effort};
use crate::error::TransportError;
use crate::patch::TargetMetadata;
use crate::value::{ArgValue, CallArgs};

/// Number of rows sampled from a dataset when gathering an input example.
pub const INPUT_EXAMPLE_SAMPLE_ROWS: usize = 5;

/// Log the arguments of an intercepted call as run parameters.
///
/// Positional arguments are named by zipping them with the target's
/// signature; keyword arguments are taken as-is; parameters the caller did
/// not supply fall back to their signature defaults. Keys listed in
/// `unlogged` are dropped. Submission goes through the shared best-effort
/// policy.
pub fn log_call_args_as_params(
    client: &dyn TrackingClient,
    run_id: &RunId,
    metadata: &TargetMetadata,
    args: &CallArgs,
    unlogged: &[&str],
) -> Result<(), TransportError> {
    let mut params: BTreeMap<String, String> = BTreeMap::new();

    for (spec, value) in metadata.signature.iter().zip(&args.positional) {
        params.insert(spec.name.clone(), render_param(value));
    }
    for (key, value) in &args.keyword {
        params.insert(key.clone(), render_param(value));
    }
    for spec in metadata.signature.iter().skip(args.positional.len()) {
        if !args.keyword.contains_key(&spec.name)
            && let Some(default) = &spec.default
        {
            params.insert(spec.name.clone(), render_param(default));
        }
    }
    params.retain(|key, _| !unlogged.contains(&key.as_str()));

    best_effort("log_params", || client.log_params(run_id, &params)).map(|_| ())
}

fn render_param(value: &ArgValue) -> String {
    match value {
        // Bare string contents read better than the quoted Display form.
        ArgValue::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Gather an input example and infer a model signature, best-effort.
///
/// The example is gathered whenever either output is wanted, because
/// signature inference needs it; failures of either closure are downgraded
/// to warnings. Returns the example only when `log_input_example` is set,
/// and the signature only when inference succeeded.
pub fn resolve_input_example_and_signature<E, S>(
    get_input_example: impl FnOnce() -> anyhow::Result<E>,
    infer_model_signature: impl FnOnce(&E) -> anyhow::Result<S>,
    log_input_example: bool,
    log_model_signature: bool,
) -> (Option<E>, Option<S>) {
    let mut input_example = None;
    let mut failure_msg = None;
    if log_input_example || log_model_signature {
        match get_input_example() {
            Ok(example) => input_example = Some(example),
            Err(e) => failure_msg = Some(e.to_string()),
        }
    }

    let mut model_signature = None;
    if log_model_signature {
        match &input_example {
            Some(example) => match infer_model_signature(example) {
                Ok(signature) => model_signature = Some(signature),
                Err(e) => warn!("Failed to infer model signature: {e}"),
            },
            None => warn!(
                "Failed to infer model signature: could not sample data to infer model signature: {}",
                failure_msg.as_deref().unwrap_or("unknown failure")
            ),
        }
    }

    if log_input_example && let Some(msg) = &failure_msg {
        warn!("Failed to gather input example: {msg}");
    }

    (
        if log_input_example { input_example } else { None },
        model_signature,
    )
}
